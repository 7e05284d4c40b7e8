use crate::ToolkitError;
use stagehand_store::normalize_relative;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Paths, relative to the active directory, that begin and commit skip.
///
/// An entry excludes itself and everything beneath it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludedPaths {
    paths: BTreeSet<PathBuf>,
}

impl ExcludedPaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a relative path. Absolute paths and `..` are rejected; an empty
    /// path would exclude the whole tree and is ignored.
    pub fn add(&mut self, path: impl AsRef<Path>) -> Result<(), ToolkitError> {
        let normalized = normalize_relative(path.as_ref())
            .map_err(|e| ToolkitError::InvalidPath(e.to_string()))?;
        if !normalized.as_os_str().is_empty() {
            self.paths.insert(normalized);
        }
        Ok(())
    }

    pub fn extend<I, P>(&mut self, paths: I) -> Result<(), ToolkitError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        for p in paths {
            self.add(p)?;
        }
        Ok(())
    }

    pub fn matches(&self, relative: &Path) -> bool {
        self.paths.iter().any(|p| relative.starts_with(p))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.paths.iter().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
