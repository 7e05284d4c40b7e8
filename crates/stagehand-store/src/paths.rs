use crate::StoreError;
use std::path::{Component, Path, PathBuf};

/// Read-only lookup of the live ("active") installation's well-known paths.
#[derive(Debug, Clone)]
pub struct PathLocator {
    project_root: PathBuf,
    vendor_dir: PathBuf,
    web_root: PathBuf,
}

impl PathLocator {
    /// `vendor_dir` and `web_root` are relative to `project_root`.
    pub fn new(
        project_root: impl Into<PathBuf>,
        vendor_dir: impl AsRef<Path>,
        web_root: impl AsRef<Path>,
    ) -> Result<Self, StoreError> {
        let project_root = project_root.into();
        if !project_root.is_absolute() {
            return Err(StoreError::InvalidPath(format!(
                "project root must be absolute: {}",
                project_root.display()
            )));
        }
        let vendor_dir = normalize_relative(vendor_dir.as_ref())?;
        let web_root = normalize_relative(web_root.as_ref())?;
        Ok(Self {
            project_root,
            vendor_dir,
            web_root,
        })
    }

    #[inline]
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Dependency directory relative to the project root.
    #[inline]
    pub fn vendor_relative(&self) -> &Path {
        &self.vendor_dir
    }

    #[inline]
    pub fn vendor_dir(&self) -> PathBuf {
        self.project_root.join(&self.vendor_dir)
    }

    /// Web-exposed subdirectory relative to the project root. Empty when the
    /// project root itself is served.
    #[inline]
    pub fn web_root_relative(&self) -> &Path {
        &self.web_root
    }

    #[inline]
    pub fn web_root(&self) -> PathBuf {
        self.project_root.join(&self.web_root)
    }

    /// If `path` lives inside the project root, return it relative to the root.
    pub fn relative_to_root(&self, path: &Path) -> Option<PathBuf> {
        path.strip_prefix(&self.project_root)
            .ok()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
    }
}

/// Reject absolute paths and `..` components; strip `.` components.
pub fn normalize_relative(path: &Path) -> Result<PathBuf, StoreError> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StoreError::InvalidPath(format!(
                    "expected a relative path without '..': {}",
                    path.display()
                )));
            }
        }
    }
    Ok(out)
}
