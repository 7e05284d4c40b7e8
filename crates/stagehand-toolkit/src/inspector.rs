use crate::manifest::{InstalledPackage, InstalledPackages, Manifest, LOCK_FILE};
use crate::ToolkitError;
use std::fs;
use std::path::{Path, PathBuf};

/// Read-only queries against an active or staging directory.
pub trait PackageInspector: Send + Sync {
    fn installed_packages(&self, dir: &Path) -> Result<Vec<InstalledPackage>, ToolkitError>;

    fn installed_package(
        &self,
        dir: &Path,
        name: &str,
    ) -> Result<Option<InstalledPackage>, ToolkitError> {
        Ok(self
            .installed_packages(dir)?
            .into_iter()
            .find(|p| p.name == name))
    }

    fn config_value(&self, dir: &Path, key: &str)
        -> Result<Option<serde_json::Value>, ToolkitError>;

    /// Problems with the manifest in `dir`. Empty means it is valid.
    fn validate(&self, dir: &Path) -> Vec<String>;

    /// Raw lock file bytes, if a lock file exists.
    fn lock_file(&self, dir: &Path) -> Result<Option<Vec<u8>>, ToolkitError>;
}

/// Inspects `manifest.json`, `manifest.lock` and the vendor index directly.
#[derive(Debug, Clone)]
pub struct ManifestInspector {
    vendor_dir: PathBuf,
}

impl ManifestInspector {
    /// `vendor_dir` is relative to the inspected directory.
    pub fn new(vendor_dir: impl Into<PathBuf>) -> Self {
        Self {
            vendor_dir: vendor_dir.into(),
        }
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

impl PackageInspector for ManifestInspector {
    fn installed_packages(&self, dir: &Path) -> Result<Vec<InstalledPackage>, ToolkitError> {
        Ok(InstalledPackages::read(&dir.join(&self.vendor_dir))?.packages)
    }

    fn config_value(
        &self,
        dir: &Path,
        key: &str,
    ) -> Result<Option<serde_json::Value>, ToolkitError> {
        Ok(Manifest::read(dir)?.config_value(key).cloned())
    }

    fn validate(&self, dir: &Path) -> Vec<String> {
        let manifest = match Manifest::read(dir) {
            Ok(m) => m,
            Err(e) => return vec![e.to_string()],
        };
        let mut problems = Vec::new();
        for (section, entries) in [("require", &manifest.require), ("require-dev", &manifest.require_dev)] {
            for (name, constraint) in entries {
                if !is_valid_name(name) {
                    problems.push(format!("{section}: invalid package name '{name}'"));
                }
                if constraint.trim().is_empty() {
                    problems.push(format!("{section}: empty version constraint for '{name}'"));
                }
            }
        }
        for name in manifest.require.keys() {
            if manifest.require_dev.contains_key(name) {
                problems.push(format!("'{name}' is listed in both require and require-dev"));
            }
        }
        problems
    }

    fn lock_file(&self, dir: &Path) -> Result<Option<Vec<u8>>, ToolkitError> {
        match fs::read(dir.join(LOCK_FILE)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
