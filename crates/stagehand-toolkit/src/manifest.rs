use crate::ToolkitError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Project manifest file name, at the root of an active or staging directory.
pub const MANIFEST_FILE: &str = "manifest.json";
/// Lock file name, next to the manifest.
pub const LOCK_FILE: &str = "manifest.lock";
/// Installed-package index, inside the vendor directory.
pub const INSTALLED_FILE: &str = "installed.json";

/// The project manifest: direct runtime and dev requirements plus whatever
/// other top-level keys the package manager keeps there.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub require: BTreeMap<String, String>,
    #[serde(default, rename = "require-dev")]
    pub require_dev: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Manifest {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    /// Read the manifest in `dir`. A missing file yields an empty manifest.
    pub fn read(dir: &Path) -> Result<Self, ToolkitError> {
        let path = Self::path_in(dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map_err(|e| ToolkitError::Manifest(format!("{}: {e}", path.display())))
    }

    pub fn write(&self, dir: &Path) -> Result<(), ToolkitError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(Self::path_in(dir), content)?;
        Ok(())
    }

    /// Look up a dotted key under the `config` object, e.g. `allow-plugins.x`.
    pub fn config_value(&self, key: &str) -> Option<&serde_json::Value> {
        let mut current = self.extra.get("config")?;
        for part in key.split('.') {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }
}

/// One entry of the installed-package index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    /// Install path relative to the vendor directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackages {
    #[serde(default)]
    pub packages: Vec<InstalledPackage>,
}

impl InstalledPackages {
    pub fn path_in(vendor_dir: &Path) -> PathBuf {
        vendor_dir.join(INSTALLED_FILE)
    }

    /// Read the index from `vendor_dir`. A missing index means nothing is installed.
    pub fn read(vendor_dir: &Path) -> Result<Self, ToolkitError> {
        let path = Self::path_in(vendor_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map_err(|e| ToolkitError::Manifest(format!("{}: {e}", path.display())))
    }

    pub fn write(&self, vendor_dir: &Path) -> Result<(), ToolkitError> {
        fs::create_dir_all(vendor_dir)?;
        let content = serde_json::to_string_pretty(self)?;
        fs::write(Self::path_in(vendor_dir), content)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&InstalledPackage> {
        self.packages.iter().find(|p| p.name == name)
    }

    /// Insert or replace by name, keeping the list sorted.
    pub fn upsert(&mut self, package: InstalledPackage) {
        self.packages.retain(|p| p.name != package.name);
        self.packages.push(package);
        self.packages.sort_by(|a, b| a.name.cmp(&b.name));
    }
}
