use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current state directory format version. Incremented on incompatible changes.
pub const STATE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout of the stagehand state directory.
///
/// Holds the ownership record, the destroyed-stage ledger, the unattended run
/// ledger and the cross-process lock file. Staging copies live under
/// [`staging_root`](Self::staging_root), which defaults to `<state>/stages`.
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
    staging_root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateVersion {
    format_version: u32,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let staging_root = root.join("stages");
        Self { root, staging_root }
    }

    #[must_use]
    pub fn with_staging_root(mut self, staging_root: impl Into<PathBuf>) -> Self {
        self.staging_root = staging_root.into();
        self
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    #[inline]
    pub fn stage_dir(&self, stage_id: &str) -> PathBuf {
        self.staging_root.join(stage_id)
    }

    #[inline]
    pub fn ownership_file(&self) -> PathBuf {
        self.root.join("ownership.json")
    }

    #[inline]
    pub fn destroyed_file(&self) -> PathBuf {
        self.root.join("destroyed.json")
    }

    #[inline]
    pub fn run_ledger_file(&self) -> PathBuf {
        self.root.join("unattended.json")
    }

    #[inline]
    pub fn active_lock_hash_file(&self) -> PathBuf {
        self.root.join("active-lock.hash")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(&self.staging_root)?;

        let version_path = self.root.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            crate::write_json_atomic(
                &version_path,
                &StateVersion {
                    format_version: STATE_FORMAT_VERSION,
                },
            )?;
        }
        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let content = fs::read_to_string(self.root.join(VERSION_FILE))?;
        let ver: StateVersion = serde_json::from_str(&content)?;
        if ver.format_version != STATE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STATE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_correct() {
        let layout = StateLayout::new("/var/lib/stagehand");
        assert_eq!(
            layout.staging_root(),
            Path::new("/var/lib/stagehand/stages")
        );
        assert_eq!(
            layout.stage_dir("abc"),
            PathBuf::from("/var/lib/stagehand/stages/abc")
        );
        assert_eq!(
            layout.ownership_file(),
            PathBuf::from("/var/lib/stagehand/ownership.json")
        );
        assert_eq!(
            layout.lock_file(),
            PathBuf::from("/var/lib/stagehand/.lock")
        );
    }

    #[test]
    fn custom_staging_root() {
        let layout = StateLayout::new("/var/lib/stagehand").with_staging_root("/scratch/stages");
        assert_eq!(layout.stage_dir("x"), PathBuf::from("/scratch/stages/x"));
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateLayout::new(dir.path());
        layout.initialize().unwrap();
        layout.initialize().unwrap();
        layout.verify_version().unwrap();
        assert!(layout.staging_root().is_dir());
    }

    #[test]
    fn version_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateLayout::new(dir.path());
        layout.initialize().unwrap();
        fs::write(dir.path().join("version"), r#"{"format_version": 99}"#).unwrap();
        assert!(matches!(
            layout.verify_version(),
            Err(StoreError::VersionMismatch { found: 99, .. })
        ));
    }
}
