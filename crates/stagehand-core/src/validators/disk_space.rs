use crate::dispatch::Subscriber;
use crate::event::{EventType, Severity, StageEvent, ValidationResult};
use crate::SubscriberError;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type FreeSpaceFn = dyn Fn(&Path) -> io::Result<u64> + Send + Sync;

const MIB: u64 = 1024 * 1024;

/// Refuses to start when the active directory or the staging root is short
/// on free space.
pub struct DiskSpaceValidator {
    min_free_bytes: u64,
    staging_root: PathBuf,
    free_space: Arc<FreeSpaceFn>,
}

impl DiskSpaceValidator {
    pub fn new(min_free_bytes: u64, staging_root: impl Into<PathBuf>) -> Self {
        Self {
            min_free_bytes,
            staging_root: staging_root.into(),
            free_space: Arc::new(|path: &Path| fs2::available_space(path)),
        }
    }

    /// Replace the free-space lookup.
    #[must_use]
    pub fn with_free_space(mut self, free_space: Arc<FreeSpaceFn>) -> Self {
        self.free_space = free_space;
        self
    }

    fn is_short(&self, path: &Path) -> Result<bool, SubscriberError> {
        Ok((self.free_space)(path)? < self.min_free_bytes)
    }
}

/// The staging root may not exist yet; measure the closest ancestor that does.
fn nearest_existing(path: &Path) -> &Path {
    path.ancestors().find(|p| p.exists()).unwrap_or(path)
}

#[cfg(unix)]
fn same_filesystem(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (a.metadata(), b.metadata()) {
        (Ok(a), Ok(b)) => a.dev() == b.dev(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_filesystem(_a: &Path, _b: &Path) -> bool {
    false
}

impl Subscriber for DiskSpaceValidator {
    fn name(&self) -> &'static str {
        "disk_space"
    }

    fn subscriptions(&self) -> Vec<(EventType, i32)> {
        vec![
            (EventType::PreCreate, 0),
            (EventType::PreApply, 0),
            (EventType::StatusCheck, 0),
        ]
    }

    fn handle(&self, event: &mut StageEvent) -> Result<(), SubscriberError> {
        let active = event.context().active_dir.clone();
        let staging = nearest_existing(&self.staging_root);
        let needed = self.min_free_bytes.div_ceil(MIB);

        if same_filesystem(&active, staging) {
            if self.is_short(&active)? {
                event.add_error(format!(
                    "There is not enough free disk space for {}. There must be at least {needed} MB free.",
                    active.display()
                ));
            }
            return Ok(());
        }

        let mut messages = Vec::new();
        if self.is_short(&active)? {
            messages.push(format!(
                "The active directory {} has insufficient space. There must be at least {needed} MB free.",
                active.display()
            ));
        }
        if self.is_short(staging)? {
            messages.push(format!(
                "The staging root {} has insufficient space. There must be at least {needed} MB free.",
                self.staging_root.display()
            ));
        }
        let summary = (messages.len() > 1)
            .then(|| "There is not enough disk space to create a stage.".to_owned());
        if let Some(result) = ValidationResult::new(Severity::Error, messages, summary) {
            event.add_result(result);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::validators::testing::event;

    fn free_space_of(free: u64) -> Arc<FreeSpaceFn> {
        Arc::new(move |_: &Path| Ok::<u64, io::Error>(free))
    }

    #[test]
    fn enough_space_passes() {
        let dir = tempfile::tempdir().unwrap();
        let validator =
            DiskSpaceValidator::new(10 * MIB, dir.path().join("stages")).with_free_space(free_space_of(20 * MIB));
        let mut e = event(EventKind::PreCreate, dir.path(), None);
        validator.handle(&mut e).unwrap();
        assert!(e.results().is_empty());
    }

    #[test]
    fn shortage_on_shared_filesystem_reports_once() {
        let dir = tempfile::tempdir().unwrap();
        let validator =
            DiskSpaceValidator::new(10 * MIB, dir.path().join("stages")).with_free_space(free_space_of(MIB));
        let mut e = event(EventKind::PreApply, dir.path(), None);
        validator.handle(&mut e).unwrap();
        assert_eq!(e.results().len(), 1);
        assert!(e.results()[0].messages()[0].contains("10 MB"));
    }

    #[test]
    fn free_space_failure_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let validator = DiskSpaceValidator::new(MIB, dir.path())
            .with_free_space(Arc::new(|_: &Path| Err::<u64, _>(io::Error::other("statvfs failed"))));
        let mut e = event(EventKind::StatusCheck, dir.path(), None);
        assert!(validator.handle(&mut e).is_err());
    }

    #[test]
    fn nearest_existing_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("a/b/c");
        assert_eq!(nearest_existing(&missing), dir.path());
    }
}
