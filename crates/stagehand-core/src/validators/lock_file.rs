use crate::dispatch::Subscriber;
use crate::event::{EventType, StageEvent};
use crate::SubscriberError;
use stagehand_toolkit::{PackageInspector, LOCK_FILE};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Detects changes made to the active lock file behind the stage's back.
///
/// The hash of the active lock file is recorded once the stage has been
/// created. Any later mismatch while that stage is in flight means packages were changed outside the stage and
/// applying it would silently undo them.
pub struct LockFileValidator {
    inspector: Arc<dyn PackageInspector>,
    hash_file: PathBuf,
}

impl LockFileValidator {
    pub fn new(inspector: Arc<dyn PackageInspector>, hash_file: impl Into<PathBuf>) -> Self {
        Self {
            inspector,
            hash_file: hash_file.into(),
        }
    }

    fn lock_hash(&self, dir: &Path) -> Result<Option<String>, SubscriberError> {
        Ok(self
            .inspector
            .lock_file(dir)?
            .map(|bytes| blake3::hash(&bytes).to_hex().to_string()))
    }

    fn stored_hash(&self) -> Result<Option<String>, SubscriberError> {
        match fs::read_to_string(&self.hash_file) {
            Ok(hash) => Ok(Some(hash.trim().to_owned())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store_hash(&self, hash: &str) -> Result<(), SubscriberError> {
        if let Some(parent) = self.hash_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.hash_file, hash)?;
        Ok(())
    }

    fn clear_hash(&self) -> Result<(), SubscriberError> {
        match fs::remove_file(&self.hash_file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Subscriber for LockFileValidator {
    fn name(&self) -> &'static str {
        "lock_file"
    }

    fn subscriptions(&self) -> Vec<(EventType, i32)> {
        vec![
            (EventType::PreCreate, 0),
            (EventType::PostCreate, 0),
            (EventType::PreRequire, 0),
            (EventType::PreApply, 0),
            (EventType::PostApply, 0),
            (EventType::PostDestroy, 0),
            (EventType::StatusCheck, 0),
        ]
    }

    fn handle(&self, event: &mut StageEvent) -> Result<(), SubscriberError> {
        let event_type = event.event_type();
        let active = event.context().active_dir.clone();

        match event_type {
            EventType::PreCreate => {
                if self.lock_hash(&active)?.is_none() {
                    event.add_error(format!("The active lock file ({LOCK_FILE}) does not exist."));
                }
            }
            EventType::PostCreate => {
                if let Some(hash) = self.lock_hash(&active)? {
                    self.store_hash(&hash)?;
                    debug!("recorded active lock file hash {hash}");
                }
            }
            EventType::PostApply | EventType::PostDestroy => self.clear_hash()?,
            EventType::StatusCheck if event.context().stage_id.is_none() => {}
            EventType::PreRequire | EventType::PreApply | EventType::StatusCheck => {
                let Some(stored) = self.stored_hash()? else {
                    if event_type != EventType::StatusCheck {
                        event.add_error("Could not find the recorded hash of the active lock file.");
                    }
                    return Ok(());
                };
                if self.lock_hash(&active)?.as_deref() != Some(stored.as_str()) {
                    event.add_error(
                        "Unexpected changes were detected in the active lock file, which indicates that packages were installed, updated or removed outside of the stage.",
                    );
                    return Ok(());
                }
                if event_type == EventType::PreApply {
                    if let Some(stage_dir) = event.context().stage_dir.clone() {
                        if self.inspector.lock_file(&stage_dir)? == self.inspector.lock_file(&active)? {
                            event.add_error("There are no pending changes to apply.");
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}
