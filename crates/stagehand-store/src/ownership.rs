use crate::layout::StateLayout;
use crate::types::{OwnerToken, StageId};
use crate::StoreError;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Number of destroyed-stage entries kept for diagnostics.
const DESTROYED_HISTORY: usize = 50;

/// Lifecycle phase of a claimed stage. `Available` and `Destroyed` are
/// represented by the absence of an ownership record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StagePhase {
    Created,
    Required,
    Applying,
    Applied,
}

impl std::fmt::Display for StagePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StagePhase::Created => write!(f, "created"),
            StagePhase::Required => write!(f, "required"),
            StagePhase::Applying => write!(f, "applying"),
            StagePhase::Applied => write!(f, "applied"),
        }
    }
}

/// The persisted claim on the single in-flight stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnershipRecord {
    pub stage_id: StageId,
    pub owner: OwnerToken,
    pub stage_type: String,
    pub staging_root: PathBuf,
    pub phase: StagePhase,
    pub claimed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_started_at: Option<DateTime<Utc>>,
    /// Secret handed to the post-apply continuation so it can re-claim the
    /// stage under a different identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_key: Option<String>,
    #[serde(default)]
    pub post_apply_done: bool,
}

impl OwnershipRecord {
    pub fn new(
        stage_id: StageId,
        owner: OwnerToken,
        stage_type: &str,
        staging_root: impl Into<PathBuf>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            stage_id,
            owner,
            stage_type: stage_type.to_owned(),
            staging_root: staging_root.into(),
            phase: StagePhase::Created,
            claimed_at: now,
            expires_at: None,
            apply_started_at: None,
            continuation_key: None,
            post_apply_done: false,
        }
    }

    #[must_use]
    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }

    pub fn stage_dir(&self) -> PathBuf {
        self.staging_root.join(self.stage_id.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DestroyedEntry {
    stage_id: StageId,
    reason: String,
}

/// Durable, cross-request mutual exclusion for the in-flight stage.
///
/// Implementations must persist beyond a single process: an apply is
/// completed by a follow-up request that has to see the same claim.
pub trait OwnershipStore: Send + Sync {
    /// The active claim. Expired records are treated as absent.
    fn current(&self, now: DateTime<Utc>) -> Result<Option<OwnershipRecord>, StoreError>;

    /// The stored record, expired or not.
    fn recorded(&self) -> Result<Option<OwnershipRecord>, StoreError>;

    /// Record `record` as the active claim. Fails with
    /// [`StoreError::AlreadyClaimed`] if a different, unexpired stage holds it.
    /// An expired stage that is taken over has its directory removed.
    fn claim(&self, record: OwnershipRecord, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Overwrite the active claim. The stage id must match the stored one.
    fn update(&self, record: &OwnershipRecord) -> Result<(), StoreError>;

    /// Drop the claim held by `stage_id`. No-op when nothing is claimed.
    fn release(&self, stage_id: &StageId) -> Result<(), StoreError>;

    fn record_destroyed(&self, stage_id: &StageId, reason: &str) -> Result<(), StoreError>;

    fn destroyed_reason(&self, stage_id: &StageId) -> Result<Option<String>, StoreError>;

    fn owner(&self, now: DateTime<Utc>) -> Result<Option<OwnerToken>, StoreError> {
        Ok(self.current(now)?.map(|r| r.owner))
    }

    fn staging_root(&self, now: DateTime<Utc>) -> Result<Option<PathBuf>, StoreError> {
        Ok(self.current(now)?.map(|r| r.staging_root))
    }
}

/// Returns the expired claim `incoming` displaces, if any.
fn check_claim(
    existing: Option<&OwnershipRecord>,
    incoming: &OwnershipRecord,
    now: DateTime<Utc>,
) -> Result<Option<OwnershipRecord>, StoreError> {
    match existing {
        Some(current) if current.stage_id != incoming.stage_id && !current.is_expired(now) => {
            Err(StoreError::AlreadyClaimed {
                existing: current.stage_id.clone(),
                owner: current.owner.clone(),
            })
        }
        Some(current) if current.stage_id != incoming.stage_id => {
            warn!(
                "overriding expired claim on stage {} held by {}",
                current.stage_id, current.owner
            );
            Ok(Some(current.clone()))
        }
        _ => Ok(None),
    }
}

const EXPIRED_REASON: &str = "claim expired";

fn remove_expired_stage(record: &OwnershipRecord) {
    let dir = record.stage_dir();
    if !dir.exists() {
        return;
    }
    match fs::remove_dir_all(&dir) {
        Ok(()) => debug!("removed expired stage directory {}", dir.display()),
        Err(e) => warn!("could not remove expired stage directory {}: {e}", dir.display()),
    }
}

fn push_destroyed(entries: &mut Vec<DestroyedEntry>, stage_id: &StageId, reason: &str) {
    entries.retain(|e| e.stage_id != *stage_id);
    entries.push(DestroyedEntry {
        stage_id: stage_id.clone(),
        reason: reason.to_owned(),
    });
    if entries.len() > DESTROYED_HISTORY {
        let excess = entries.len() - DESTROYED_HISTORY;
        entries.drain(..excess);
    }
}

/// Ownership store backed by JSON files in the state directory.
///
/// Every read-modify-write runs under an exclusive `flock` on the state
/// lock file, so racing processes observe a single winner.
pub struct FileOwnershipStore {
    layout: StateLayout,
}

struct StateLock {
    file: File,
}

impl StateLock {
    fn acquire(layout: &StateLayout) -> Result<Self, StoreError> {
        fs::create_dir_all(layout.root())?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(layout.lock_file())?;
        file.lock_exclusive()
            .map_err(|e| StoreError::LockFailed(e.to_string()))?;
        Ok(Self { file })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl FileOwnershipStore {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    fn read_record(&self) -> Result<Option<OwnershipRecord>, StoreError> {
        let path = self.layout.ownership_file();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn read_destroyed(&self) -> Result<Vec<DestroyedEntry>, StoreError> {
        let path = self.layout.destroyed_file();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)?;
        match serde_json::from_str(&content) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                // Diagnostics only; a damaged ledger must not block stage work.
                warn!("discarding unreadable destroyed-stage ledger: {e}");
                Ok(Vec::new())
            }
        }
    }
}

impl OwnershipStore for FileOwnershipStore {
    fn current(&self, now: DateTime<Utc>) -> Result<Option<OwnershipRecord>, StoreError> {
        let _lock = StateLock::acquire(&self.layout)?;
        Ok(self.read_record()?.filter(|r| !r.is_expired(now)))
    }

    fn recorded(&self) -> Result<Option<OwnershipRecord>, StoreError> {
        let _lock = StateLock::acquire(&self.layout)?;
        self.read_record()
    }

    fn claim(&self, record: OwnershipRecord, now: DateTime<Utc>) -> Result<(), StoreError> {
        let _lock = StateLock::acquire(&self.layout)?;
        let existing = self.read_record()?;
        let evicted = check_claim(existing.as_ref(), &record, now)?;
        crate::write_json_atomic(&self.layout.ownership_file(), &record)?;
        debug!("stage {} claimed by {}", record.stage_id, record.owner);
        if let Some(expired) = evicted {
            remove_expired_stage(&expired);
            let mut entries = self.read_destroyed()?;
            push_destroyed(&mut entries, &expired.stage_id, EXPIRED_REASON);
            crate::write_json_atomic(&self.layout.destroyed_file(), &entries)?;
        }
        Ok(())
    }

    fn update(&self, record: &OwnershipRecord) -> Result<(), StoreError> {
        let _lock = StateLock::acquire(&self.layout)?;
        match self.read_record()? {
            Some(current) if current.stage_id == record.stage_id => {
                crate::write_json_atomic(&self.layout.ownership_file(), record)
            }
            _ => Err(StoreError::NotClaimed(record.stage_id.clone())),
        }
    }

    fn release(&self, stage_id: &StageId) -> Result<(), StoreError> {
        let _lock = StateLock::acquire(&self.layout)?;
        match self.read_record()? {
            Some(current) if current.stage_id == *stage_id => {
                fs::remove_file(self.layout.ownership_file())?;
                crate::fsync_dir(self.layout.root())?;
                debug!("stage {stage_id} released");
            }
            Some(current) => {
                debug!(
                    "release of {stage_id} ignored: claim belongs to {}",
                    current.stage_id
                );
            }
            None => {}
        }
        Ok(())
    }

    fn record_destroyed(&self, stage_id: &StageId, reason: &str) -> Result<(), StoreError> {
        let _lock = StateLock::acquire(&self.layout)?;
        let mut entries = self.read_destroyed()?;
        push_destroyed(&mut entries, stage_id, reason);
        crate::write_json_atomic(&self.layout.destroyed_file(), &entries)
    }

    fn destroyed_reason(&self, stage_id: &StageId) -> Result<Option<String>, StoreError> {
        let _lock = StateLock::acquire(&self.layout)?;
        Ok(self
            .read_destroyed()?
            .into_iter()
            .find(|e| e.stage_id == *stage_id)
            .map(|e| e.reason))
    }
}

/// In-process ownership store, for tests and single-process embeddings.
#[derive(Default)]
pub struct MemoryOwnershipStore {
    record: Mutex<Option<OwnershipRecord>>,
    destroyed: Mutex<Vec<DestroyedEntry>>,
}

impl MemoryOwnershipStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(e: &std::sync::PoisonError<T>) -> StoreError {
    StoreError::LockFailed(format!("mutex poisoned: {e}"))
}

impl OwnershipStore for MemoryOwnershipStore {
    fn current(&self, now: DateTime<Utc>) -> Result<Option<OwnershipRecord>, StoreError> {
        let record = self.record.lock().map_err(|e| poisoned(&e))?;
        Ok(record.clone().filter(|r| !r.is_expired(now)))
    }

    fn recorded(&self) -> Result<Option<OwnershipRecord>, StoreError> {
        Ok(self.record.lock().map_err(|e| poisoned(&e))?.clone())
    }

    fn claim(&self, record: OwnershipRecord, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut current = self.record.lock().map_err(|e| poisoned(&e))?;
        let evicted = check_claim(current.as_ref(), &record, now)?;
        *current = Some(record);
        drop(current);
        if let Some(expired) = evicted {
            remove_expired_stage(&expired);
            self.record_destroyed(&expired.stage_id, EXPIRED_REASON)?;
        }
        Ok(())
    }

    fn update(&self, record: &OwnershipRecord) -> Result<(), StoreError> {
        let mut current = self.record.lock().map_err(|e| poisoned(&e))?;
        match current.as_ref() {
            Some(existing) if existing.stage_id == record.stage_id => {
                *current = Some(record.clone());
                Ok(())
            }
            _ => Err(StoreError::NotClaimed(record.stage_id.clone())),
        }
    }

    fn release(&self, stage_id: &StageId) -> Result<(), StoreError> {
        let mut current = self.record.lock().map_err(|e| poisoned(&e))?;
        if current.as_ref().is_some_and(|r| r.stage_id == *stage_id) {
            *current = None;
        }
        Ok(())
    }

    fn record_destroyed(&self, stage_id: &StageId, reason: &str) -> Result<(), StoreError> {
        let mut entries = self.destroyed.lock().map_err(|e| poisoned(&e))?;
        push_destroyed(&mut entries, stage_id, reason);
        Ok(())
    }

    fn destroyed_reason(&self, stage_id: &StageId) -> Result<Option<String>, StoreError> {
        let entries = self.destroyed.lock().map_err(|e| poisoned(&e))?;
        Ok(entries
            .iter()
            .find(|e| e.stage_id == *stage_id)
            .map(|e| e.reason.clone()))
    }
}
