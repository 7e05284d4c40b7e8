//! Durable state for the stagehand stage lifecycle.
//!
//! This crate owns everything that must survive a process or request
//! boundary: the `PathLocator` for the live installation, the `StateLayout`
//! of the state directory, the `FailureMarker` sentinel that flags a crashed
//! apply, the `OwnershipStore` that enforces a single in-flight stage, the
//! destroyed-stage ledger and the unattended `RunLedger`. All JSON state is
//! written atomically through [`write_json_atomic`].

pub mod layout;
pub mod ledger;
pub mod marker;
pub mod ownership;
pub mod paths;
pub mod types;

pub use layout::{StateLayout, STATE_FORMAT_VERSION};
pub use ledger::{RunLedger, RunRecord};
pub use marker::{FailureMarker, MarkerContents, FAILURE_MARKER_FILE};
pub use ownership::{
    FileOwnershipStore, MemoryOwnershipStore, OwnershipRecord, OwnershipStore, StagePhase,
};
pub use paths::{normalize_relative, PathLocator};
pub use types::{OwnerToken, StageId};

use serde::Serialize;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// POSIX does not guarantee a rename survives a crash until the parent
/// directory itself has been synced.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Serialize `value` as pretty JSON and atomically replace `dest` with it.
///
/// The temp file is created next to `dest` so the final `rename()` never
/// crosses a filesystem boundary.
pub fn write_json_atomic(dest: &Path, value: &impl Serialize) -> Result<(), StoreError> {
    let dir = dest
        .parent()
        .ok_or_else(|| StoreError::InvalidPath(dest.display().to_string()))?;
    std::fs::create_dir_all(dir)?;
    let content = serde_json::to_string_pretty(value)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("state format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("stage {existing} is already claimed by {owner}")]
    AlreadyClaimed { existing: StageId, owner: OwnerToken },
    #[error("stage {0} is not the claimed stage")]
    NotClaimed(StageId),
    #[error("{message}")]
    ApplyFailed {
        message: String,
        stage_id: Option<StageId>,
        backtrace: Option<String>,
    },
    #[error("failure marker at {path} exists but cannot be decoded: {reason}")]
    CorruptMarker { path: String, reason: String },
}
