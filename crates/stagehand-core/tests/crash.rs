//! Crash detection: a commit that dies part way must leave the failure marker
//! behind, and every later process must refuse to touch the site.

use stagehand_core::{Clock, ManualClock, Stage, StageError, StageServices};
use stagehand_store::{FailureMarker, MemoryOwnershipStore, PathLocator, StagePhase};
use stagehand_toolkit::{Committer, ExcludedPaths, MockStager, Stager, ToolkitError};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Writes one file into the active directory, then dies.
struct PanickingCommitter;

impl Committer for PanickingCommitter {
    fn commit(
        &self,
        _stage_dir: &Path,
        active_dir: &Path,
        _excluded: &ExcludedPaths,
        _timeout: Option<Duration>,
    ) -> Result<(), ToolkitError> {
        fs::write(active_dir.join("half-written.php"), "<?php").unwrap();
        panic!("process killed during commit");
    }
}

struct FailingCommitter;

impl Committer for FailingCommitter {
    fn commit(
        &self,
        _stage_dir: &Path,
        _active_dir: &Path,
        _excluded: &ExcludedPaths,
        _timeout: Option<Duration>,
    ) -> Result<(), ToolkitError> {
        Err(ToolkitError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only file system",
        )))
    }
}

struct RefusingCommitter;

impl Committer for RefusingCommitter {
    fn commit(
        &self,
        _stage_dir: &Path,
        _active_dir: &Path,
        _excluded: &ExcludedPaths,
        _timeout: Option<Duration>,
    ) -> Result<(), ToolkitError> {
        Err(ToolkitError::Precondition("active directory is read-only".to_owned()))
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    active: PathBuf,
    clock: Arc<ManualClock>,
    services: StageServices,
}

fn fixture(committer: Arc<dyn Committer>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let active = dir.path().join("site");
    fs::create_dir_all(&active).unwrap();
    MockStager::new("vendor")
        .stage(&["require".to_owned(), "a:1.0".to_owned()], &active, None)
        .unwrap();
    let clock = Arc::new(ManualClock::default());
    let services = StageServices::new(
        PathLocator::new(&active, "vendor", "").unwrap(),
        Arc::new(MemoryOwnershipStore::new()),
        Arc::new(MockStager::new("vendor")),
        dir.path().join("stages"),
    )
    .with_committer(committer)
    .with_clock(Arc::clone(&clock) as Arc<dyn Clock>);
    Fixture {
        _dir: dir,
        active,
        clock,
        services,
    }
}

fn required_stage(f: &Fixture) -> Stage {
    let mut stage = Stage::new(f.services.clone(), "alice", "attended");
    stage.create().unwrap();
    stage.require(&["a:2.0".to_owned()], &[]).unwrap();
    stage
}

#[test]
fn crash_during_commit_blocks_everything_but_destroy() {
    let f = fixture(Arc::new(PanickingCommitter));
    let mut stage = required_stage(&f);
    let id = stage.stage_id().cloned().unwrap();

    let crashed = panic::catch_unwind(AssertUnwindSafe(|| stage.apply()));
    assert!(crashed.is_err());
    drop(stage);
    assert!(f.services.marker.exists());
    assert!(f.active.join("half-written.php").exists());

    // The next process knows nothing about the crash except the marker.
    let mut next = Stage::new(f.services.clone(), "alice", "attended");
    let err = next.claim(&id).unwrap_err();
    assert!(err.is_apply_failure());
    match err {
        StageError::ApplyFailed { stage_id, .. } => assert_eq!(stage_id, Some(id.clone())),
        other => panic!("unexpected error: {other}"),
    }
    assert!(next.create().unwrap_err().is_apply_failure());

    // Still looks like an apply in progress until the staleness window passes.
    let record = next.current_claim().unwrap().unwrap();
    assert_eq!(record.phase, StagePhase::Applying);
    assert!(matches!(next.destroy(false), Err(StageError::Conflict(_))));
    f.clock.advance(chrono::Duration::hours(2));
    next.destroy(false).unwrap();
    assert!(next.is_available().unwrap());

    // Destroy never clears the marker; an operator has to.
    assert!(next.create().unwrap_err().is_apply_failure());
    f.services.marker.clear().unwrap();
    next.create().unwrap();
}

#[test]
fn commit_error_records_the_cause() {
    let f = fixture(Arc::new(FailingCommitter));
    let mut stage = required_stage(&f);
    assert!(matches!(stage.apply(), Err(StageError::Toolkit(ToolkitError::Io(_)))));

    let contents = f.services.marker.read().unwrap().unwrap();
    assert!(contents
        .backtrace
        .as_deref()
        .unwrap()
        .contains("read-only file system"));
    assert!(stage.post_apply().unwrap_err().is_apply_failure());
    assert_eq!(
        stage.current_claim().unwrap().unwrap().phase,
        StagePhase::Applying
    );
}

#[test]
fn refused_commit_leaves_no_marker() {
    let f = fixture(Arc::new(RefusingCommitter));
    let mut stage = required_stage(&f);
    let err = stage.apply().unwrap_err();
    let failure = err.validation().unwrap();
    assert!(failure.results[0].messages()[0].contains("read-only"));
    assert!(!f.services.marker.exists());
    assert_eq!(stage.phase().unwrap(), Some(StagePhase::Required));
}

#[test]
fn corrupt_marker_is_not_ignored() {
    let f = fixture(Arc::new(FailingCommitter));
    let marker = FailureMarker::new(&f.services.locator);
    fs::write(marker.path(), "{truncated").unwrap();
    let mut stage = Stage::new(f.services.clone(), "alice", "attended");
    assert!(matches!(
        stage.create(),
        Err(StageError::CorruptFailureMarker { .. })
    ));
}
