use crate::paths::PathLocator;
use crate::types::StageId;
use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name of the failure marker, placed in the project root.
pub const FAILURE_MARKER_FILE: &str = "STAGEHAND_APPLY_FAILURE.json";

/// Persisted contents of the failure marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerContents {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<StageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
}

/// On-disk sentinel that brackets the physical commit of a stage.
///
/// Written before the active directory is touched and removed only after
/// the commit succeeded. A marker found at any other time means a previous
/// apply died part way through, and the next process must refuse to go on.
#[derive(Debug, Clone)]
pub struct FailureMarker {
    path: PathBuf,
}

impl FailureMarker {
    pub fn new(locator: &PathLocator) -> Self {
        Self {
            path: locator.project_root().join(FAILURE_MARKER_FILE),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(
        &self,
        stage_id: &StageId,
        message: &str,
        backtrace: Option<&str>,
    ) -> Result<(), StoreError> {
        let contents = MarkerContents {
            message: message.to_owned(),
            stage_id: Some(stage_id.clone()),
            backtrace: backtrace.map(str::to_owned),
        };
        crate::write_json_atomic(&self.path, &contents)?;
        debug!("failure marker written for stage {stage_id}");
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the marker. A file that exists but does not decode is reported as
    /// [`StoreError::CorruptMarker`], since it still means an apply crashed.
    pub fn read(&self) -> Result<Option<MarkerContents>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path).map_err(|e| StoreError::CorruptMarker {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::CorruptMarker {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })
    }

    pub fn assert_not_exists(&self) -> Result<(), StoreError> {
        match self.read()? {
            None => Ok(()),
            Some(contents) => {
                warn!(
                    "failure marker present at {}: {}",
                    self.path.display(),
                    contents.message
                );
                Err(StoreError::ApplyFailed {
                    message: contents.message,
                    stage_id: contents.stage_id,
                    backtrace: contents.backtrace,
                })
            }
        }
    }

    /// Remove the marker. Succeeds when it is already gone.
    pub fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("failure marker cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
