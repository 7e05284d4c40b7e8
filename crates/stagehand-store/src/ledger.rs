use crate::layout::StateLayout;
use crate::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// What the unattended runner remembers between invocations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_outcome: Option<String>,
}

/// Persists the unattended [`RunRecord`] in the state directory.
#[derive(Debug, Clone)]
pub struct RunLedger {
    path: PathBuf,
}

impl RunLedger {
    pub fn new(layout: &StateLayout) -> Self {
        Self {
            path: layout.run_ledger_file(),
        }
    }

    pub fn load(&self) -> Result<RunRecord, StoreError> {
        if !self.path.exists() {
            return Ok(RunRecord::default());
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn record(&self, at: DateTime<Utc>, outcome: &str) -> Result<(), StoreError> {
        crate::write_json_atomic(
            &self.path,
            &RunRecord {
                last_run: Some(at),
                last_outcome: Some(outcome.to_owned()),
            },
        )
    }
}
