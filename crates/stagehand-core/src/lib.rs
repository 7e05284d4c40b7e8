//! Stage lifecycle engine for stagehand.
//!
//! A [`Stage`] copies the active installation into a staging directory,
//! mutates the staged manifest through the package manager, and commits the
//! result back, firing an ordered event at every transition so that
//! registered validators can veto it. Single-writer ownership lives in the
//! durable ownership store and crashed commits are detected through the
//! failure marker, both from `stagehand-store`. The unattended runner layers
//! release policy on top of the same state machine.

pub mod clock;
pub mod concurrency;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod lifecycle;
pub mod stage;
pub mod trigger;
pub mod unattended;
pub mod validators;

pub use clock::{Clock, ManualClock, SystemClock};
pub use concurrency::{install_signal_handler, shutdown_cancel, shutdown_requested};
pub use config::StageConfig;
pub use dispatch::{EventDispatcher, FnSubscriber, Subscriber};
pub use event::{EventKind, EventType, Severity, StageContext, StageEvent, ValidationResult};
pub use lifecycle::validate_transition;
pub use stage::{DeferredTask, Stage, StageServices, StageSettings};
pub use trigger::{
    CommandTrigger, Continuation, ContinuationTrigger, HttpTrigger, InProcessTrigger,
};
pub use unattended::{
    handle_post_apply, select_target, select_trigger, JsonReleaseFeed, Release, ReleaseSource,
    UnattendedMode, UnattendedOutcome, UnattendedRunner, UNATTENDED_ACTOR, UNATTENDED_STAGE_TYPE,
};

use stagehand_store::{StageId, StoreError};
use stagehand_toolkit::ToolkitError;
use std::fmt;
use thiserror::Error;

/// All results collected by a vetoed event, in dispatch order.
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    pub event: EventType,
    pub results: Vec<ValidationResult>,
}

impl ValidationFailure {
    pub fn errors(&self) -> impl Iterator<Item = &ValidationResult> {
        self.results.iter().filter(|r| r.severity() == Severity::Error)
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} was refused by validation", self.event)?;
        for result in self.errors() {
            if let Some(summary) = result.summary() {
                write!(f, "\n  {summary}")?;
            }
            for message in result.messages() {
                write!(f, "\n  - {message}")?;
            }
        }
        Ok(())
    }
}

/// Unexpected failure inside a subscriber or deferred task. Expected domain
/// problems are reported as [`ValidationResult`]s instead.
#[derive(Debug, Error)]
pub enum SubscriberError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("toolkit error: {0}")]
    Toolkit(#[from] ToolkitError),
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("continuation command exited with {status}: {stderr}")]
    Command { status: String, stderr: String },
    #[error("continuation request failed: {0}")]
    Http(String),
    #[error("continuation handler failed: {0}")]
    Handler(String),
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("{0}")]
    Validation(ValidationFailure),
    /// A previous commit died part way. Needs an operator before anything else runs.
    #[error("{message}")]
    ApplyFailed {
        message: String,
        stage_id: Option<StageId>,
        backtrace: Option<String>,
    },
    #[error("failure marker at {path} exists but cannot be decoded: {reason}")]
    CorruptFailureMarker { path: String, reason: String },
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Ownership(String),
    #[error("invalid stage transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("{0}")]
    InvalidState(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("subscriber '{name}' failed: {source}")]
    Subscriber {
        name: String,
        #[source]
        source: SubscriberError,
    },
    #[error("deferred task '{name}' failed: {source}")]
    DeferredTask {
        name: String,
        #[source]
        source: SubscriberError,
    },
    #[error("toolkit error: {0}")]
    Toolkit(#[from] ToolkitError),
    #[error("trigger error: {0}")]
    Trigger(#[from] TriggerError),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("release data error: {0}")]
    Release(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for StageError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ApplyFailed {
                message,
                stage_id,
                backtrace,
            } => StageError::ApplyFailed {
                message,
                stage_id,
                backtrace,
            },
            StoreError::CorruptMarker { path, reason } => {
                StageError::CorruptFailureMarker { path, reason }
            }
            StoreError::AlreadyClaimed { .. } => StageError::Conflict(e.to_string()),
            StoreError::NotClaimed(id) => {
                StageError::Ownership(format!("stage {id} is no longer the claimed stage"))
            }
            other => StageError::Store(other),
        }
    }
}

impl StageError {
    pub fn validation(&self) -> Option<&ValidationFailure> {
        match self {
            StageError::Validation(f) => Some(f),
            _ => None,
        }
    }

    /// True for the two failure-marker conditions, which must be surfaced
    /// differently from an ordinary refusal.
    pub fn is_apply_failure(&self) -> bool {
        matches!(
            self,
            StageError::ApplyFailed { .. } | StageError::CorruptFailureMarker { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_store::OwnerToken;

    #[test]
    fn marker_errors_map_to_dedicated_variants() {
        let e: StageError = StoreError::ApplyFailed {
            message: "broken".to_owned(),
            stage_id: None,
            backtrace: None,
        }
        .into();
        assert!(matches!(e, StageError::ApplyFailed { ref message, .. } if message == "broken"));
        assert!(e.is_apply_failure());

        let e: StageError = StoreError::CorruptMarker {
            path: "/x".to_owned(),
            reason: "EOF".to_owned(),
        }
        .into();
        assert!(matches!(e, StageError::CorruptFailureMarker { .. }));
        assert!(e.to_string().contains("cannot be decoded"));
    }

    #[test]
    fn already_claimed_is_conflict() {
        let e: StageError = StoreError::AlreadyClaimed {
            existing: StageId::new("abc"),
            owner: OwnerToken::new("bob"),
        }
        .into();
        assert!(matches!(e, StageError::Conflict(_)));
    }

    #[test]
    fn validation_failure_display_lists_errors_only() {
        let failure = ValidationFailure {
            event: EventType::PreApply,
            results: vec![
                ValidationResult::error("disk is full"),
                ValidationResult::warning("slow disk"),
            ],
        };
        let msg = failure.to_string();
        assert!(msg.contains("pre-apply"));
        assert!(msg.contains("disk is full"));
        assert!(!msg.contains("slow disk"));
    }
}
