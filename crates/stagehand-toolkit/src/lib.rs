//! Physical staging collaborators for stagehand.
//!
//! The stage engine never copies files or runs the package manager itself.
//! It drives the [`Beginner`], [`Stager`] and [`Committer`] traits defined
//! here: a filesystem implementation of begin/commit with excluded paths and
//! deadlines, a `CommandStager` that shells out to the package-manager binary,
//! a `MockStager` for tests, the read-only `PackageInspector`, and
//! prerequisite checks.

pub mod backend;
pub mod command;
pub mod copy;
pub mod exclude;
pub mod inspector;
pub mod manifest;
pub mod mock;
pub mod prereq;

pub use backend::{select_stager, Beginner, Committer, Stager};
pub use command::CommandStager;
pub use copy::{CancelFn, FsBeginner, FsCommitter};
pub use exclude::ExcludedPaths;
pub use inspector::{ManifestInspector, PackageInspector};
pub use manifest::{InstalledPackage, InstalledPackages, Manifest, LOCK_FILE, MANIFEST_FILE};
pub use mock::MockStager;
pub use prereq::{check_stager_prereqs, format_missing, MissingPrereq};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolkitError {
    #[error("toolkit I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The operation cannot start in the current state of the filesystem.
    /// Callers surface this as a validation result rather than a crash.
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },
    #[error("{0} was cancelled")]
    Cancelled(String),
    #[error("command '{command}' failed ({status}): {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("executable not found: {0}")]
    NotFound(String),
    #[error("invalid manifest: {0}")]
    Manifest(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("stager '{0}' is not available")]
    UnknownStager(String),
}
