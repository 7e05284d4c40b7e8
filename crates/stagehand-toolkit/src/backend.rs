use crate::exclude::ExcludedPaths;
use crate::ToolkitError;
use std::path::Path;
use std::time::Duration;

/// Copies the active directory into a fresh staging directory.
pub trait Beginner: Send + Sync {
    fn begin(
        &self,
        active_dir: &Path,
        stage_dir: &Path,
        excluded: &ExcludedPaths,
        timeout: Option<Duration>,
    ) -> Result<(), ToolkitError>;
}

/// Runs the package manager against the staging directory.
pub trait Stager: Send + Sync {
    fn name(&self) -> &'static str;

    /// `args` are package-manager arguments such as `["require", "a:2.0"]`.
    fn stage(
        &self,
        args: &[String],
        working_dir: &Path,
        timeout: Option<Duration>,
    ) -> Result<(), ToolkitError>;
}

/// Merges the staging directory back into the active directory.
pub trait Committer: Send + Sync {
    fn commit(
        &self,
        stage_dir: &Path,
        active_dir: &Path,
        excluded: &ExcludedPaths,
        timeout: Option<Duration>,
    ) -> Result<(), ToolkitError>;
}

/// Pick a stager by configured kind.
pub fn select_stager(
    kind: &str,
    binary: &str,
    extra_args: &[String],
    vendor_dir: &Path,
) -> Result<Box<dyn Stager>, ToolkitError> {
    match kind {
        "command" => Ok(Box::new(crate::command::CommandStager::new(
            binary,
            extra_args.to_vec(),
        ))),
        "mock" => Ok(Box::new(crate::mock::MockStager::new(vendor_dir))),
        other => Err(ToolkitError::UnknownStager(other.to_owned())),
    }
}
