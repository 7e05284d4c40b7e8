use crate::config::StageConfig;
use crate::dispatch::Subscriber;
use crate::event::{EventType, StageEvent};
use crate::{StageError, SubscriberError};
use stagehand_toolkit::ExcludedPaths;
use std::path::PathBuf;

/// Collects the paths that must never be copied into a stage or committed
/// back: configured site data, version-control metadata, and stagehand's
/// own state when it lives inside the active directory.
pub struct ExcludedPathsValidator {
    configured: ExcludedPaths,
    internal_dirs: Vec<PathBuf>,
}

impl ExcludedPathsValidator {
    pub fn new(configured: ExcludedPaths, internal_dirs: Vec<PathBuf>) -> Self {
        Self {
            configured,
            internal_dirs,
        }
    }

    pub fn from_config(config: &StageConfig) -> Result<Self, StageError> {
        let mut configured = config.excluded()?;
        configured.add(".git")?;
        Ok(Self::new(
            configured,
            vec![config.state_dir(), config.staging_root()],
        ))
    }
}

impl Subscriber for ExcludedPathsValidator {
    fn name(&self) -> &'static str {
        "excluded_paths"
    }

    fn subscriptions(&self) -> Vec<(EventType, i32)> {
        vec![(EventType::PreCreate, 100), (EventType::PreApply, 100)]
    }

    fn handle(&self, event: &mut StageEvent) -> Result<(), SubscriberError> {
        let active = event.context().active_dir.clone();
        let nested: Vec<PathBuf> = self
            .internal_dirs
            .iter()
            .filter_map(|dir| dir.strip_prefix(&active).ok())
            .filter(|rel| !rel.as_os_str().is_empty())
            .map(PathBuf::from)
            .collect();

        let excluded = event.excluded_paths_mut();
        excluded.extend(self.configured.iter())?;
        excluded.extend(nested)?;
        Ok(())
    }
}
