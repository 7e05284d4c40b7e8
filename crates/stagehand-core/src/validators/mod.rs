//! Built-in validators.
//!
//! Each one is a [`Subscriber`](crate::Subscriber) that reports expected
//! problems as validation results and only returns `Err` for failures it
//! cannot reason about, such as an unreadable directory.

pub mod disk_space;
pub mod excluded_paths;
pub mod lock_file;
pub mod manifest;
pub mod symlinks;

pub use disk_space::DiskSpaceValidator;
pub use excluded_paths::ExcludedPathsValidator;
pub use lock_file::LockFileValidator;
pub use manifest::ManifestValidator;
pub use symlinks::SymlinkValidator;

use crate::config::StageConfig;
use crate::dispatch::{EventDispatcher, Subscriber};
use crate::StageError;
use stagehand_toolkit::PackageInspector;
use std::sync::Arc;

pub fn default_subscribers(
    config: &StageConfig,
    inspector: Arc<dyn PackageInspector>,
) -> Result<Vec<Arc<dyn Subscriber>>, StageError> {
    Ok(vec![
        Arc::new(ExcludedPathsValidator::from_config(config)?),
        Arc::new(DiskSpaceValidator::new(
            config.min_free_space_mb.saturating_mul(1024 * 1024),
            config.staging_root(),
        )),
        Arc::new(ManifestValidator::new(Arc::clone(&inspector))),
        Arc::new(LockFileValidator::new(
            inspector,
            config.layout().active_lock_hash_file(),
        )),
        Arc::new(SymlinkValidator),
    ])
}

pub fn default_dispatcher(
    config: &StageConfig,
    inspector: Arc<dyn PackageInspector>,
) -> Result<EventDispatcher, StageError> {
    let mut dispatcher = EventDispatcher::new();
    for subscriber in default_subscribers(config, inspector)? {
        dispatcher.register(subscriber);
    }
    Ok(dispatcher)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    #[test]
    fn excluded_paths_run_first() {
        let config = StageConfig::new("/srv/site");
        let dispatcher =
            default_dispatcher(&config, config.inspector()).unwrap();
        let order = dispatcher.subscribers_for(EventType::PreApply);
        assert_eq!(order.first().copied(), Some("excluded_paths"));
        assert!(order.contains(&"lock_file"));
    }
}
