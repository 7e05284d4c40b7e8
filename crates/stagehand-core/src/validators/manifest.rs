use crate::dispatch::Subscriber;
use crate::event::{EventType, Severity, StageEvent, ValidationResult};
use crate::SubscriberError;
use stagehand_toolkit::{PackageInspector, MANIFEST_FILE};
use std::sync::Arc;

/// Requires a well-formed manifest in the active directory, and in the
/// staging directory before it is applied.
pub struct ManifestValidator {
    inspector: Arc<dyn PackageInspector>,
}

impl ManifestValidator {
    pub fn new(inspector: Arc<dyn PackageInspector>) -> Self {
        Self { inspector }
    }
}

impl Subscriber for ManifestValidator {
    fn name(&self) -> &'static str {
        "manifest"
    }

    fn subscriptions(&self) -> Vec<(EventType, i32)> {
        vec![
            (EventType::PreCreate, 0),
            (EventType::PreRequire, 0),
            (EventType::PreApply, 0),
            (EventType::StatusCheck, 0),
        ]
    }

    fn handle(&self, event: &mut StageEvent) -> Result<(), SubscriberError> {
        let context = event.context();
        let dir = match (event.event_type(), &context.stage_dir) {
            (EventType::PreApply, Some(stage_dir)) => stage_dir.clone(),
            _ => context.active_dir.clone(),
        };

        if !dir.join(MANIFEST_FILE).is_file() {
            event.add_error(format!("No {MANIFEST_FILE} was found in {}.", dir.display()));
            return Ok(());
        }
        let problems = self.inspector.validate(&dir);
        let summary = (problems.len() > 1).then(|| format!("{MANIFEST_FILE} is not valid."));
        if let Some(result) = ValidationResult::new(Severity::Error, problems, summary) {
            event.add_result(result);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::validators::testing::event;
    use stagehand_toolkit::ManifestInspector;
    use std::fs;

    fn validator() -> ManifestValidator {
        ManifestValidator::new(Arc::new(ManifestInspector::new("vendor")))
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = event(EventKind::PreCreate, dir.path(), None);
        validator().handle(&mut e).unwrap();
        assert!(e.has_errors());
    }

    #[test]
    fn valid_manifest_passes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), r#"{"require": {"a": "1.0"}}"#).unwrap();
        let mut e = event(EventKind::StatusCheck, dir.path(), None);
        validator().handle(&mut e).unwrap();
        assert!(e.results().is_empty());
    }

    #[test]
    fn pre_apply_checks_the_stage() {
        let active = tempfile::tempdir().unwrap();
        let stage = tempfile::tempdir().unwrap();
        fs::write(active.path().join(MANIFEST_FILE), "{}").unwrap();
        fs::write(stage.path().join(MANIFEST_FILE), "{not json").unwrap();
        let mut e = event(EventKind::PreApply, active.path(), Some(stage.path()));
        validator().handle(&mut e).unwrap();
        assert!(e.has_errors());
    }

    #[test]
    fn several_problems_share_a_summary() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"require": {"bad name": "1.0", "a": ""}}"#,
        )
        .unwrap();
        let mut e = event(EventKind::PreRequire { runtime: vec![], dev: vec![] }, dir.path(), None);
        validator().handle(&mut e).unwrap();
        assert_eq!(e.results().len(), 1);
        assert!(e.results()[0].summary().is_some());
        assert_eq!(e.results()[0].messages().len(), 2);
    }
}
