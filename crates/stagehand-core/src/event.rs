use serde::Serialize;
use stagehand_store::{StageId, StagePhase};
use stagehand_toolkit::ExcludedPaths;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// One validator's finding. Always carries at least one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    severity: Severity,
    messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
}

impl ValidationResult {
    /// Build a result from any number of messages. Returns `None` when
    /// `messages` is empty, since such a result says nothing.
    pub fn new<I, S>(severity: Severity, messages: I, summary: Option<String>) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let messages: Vec<String> = messages.into_iter().map(Into::into).collect();
        if messages.is_empty() {
            return None;
        }
        Some(Self {
            severity,
            messages,
            summary,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            messages: vec![message.into()],
            summary: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            messages: vec![message.into()],
            summary: None,
        }
    }

    #[inline]
    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Discriminant used to subscribe to events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum EventType {
    PreCreate,
    PostCreate,
    PreRequire,
    PostRequire,
    PreApply,
    PostApply,
    PreDestroy,
    PostDestroy,
    StatusCheck,
}

impl EventType {
    /// Pre-operation events are the veto points of the lifecycle.
    pub fn is_pre_operation(self) -> bool {
        matches!(
            self,
            EventType::PreCreate
                | EventType::PreRequire
                | EventType::PreApply
                | EventType::PreDestroy
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::PreCreate => "pre-create",
            EventType::PostCreate => "post-create",
            EventType::PreRequire => "pre-require",
            EventType::PostRequire => "post-require",
            EventType::PreApply => "pre-apply",
            EventType::PostApply => "post-apply",
            EventType::PreDestroy => "pre-destroy",
            EventType::PostDestroy => "post-destroy",
            EventType::StatusCheck => "status-check",
        };
        f.write_str(name)
    }
}

/// The lifecycle transition an event describes, with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    PreCreate,
    PostCreate,
    PreRequire { runtime: Vec<String>, dev: Vec<String> },
    PostRequire { runtime: Vec<String>, dev: Vec<String> },
    PreApply,
    PostApply,
    PreDestroy,
    PostDestroy,
    StatusCheck,
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::PreCreate => EventType::PreCreate,
            EventKind::PostCreate => EventType::PostCreate,
            EventKind::PreRequire { .. } => EventType::PreRequire,
            EventKind::PostRequire { .. } => EventType::PostRequire,
            EventKind::PreApply => EventType::PreApply,
            EventKind::PostApply => EventType::PostApply,
            EventKind::PreDestroy => EventType::PreDestroy,
            EventKind::PostDestroy => EventType::PostDestroy,
            EventKind::StatusCheck => EventType::StatusCheck,
        }
    }
}

/// What subscribers may know about the stage an event is fired for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageContext {
    pub stage_id: Option<StageId>,
    pub stage_type: String,
    pub active_dir: PathBuf,
    /// Set once the stage has an allocated directory.
    pub stage_dir: Option<PathBuf>,
    pub phase: Option<StagePhase>,
}

/// One lifecycle event travelling through the dispatcher.
#[derive(Debug)]
pub struct StageEvent {
    kind: EventKind,
    context: StageContext,
    results: Vec<ValidationResult>,
    stopped: bool,
    excluded: ExcludedPaths,
}

impl StageEvent {
    pub fn new(kind: EventKind, context: StageContext) -> Self {
        Self {
            kind,
            context,
            results: Vec::new(),
            stopped: false,
            excluded: ExcludedPaths::new(),
        }
    }

    #[must_use]
    pub fn with_excluded(mut self, excluded: ExcludedPaths) -> Self {
        self.excluded = excluded;
        self
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    pub fn context(&self) -> &StageContext {
        &self.context
    }

    pub fn add_result(&mut self, result: ValidationResult) {
        self.results.push(result);
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.add_result(ValidationResult::error(message));
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.add_result(ValidationResult::warning(message));
    }

    pub fn results(&self) -> &[ValidationResult] {
        &self.results
    }

    pub fn has_errors(&self) -> bool {
        self.results.iter().any(ValidationResult::is_error)
    }

    /// Keep lower-priority subscribers from seeing this event.
    pub fn stop_propagation(&mut self) {
        self.stopped = true;
    }

    pub fn is_propagation_stopped(&self) -> bool {
        self.stopped
    }

    pub fn excluded_paths(&self) -> &ExcludedPaths {
        &self.excluded
    }

    pub fn excluded_paths_mut(&mut self) -> &mut ExcludedPaths {
        &mut self.excluded
    }

    pub fn into_parts(self) -> (Vec<ValidationResult>, ExcludedPaths) {
        (self.results, self.excluded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> StageContext {
        StageContext {
            stage_id: None,
            stage_type: "test".to_owned(),
            active_dir: PathBuf::from("/srv/site"),
            stage_dir: None,
            phase: None,
        }
    }

    #[test]
    fn empty_result_is_not_constructible() {
        let none: Option<ValidationResult> =
            ValidationResult::new(Severity::Error, Vec::<String>::new(), None);
        assert!(none.is_none());
        let some = ValidationResult::new(Severity::Warning, ["a", "b"], Some("two".to_owned()));
        let some = some.unwrap();
        assert_eq!(some.messages().len(), 2);
        assert_eq!(some.summary(), Some("two"));
    }

    #[test]
    fn has_errors_ignores_warnings() {
        let mut event = StageEvent::new(EventKind::PreCreate, context());
        event.add_warning("careful");
        assert!(!event.has_errors());
        event.add_error("nope");
        assert!(event.has_errors());
        assert_eq!(event.results().len(), 2);
    }

    #[test]
    fn kind_maps_to_type() {
        let kind = EventKind::PreRequire {
            runtime: vec!["a:2.0".to_owned()],
            dev: Vec::new(),
        };
        assert_eq!(kind.event_type(), EventType::PreRequire);
        assert!(EventType::PreRequire.is_pre_operation());
        assert!(!EventType::PostApply.is_pre_operation());
        assert!(!EventType::StatusCheck.is_pre_operation());
    }

    #[test]
    fn event_type_display() {
        assert_eq!(EventType::StatusCheck.to_string(), "status-check");
        assert_eq!(EventType::PreDestroy.to_string(), "pre-destroy");
    }
}
