use crate::event::{EventType, StageEvent, ValidationResult};
use crate::{StageError, SubscriberError, ValidationFailure};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A validator or listener attached to lifecycle events.
///
/// Expected problems are reported by adding results to the event. An `Err`
/// is reserved for unexpected failures and aborts the dispatch outright.
pub trait Subscriber: Send + Sync {
    fn name(&self) -> &'static str;

    /// Events this subscriber handles, each with its priority. Higher runs first.
    fn subscriptions(&self) -> Vec<(EventType, i32)>;

    fn handle(&self, event: &mut StageEvent) -> Result<(), SubscriberError>;
}

type HandlerFn = dyn Fn(&mut StageEvent) -> Result<(), SubscriberError> + Send + Sync;

/// Adapts a closure into a [`Subscriber`] for a fixed set of events.
pub struct FnSubscriber {
    name: &'static str,
    subscriptions: Vec<(EventType, i32)>,
    handler: Box<HandlerFn>,
}

impl FnSubscriber {
    pub fn new<F>(name: &'static str, subscriptions: Vec<(EventType, i32)>, handler: F) -> Self
    where
        F: Fn(&mut StageEvent) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        Self {
            name,
            subscriptions,
            handler: Box::new(handler),
        }
    }
}

impl Subscriber for FnSubscriber {
    fn name(&self) -> &'static str {
        self.name
    }

    fn subscriptions(&self) -> Vec<(EventType, i32)> {
        self.subscriptions.clone()
    }

    fn handle(&self, event: &mut StageEvent) -> Result<(), SubscriberError> {
        (self.handler)(event)
    }
}

struct Registration {
    priority: i32,
    seq: u64,
    subscriber: Arc<dyn Subscriber>,
}

/// Typed registry of subscribers, built once at startup.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: BTreeMap<EventType, Vec<Registration>>,
    next_seq: u64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, subscriber: Arc<dyn Subscriber>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        for (event, priority) in subscriber.subscriptions() {
            let list = self.handlers.entry(event).or_default();
            list.push(Registration {
                priority,
                seq,
                subscriber: Arc::clone(&subscriber),
            });
            list.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        }
    }

    #[must_use]
    pub fn with(mut self, subscriber: Arc<dyn Subscriber>) -> Self {
        self.register(subscriber);
        self
    }

    /// Names of the subscribers for `event`, in the order they run.
    pub fn subscribers_for(&self, event: EventType) -> Vec<&'static str> {
        self.handlers
            .get(&event)
            .map(|list| list.iter().map(|r| r.subscriber.name()).collect())
            .unwrap_or_default()
    }

    /// Run every subscriber for the event, then veto it if any result is an
    /// error. Status checks never veto; their results are for reporting.
    pub fn dispatch(&self, mut event: StageEvent) -> Result<StageEvent, StageError> {
        let event_type = event.event_type();
        if let Some(list) = self.handlers.get(&event_type) {
            for registration in list {
                if event.is_propagation_stopped() {
                    debug!("{event_type}: propagation stopped before {}", registration.subscriber.name());
                    break;
                }
                registration
                    .subscriber
                    .handle(&mut event)
                    .map_err(|source| StageError::Subscriber {
                        name: registration.subscriber.name().to_owned(),
                        source,
                    })?;
            }
        }

        for result in event.results().iter().filter(|r| !r.is_error()) {
            warn!("{event_type}: {}", describe(result));
        }

        if event_type != EventType::StatusCheck && event.has_errors() {
            if !event_type.is_pre_operation() {
                warn!(
                    "{event_type} reported errors after the change was made; it is not rolled back"
                );
            }
            let (results, _) = event.into_parts();
            return Err(StageError::Validation(ValidationFailure {
                event: event_type,
                results,
            }));
        }
        Ok(event)
    }
}

fn describe(result: &ValidationResult) -> String {
    match result.summary() {
        Some(summary) => format!("{summary} ({})", result.messages().join("; ")),
        None => result.messages().join("; "),
    }
}
