//! The contract between a projection and the code that computes its state.
//!
//! A [`StateHandler`] is called synchronously on the projection's worker. It
//! holds the state of one partition at a time: the projection switches it
//! between partitions with [`load`](StateHandler::load) and
//! [`initialize`](StateHandler::initialize), then asks it to process events.
//! Errors returned from the handler fault the projection; they are never
//! retried.

use crate::event::{EmittedEventEnvelope, ResolvedEvent};
use crate::source::SourceDefinition;
use crate::tag::CheckpointTag;

/// Error returned by a state handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler did with one event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessEventOutcome {
    /// Whether the handler processed the event at all.
    pub handled: bool,
    /// Serialized partition state after the event.
    pub new_state: Option<String>,
    /// Serialized shared state after the event (bi-state projections).
    pub new_shared_state: Option<String>,
    /// Events to emit.
    pub emitted_events: Vec<EmittedEventEnvelope>,
}

impl ProcessEventOutcome {
    /// The handler ignored the event.
    pub fn not_handled() -> Self {
        Self::default()
    }

    /// The handler processed the event and its partition state is now
    /// `new_state`.
    pub fn handled(new_state: Option<String>) -> Self {
        Self {
            handled: true,
            new_state,
            ..Self::default()
        }
    }

    /// Add events to emit.
    pub fn with_emitted(mut self, events: impl IntoIterator<Item = EmittedEventEnvelope>) -> Self {
        self.emitted_events.extend(events);
        self
    }

    /// Set the shared state.
    pub fn with_shared_state(mut self, shared: Option<String>) -> Self {
        self.new_shared_state = shared;
        self
    }
}

/// What a handler did when a partition's source stream was deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionDeletedOutcome {
    /// Whether the handler reacted to the deletion.
    pub handled: bool,
    /// Serialized partition state after the deletion.
    pub new_state: Option<String>,
}

/// Computes projection state from events.
///
/// # Contract
///
/// - Processing must be deterministic: the same events in the same order
///   produce the same states and emitted events.
/// - The handler must not share mutable state with other handlers or rely
///   on timing. It is only ever called from its projection's worker.
pub trait StateHandler: Send + 'static {
    /// Name used in fault messages. Defaults to the implementing type.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// What the projection reads and how its state is partitioned.
    fn source_definition(&self) -> SourceDefinition;

    /// Replace the current partition state with `state`.
    fn load(&mut self, state: Option<&str>) -> Result<(), HandlerError>;

    /// Reset the current partition state to the handler's initial state.
    fn initialize(&mut self) -> Result<(), HandlerError>;

    /// Replace the shared state (bi-state projections).
    fn load_shared(&mut self, _state: Option<&str>) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Reset the shared state (bi-state projections).
    fn initialize_shared(&mut self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Partition `event` belongs to, for projections partitioned by the
    /// handler. `None` skips the event.
    fn get_state_partition(
        &mut self,
        _tag: &CheckpointTag,
        _category: Option<&str>,
        _event: &ResolvedEvent,
    ) -> Result<Option<String>, HandlerError> {
        Ok(None)
    }

    /// Process one event against the currently loaded partition state.
    fn process_event(
        &mut self,
        partition: &str,
        tag: &CheckpointTag,
        category: Option<&str>,
        event: &ResolvedEvent,
    ) -> Result<ProcessEventOutcome, HandlerError>;

    /// React to the deletion of the partition's source stream.
    fn process_partition_deleted(
        &mut self,
        _partition: &str,
        _tag: &CheckpointTag,
    ) -> Result<PartitionDeletedOutcome, HandlerError> {
        Ok(PartitionDeletedOutcome::default())
    }

    /// Result derived from the currently loaded partition state.
    fn transform_state_to_result(&mut self) -> Result<Option<String>, HandlerError> {
        Ok(None)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use serde_json::{Value, json};

    use super::*;
    use crate::event::EmittedEvent;

    /// Shared log of the calls a [`CountingHandler`] received.
    pub(crate) type CallLog = Arc<Mutex<Vec<String>>>;

    /// Handler keeping `{"count": n}` per partition. Events of type `Fail`
    /// raise an error; events of type `Emit` emit one event to `out-{partition}`.
    #[derive(Debug)]
    pub(crate) struct CountingHandler {
        pub(crate) source: SourceDefinition,
        pub(crate) count: i64,
        pub(crate) calls: CallLog,
    }

    impl CountingHandler {
        pub(crate) fn new(source: SourceDefinition) -> (Self, CallLog) {
            let calls = CallLog::default();
            (
                Self {
                    source,
                    count: 0,
                    calls: calls.clone(),
                },
                calls,
            )
        }

        fn record(&self, call: String) {
            self.calls.lock().expect("lock poisoned").push(call);
        }
    }

    impl StateHandler for CountingHandler {
        fn source_definition(&self) -> SourceDefinition {
            self.source.clone()
        }

        fn load(&mut self, state: Option<&str>) -> Result<(), HandlerError> {
            self.record(format!("load {}", state.unwrap_or("-")));
            let value: Value = serde_json::from_str(state.unwrap_or("{}"))?;
            self.count = value["count"].as_i64().unwrap_or(0);
            Ok(())
        }

        fn initialize(&mut self) -> Result<(), HandlerError> {
            self.record("initialize".into());
            self.count = 0;
            Ok(())
        }

        fn get_state_partition(
            &mut self,
            _tag: &CheckpointTag,
            _category: Option<&str>,
            event: &ResolvedEvent,
        ) -> Result<Option<String>, HandlerError> {
            Ok(Some(event.data.clone()))
        }

        fn process_event(
            &mut self,
            partition: &str,
            tag: &CheckpointTag,
            _category: Option<&str>,
            event: &ResolvedEvent,
        ) -> Result<ProcessEventOutcome, HandlerError> {
            self.record(format!("process {partition} {}", event.event_type));
            match event.event_type.as_str() {
                "Fail" => Err("boom".into()),
                "Ignored" => Ok(ProcessEventOutcome::not_handled()),
                "Emit" => {
                    self.count += 1;
                    let emitted = EmittedEvent::new(
                        format!("out-{partition}"),
                        "Counted",
                        Some(json!({"count": self.count}).to_string()),
                        tag.clone(),
                    );
                    Ok(ProcessEventOutcome::handled(Some(
                        json!({"count": self.count}).to_string(),
                    ))
                    .with_emitted([EmittedEventEnvelope::new(emitted)]))
                }
                _ => {
                    self.count += 1;
                    Ok(ProcessEventOutcome::handled(Some(
                        json!({"count": self.count}).to_string(),
                    )))
                }
            }
        }

        fn transform_state_to_result(&mut self) -> Result<Option<String>, HandlerError> {
            Ok(Some(self.count.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::CountingHandler;
    use super::*;

    #[test]
    fn type_name_defaults_to_implementing_type() {
        let (handler, _) = CountingHandler::new(SourceDefinition::from_all());
        let boxed: Box<dyn StateHandler> = Box::new(handler);
        assert!(boxed.type_name().ends_with("CountingHandler"));
    }

    #[test]
    fn outcome_builders() {
        let outcome = ProcessEventOutcome::handled(Some("{}".into())).with_shared_state(None);
        assert!(outcome.handled);
        assert!(outcome.emitted_events.is_empty());
        assert!(!ProcessEventOutcome::not_handled().handled);
    }
}
