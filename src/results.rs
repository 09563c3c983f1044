//! Result events written for partitions whose result changed.

use crate::event::{EmittedEvent, EmittedEventEnvelope};
use crate::names::{ProjectionNames, RESULT_EVENT_TYPE, RESULT_REMOVED_EVENT_TYPE};
use crate::partition::ROOT_PARTITION;
use crate::tag::CheckpointTag;

/// Metadata key naming the partition a result belongs to.
const PARTITION_KEY: &str = "$partition";

/// Builds the events that publish partition results.
///
/// Results are emitted like any other event, so they obey checkpoint
/// generations and are never written past an unflushed checkpoint.
#[derive(Debug, Clone)]
pub struct ResultWriter {
    names: ProjectionNames,
}

impl ResultWriter {
    /// Create a writer for the projection named by `names`.
    pub fn new(names: ProjectionNames) -> Self {
        Self { names }
    }

    /// Events announcing that `partition`'s result is now `result`.
    ///
    /// A `None` result writes a removal event. Non-root partitions also
    /// publish to the projection-wide result stream.
    pub fn result_events(
        &self,
        partition: &str,
        result: Option<&str>,
        caused_by: &CheckpointTag,
    ) -> Vec<EmittedEventEnvelope> {
        let event_type = if result.is_some() {
            RESULT_EVENT_TYPE
        } else {
            RESULT_REMOVED_EVENT_TYPE
        };
        let make = |stream: String| {
            EmittedEventEnvelope::new(
                EmittedEvent::new(
                    stream,
                    event_type,
                    result.map(str::to_owned),
                    caused_by.clone(),
                )
                .with_extra_metadata(PARTITION_KEY, serde_json::Value::String(partition.into())),
            )
        };
        let mut events = vec![make(self.names.result_stream(partition))];
        if partition != ROOT_PARTITION {
            events.push(make(self.names.result_stream(ROOT_PARTITION)));
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::TfPos;

    fn tag() -> CheckpointTag {
        CheckpointTag::from_position(0, TfPos::new(10, 5)).expect("valid tag")
    }

    #[test]
    fn root_result_goes_to_projection_result_stream() {
        let writer = ResultWriter::new(ProjectionNames::new("totals"));
        let events = writer.result_events("", Some("42"), &tag());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.stream_id, "$projections-totals-result");
        assert_eq!(events[0].event.event_type, RESULT_EVENT_TYPE);
        assert_eq!(events[0].event.data.as_deref(), Some("42"));
    }

    #[test]
    fn partition_result_is_published_twice() {
        let writer = ResultWriter::new(ProjectionNames::new("totals"));
        let events = writer.result_events("order-1", None, &tag());
        let streams: Vec<_> = events.iter().map(|e| e.event.stream_id.as_str()).collect();
        assert_eq!(
            streams,
            [
                "$projections-totals-order-1-result",
                "$projections-totals-result"
            ]
        );
        assert!(
            events
                .iter()
                .all(|e| e.event.event_type == RESULT_REMOVED_EVENT_TYPE)
        );
    }
}
