//! Events flowing into and out of a projection.
//!
//! This module provides [`ResolvedEvent`], the committed input event a
//! reader hands to a projection, and [`EmittedEvent`] /
//! [`EmittedEventEnvelope`], the output a state handler produces. No I/O
//! occurs here.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::io::EventToWrite;
use crate::tag::{CheckpointTag, ProjectionVersion, TfPos};

/// Metadata key carrying the id of the event that caused an emitted event.
pub const CAUSED_BY_KEY: &str = "$causedBy";

/// Metadata key carrying the correlation id of an emitted event.
pub const CORRELATION_ID_KEY: &str = "$correlationId";

/// A committed event as delivered to a projection.
///
/// When the event was read through a link (for example from a category or
/// event-type index stream) `position_stream_id` and
/// `position_sequence_number` describe the link, while `event_stream_id` and
/// `event_sequence_number` describe the event it points at.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEvent {
    /// Unique identifier of the event.
    pub event_id: Uuid,
    /// Stream the event was originally written to.
    pub event_stream_id: String,
    /// Sequence number of the event in its original stream.
    pub event_sequence_number: i64,
    /// Stream the event was read from.
    pub position_stream_id: String,
    /// Sequence number in the stream the event was read from.
    pub position_sequence_number: i64,
    /// Log position of the event (or of the link target).
    pub position: TfPos,
    /// Event type name.
    pub event_type: String,
    /// Whether `data` is JSON.
    pub is_json: bool,
    /// Event payload.
    pub data: String,
    /// Event metadata, if any.
    pub metadata: Option<String>,
}

impl ResolvedEvent {
    /// Create an event read directly from its own stream.
    ///
    /// The event gets a fresh v4 id, a JSON payload flag and no metadata.
    pub fn new(
        stream_id: impl Into<String>,
        sequence_number: i64,
        position: TfPos,
        event_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        let stream_id = stream_id.into();
        Self {
            event_id: Uuid::new_v4(),
            position_stream_id: stream_id.clone(),
            event_stream_id: stream_id,
            event_sequence_number: sequence_number,
            position_sequence_number: sequence_number,
            position,
            event_type: event_type.into(),
            is_json: true,
            data: data.into(),
            metadata: None,
        }
    }

    /// Mark the event as read through a link in `stream_id` at `sequence_number`.
    pub fn via_link(mut self, stream_id: impl Into<String>, sequence_number: i64) -> Self {
        self.position_stream_id = stream_id.into();
        self.position_sequence_number = sequence_number;
        self
    }

    /// Attach metadata to the event.
    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Whether the event was read through a link.
    pub fn is_link(&self) -> bool {
        self.position_stream_id != self.event_stream_id
    }

    /// Category of the original stream: the part before the first `-`.
    ///
    /// # Examples
    ///
    /// ```
    /// use eventfold_projections::{ResolvedEvent, TfPos};
    ///
    /// let event = ResolvedEvent::new("order-42", 0, TfPos::new(10, 5), "Placed", "{}");
    /// assert_eq!(event.category(), Some("order"));
    /// ```
    pub fn category(&self) -> Option<&str> {
        self.event_stream_id
            .split_once('-')
            .map(|(category, _)| category)
            .filter(|category| !category.is_empty())
    }

    /// Correlation id carried in the event's JSON metadata, if any.
    pub fn correlation_id(&self) -> Option<String> {
        let metadata: Value = serde_json::from_str(self.metadata.as_deref()?).ok()?;
        metadata
            .get(CORRELATION_ID_KEY)
            .and_then(Value::as_str)
            .map(str::to_owned)
    }

    /// Approximate number of bytes the event occupies.
    pub fn size(&self) -> usize {
        self.data.len() + self.metadata.as_ref().map_or(0, String::len)
    }
}

/// An event produced by a state handler, to be written to `stream_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedEvent {
    /// Destination stream.
    pub stream_id: String,
    /// Identifier of the new event.
    pub event_id: Uuid,
    /// Event type name.
    pub event_type: String,
    /// Whether `data` is JSON.
    pub is_json: bool,
    /// Event payload. `None` writes an empty payload.
    pub data: Option<String>,
    /// Extra metadata keys written alongside the causing tag.
    pub extra_metadata: Map<String, Value>,
    /// Tag of the input event that caused this one.
    pub caused_by_tag: CheckpointTag,
    /// Id of the input event that caused this one. Stamped by the checkpoint
    /// manager.
    pub caused_by: Option<Uuid>,
    /// Correlation id. Stamped by the checkpoint manager.
    pub correlation_id: Option<String>,
}

impl EmittedEvent {
    /// Create a JSON event with a fresh id.
    pub fn new(
        stream_id: impl Into<String>,
        event_type: impl Into<String>,
        data: Option<String>,
        caused_by_tag: CheckpointTag,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            is_json: true,
            data,
            extra_metadata: Map::new(),
            caused_by_tag,
            caused_by: None,
            correlation_id: None,
        }
    }

    /// Add one extra metadata key.
    pub fn with_extra_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra_metadata.insert(key.into(), value);
        self
    }

    /// Metadata written with the event: the causing tag stamped with
    /// `version`, the causation and correlation ids and the extra keys.
    pub fn metadata_json(&self, version: &ProjectionVersion) -> String {
        let mut extra = self.extra_metadata.clone();
        if let Some(caused_by) = self.caused_by {
            extra.insert(CAUSED_BY_KEY.into(), Value::String(caused_by.to_string()));
        }
        if let Some(correlation_id) = &self.correlation_id {
            extra.insert(
                CORRELATION_ID_KEY.into(),
                Value::String(correlation_id.clone()),
            );
        }
        self.caused_by_tag.to_json_string_with(version, &extra)
    }

    pub(crate) fn to_event_data(&self, version: &ProjectionVersion) -> EventToWrite {
        EventToWrite {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            is_json: self.is_json,
            data: self.data.clone().unwrap_or_default(),
            metadata: Some(self.metadata_json(version)),
        }
    }
}

/// Stream metadata applied to an emitted stream before its first event.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EmittedStreamMetadata {
    /// Maximum number of events kept in the stream.
    #[serde(rename = "$maxCount", skip_serializing_if = "Option::is_none")]
    pub max_count: Option<i64>,
    /// Maximum age of events kept in the stream, in seconds.
    #[serde(rename = "$maxAge", skip_serializing_if = "Option::is_none")]
    pub max_age_seconds: Option<i64>,
}

/// An emitted event plus optional metadata for its destination stream.
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedEventEnvelope {
    /// The event.
    pub event: EmittedEvent,
    /// Metadata for the destination stream, if the handler supplies any.
    pub stream_metadata: Option<EmittedStreamMetadata>,
}

impl EmittedEventEnvelope {
    /// Wrap an event without stream metadata.
    pub fn new(event: EmittedEvent) -> Self {
        Self {
            event,
            stream_metadata: None,
        }
    }

    /// Attach metadata for the destination stream.
    pub fn with_stream_metadata(mut self, metadata: EmittedStreamMetadata) -> Self {
        self.stream_metadata = Some(metadata);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tag(commit: i64) -> CheckpointTag {
        CheckpointTag::from_position(0, TfPos::new(commit, commit - 10)).expect("valid tag")
    }

    #[test]
    fn category_of_stream() {
        let event = ResolvedEvent::new("account-1-x", 0, TfPos::new(10, 5), "Opened", "{}");
        assert_eq!(event.category(), Some("account"));
        let event = ResolvedEvent::new("nocategory", 0, TfPos::new(10, 5), "Opened", "{}");
        assert_eq!(event.category(), None);
    }

    #[test]
    fn link_detection() {
        let event = ResolvedEvent::new("account-1", 3, TfPos::new(10, 5), "Opened", "{}");
        assert!(!event.is_link());
        let linked = event.via_link("$ce-account", 17);
        assert!(linked.is_link());
        assert_eq!(linked.position_sequence_number, 17);
        assert_eq!(linked.event_sequence_number, 3);
    }

    #[test]
    fn correlation_id_from_metadata() {
        let event = ResolvedEvent::new("a-1", 0, TfPos::new(10, 5), "T", "{}")
            .with_metadata(r#"{"$correlationId":"corr-1"}"#);
        assert_eq!(event.correlation_id().as_deref(), Some("corr-1"));
        let plain = ResolvedEvent::new("a-1", 0, TfPos::new(10, 5), "T", "{}")
            .with_metadata("not json");
        assert_eq!(plain.correlation_id(), None);
    }

    #[test]
    fn emitted_metadata_carries_tag_and_stamps() {
        let caused_by = Uuid::new_v4();
        let mut event = EmittedEvent::new("out-1", "Derived", Some("{}".into()), tag(100))
            .with_extra_metadata("source", json!("unit"));
        event.caused_by = Some(caused_by);
        event.correlation_id = Some("corr".into());

        let metadata = event.metadata_json(&ProjectionVersion::new(1, 0, 2));
        let decoded = CheckpointTag::from_json(&metadata).expect("metadata is a tag");
        assert_eq!(decoded.tag, tag(100));
        assert_eq!(decoded.version, ProjectionVersion::new(1, 0, 2));
        assert_eq!(decoded.extra["source"], json!("unit"));
        assert_eq!(decoded.extra[CAUSED_BY_KEY], json!(caused_by.to_string()));
        assert_eq!(decoded.extra[CORRELATION_ID_KEY], json!("corr"));
    }

    #[test]
    fn stream_metadata_uses_system_keys() {
        let metadata = EmittedStreamMetadata {
            max_count: Some(10),
            max_age_seconds: None,
        };
        assert_eq!(
            serde_json::to_value(&metadata).expect("serializes"),
            json!({"$maxCount": 10})
        );
    }
}
