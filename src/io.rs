//! Asynchronous storage requests issued by a projection and their
//! completions.
//!
//! A projection never awaits storage. It hands an [`IoRequest`] to its
//! [`IoDispatcher`] and keeps processing; the matching [`IoCompletion`]
//! arrives later as an ordinary message on the projection's worker and is
//! routed to the component that issued the request by its correlation id.

use std::fmt;
use std::time::Duration;

use uuid::Uuid;

/// Optimistic concurrency expectation for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Accept any current stream version (no concurrency check).
    Any,
    /// The stream must not exist yet (first write).
    NoStream,
    /// The stream's last event number must be exactly this value.
    Exact(i64),
}

impl ExpectedVersion {
    /// Expectation for appending after `last_event_number`, where `-1` means
    /// the stream does not exist yet.
    pub fn after(last_event_number: i64) -> Self {
        if last_event_number < 0 {
            Self::NoStream
        } else {
            Self::Exact(last_event_number)
        }
    }
}

/// An event to append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventToWrite {
    /// Identifier of the new event.
    pub event_id: Uuid,
    /// Event type name.
    pub event_type: String,
    /// Whether `data` is JSON.
    pub is_json: bool,
    /// Event payload.
    pub data: String,
    /// Event metadata.
    pub metadata: Option<String>,
}

/// An event as stored in a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Stream the event belongs to.
    pub stream_id: String,
    /// Zero-based position of the event in its stream.
    pub event_number: i64,
    /// Identifier of the event.
    pub event_id: Uuid,
    /// Event type name.
    pub event_type: String,
    /// Event payload.
    pub data: String,
    /// Event metadata.
    pub metadata: Option<String>,
}

/// A page of events read backward from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSlice {
    /// Events, newest first.
    pub events: Vec<RecordedEvent>,
    /// Event number to continue reading backward from.
    pub next_event_number: i64,
    /// Number of the newest event in the stream.
    pub last_event_number: i64,
    /// Whether the oldest event has been reached.
    pub is_end_of_stream: bool,
}

/// Outcome of a backward read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// Events were read (possibly none).
    Success(StreamSlice),
    /// The stream does not exist.
    NoStream,
    /// The stream was deleted.
    StreamDeleted,
    /// The caller may not read the stream.
    AccessDenied,
    /// The read timed out.
    Timeout,
}

/// Outcome of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// The events were appended.
    Success {
        /// Number of the first appended event.
        first_event_number: i64,
        /// Number of the last appended event.
        last_event_number: i64,
    },
    /// The stream was not at the expected version.
    WrongExpectedVersion {
        /// The stream's actual last event number (`-1` if absent).
        current_version: i64,
    },
    /// The write timed out before it was prepared.
    PrepareTimeout,
    /// The write timed out while being forwarded.
    ForwardTimeout,
    /// The write timed out before it was committed.
    CommitTimeout,
    /// The stream was deleted.
    StreamDeleted,
    /// The caller may not write to the stream.
    AccessDenied,
}

impl WriteResult {
    /// Whether the write failed with one of the retryable timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::PrepareTimeout | Self::ForwardTimeout | Self::CommitTimeout
        )
    }
}

/// A storage operation requested by a projection.
#[derive(Debug, Clone, PartialEq)]
pub enum IoRequest {
    /// Read up to `max_count` events backward from `from_event_number`
    /// (`-1` reads from the end of the stream).
    ReadBackward {
        /// Correlation id echoed by the completion.
        correlation_id: Uuid,
        /// Stream to read.
        stream_id: String,
        /// Event number to start from, or `-1` for the newest event.
        from_event_number: i64,
        /// Maximum number of events to return.
        max_count: usize,
    },
    /// Append events to a stream.
    WriteEvents {
        /// Correlation id echoed by the completion.
        correlation_id: Uuid,
        /// Stream to append to.
        stream_id: String,
        /// Concurrency expectation.
        expected_version: ExpectedVersion,
        /// Events to append, in order.
        events: Vec<EventToWrite>,
    },
    /// Deliver a [`IoCompletion::DelayElapsed`] after `delay`.
    Delay {
        /// Correlation id echoed by the completion.
        correlation_id: Uuid,
        /// How long to wait.
        delay: Duration,
    },
}

impl IoRequest {
    /// Correlation id of the request.
    pub fn correlation_id(&self) -> Uuid {
        match self {
            Self::ReadBackward { correlation_id, .. }
            | Self::WriteEvents { correlation_id, .. }
            | Self::Delay { correlation_id, .. } => *correlation_id,
        }
    }
}

/// The result of an [`IoRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum IoCompletion {
    /// A [`IoRequest::ReadBackward`] finished.
    StreamRead {
        /// Correlation id of the request.
        correlation_id: Uuid,
        /// Outcome of the read.
        result: ReadResult,
    },
    /// A [`IoRequest::WriteEvents`] finished.
    EventsWritten {
        /// Correlation id of the request.
        correlation_id: Uuid,
        /// Outcome of the write.
        result: WriteResult,
    },
    /// A [`IoRequest::Delay`] elapsed.
    DelayElapsed {
        /// Correlation id of the request.
        correlation_id: Uuid,
    },
}

impl IoCompletion {
    /// Correlation id of the request this completes.
    pub fn correlation_id(&self) -> Uuid {
        match self {
            Self::StreamRead { correlation_id, .. }
            | Self::EventsWritten { correlation_id, .. }
            | Self::DelayElapsed { correlation_id } => *correlation_id,
        }
    }
}

/// Executes storage requests on behalf of a projection.
///
/// Implementations must not block and must not call back into the
/// projection synchronously: the completion is delivered later through the
/// projection's worker.
pub trait IoDispatcher: Send + Sync + fmt::Debug {
    /// Start executing `request`.
    fn dispatch(&self, request: IoRequest);
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_version_after_last_event() {
        assert_eq!(ExpectedVersion::after(-1), ExpectedVersion::NoStream);
        assert_eq!(ExpectedVersion::after(0), ExpectedVersion::Exact(0));
        assert_eq!(ExpectedVersion::after(41), ExpectedVersion::Exact(41));
    }

    #[test]
    fn timeouts_are_grouped() {
        assert!(WriteResult::PrepareTimeout.is_timeout());
        assert!(WriteResult::ForwardTimeout.is_timeout());
        assert!(WriteResult::CommitTimeout.is_timeout());
        assert!(!WriteResult::StreamDeleted.is_timeout());
        assert!(
            !WriteResult::WrongExpectedVersion {
                current_version: 3
            }
            .is_timeout()
        );
    }

    #[test]
    fn correlation_ids_round_trip() {
        let id = Uuid::new_v4();
        let request = IoRequest::Delay {
            correlation_id: id,
            delay: Duration::from_secs(1),
        };
        assert_eq!(request.correlation_id(), id);
        let completion = IoCompletion::DelayElapsed { correlation_id: id };
        assert_eq!(completion.correlation_id(), id);
    }
}
