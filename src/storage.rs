//! Event storage used to execute a projection's I/O requests.
//!
//! [`EventStorage`] is the async contract a backing store implements.
//! [`StorageDispatcher`] adapts it to the non-blocking [`IoDispatcher`]
//! interface: every request runs on its own tokio task and its completion is
//! sent back to the projection's worker over a channel.
//! [`InMemoryEventStorage`] is a complete in-process store with optimistic
//! concurrency, used by tests and embedded deployments.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use crate::io::{
    EventToWrite, ExpectedVersion, IoCompletion, IoDispatcher, IoRequest, ReadResult,
    RecordedEvent, StreamSlice, WriteResult,
};

/// Boxed future returned by [`EventStorage`] methods.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Stream storage a projection reads checkpoints from and writes to.
///
/// Methods return boxed futures so the trait can be used as
/// `Arc<dyn EventStorage>`.
pub trait EventStorage: Send + Sync + fmt::Debug + 'static {
    /// Read up to `max_count` events backward from `from_event_number`
    /// (`-1` for the newest event).
    fn read_backward(
        &self,
        stream_id: String,
        from_event_number: i64,
        max_count: usize,
    ) -> StorageFuture<'_, ReadResult>;

    /// Append `events` to `stream_id` if the stream matches
    /// `expected_version`.
    fn write_events(
        &self,
        stream_id: String,
        expected_version: ExpectedVersion,
        events: Vec<EventToWrite>,
    ) -> StorageFuture<'_, WriteResult>;
}

#[derive(Debug, Default)]
struct StoredStream {
    events: Vec<RecordedEvent>,
    deleted: bool,
}

impl StoredStream {
    fn last_event_number(&self) -> i64 {
        self.events.len() as i64 - 1
    }
}

/// In-process [`EventStorage`].
///
/// # Examples
///
/// ```
/// use eventfold_projections::{EventStorage, ExpectedVersion, InMemoryEventStorage, ReadResult};
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let storage = InMemoryEventStorage::default();
/// let read = storage.read_backward("orders".into(), -1, 10).await;
/// assert_eq!(read, ReadResult::NoStream);
/// # });
/// ```
#[derive(Debug, Default)]
pub struct InMemoryEventStorage {
    streams: Mutex<HashMap<String, StoredStream>>,
}

impl InMemoryEventStorage {
    /// Append `events` without a concurrency check.
    pub async fn append(&self, stream_id: &str, events: Vec<EventToWrite>) -> WriteResult {
        self.write_events(stream_id.to_owned(), ExpectedVersion::Any, events)
            .await
    }

    /// Every event of `stream_id`, oldest first.
    pub async fn read_stream(&self, stream_id: &str) -> Vec<RecordedEvent> {
        self.streams
            .lock()
            .await
            .get(stream_id)
            .map(|stream| stream.events.clone())
            .unwrap_or_default()
    }

    /// Delete `stream_id`. Later reads and writes report the deletion.
    pub async fn delete_stream(&self, stream_id: &str) {
        let mut streams = self.streams.lock().await;
        let stream = streams.entry(stream_id.to_owned()).or_default();
        stream.deleted = true;
        stream.events.clear();
    }
}

impl EventStorage for InMemoryEventStorage {
    fn read_backward(
        &self,
        stream_id: String,
        from_event_number: i64,
        max_count: usize,
    ) -> StorageFuture<'_, ReadResult> {
        Box::pin(async move {
            let streams = self.streams.lock().await;
            let Some(stream) = streams.get(&stream_id) else {
                return ReadResult::NoStream;
            };
            if stream.deleted {
                return ReadResult::StreamDeleted;
            }
            let last = stream.last_event_number();
            if last < 0 {
                return ReadResult::NoStream;
            }
            let start = if (0..=last).contains(&from_event_number) {
                from_event_number
            } else {
                last
            };
            let oldest = (start - max_count as i64 + 1).max(0);
            let events = (oldest..=start)
                .rev()
                .map(|number| stream.events[number as usize].clone())
                .collect();
            ReadResult::Success(StreamSlice {
                events,
                next_event_number: oldest - 1,
                last_event_number: last,
                is_end_of_stream: oldest == 0,
            })
        })
    }

    fn write_events(
        &self,
        stream_id: String,
        expected_version: ExpectedVersion,
        events: Vec<EventToWrite>,
    ) -> StorageFuture<'_, WriteResult> {
        Box::pin(async move {
            let mut streams = self.streams.lock().await;
            let stream = streams.entry(stream_id.clone()).or_default();
            if stream.deleted {
                return WriteResult::StreamDeleted;
            }
            let current = stream.last_event_number();
            let matches = match expected_version {
                ExpectedVersion::Any => true,
                ExpectedVersion::NoStream => current < 0,
                ExpectedVersion::Exact(expected) => current == expected,
            };
            if !matches {
                return WriteResult::WrongExpectedVersion {
                    current_version: current,
                };
            }
            let first = current + 1;
            for event in events {
                let event_number = stream.last_event_number() + 1;
                stream.events.push(RecordedEvent {
                    stream_id: stream_id.clone(),
                    event_number,
                    event_id: event.event_id,
                    event_type: event.event_type,
                    data: event.data,
                    metadata: event.metadata,
                });
            }
            WriteResult::Success {
                first_event_number: first,
                last_event_number: stream.last_event_number(),
            }
        })
    }
}

/// Executes [`IoRequest`]s against an [`EventStorage`] on tokio tasks.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone)]
pub struct StorageDispatcher {
    storage: Arc<dyn EventStorage>,
    completions: mpsc::UnboundedSender<IoCompletion>,
}

impl StorageDispatcher {
    /// Create a dispatcher delivering completions to `completions`.
    pub fn new(
        storage: Arc<dyn EventStorage>,
        completions: mpsc::UnboundedSender<IoCompletion>,
    ) -> Self {
        Self {
            storage,
            completions,
        }
    }
}

impl IoDispatcher for StorageDispatcher {
    fn dispatch(&self, request: IoRequest) {
        let storage = Arc::clone(&self.storage);
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let completion = execute(storage.as_ref(), request).await;
            // The worker is gone; nobody waits for the completion.
            let _ = completions.send(completion);
        });
    }
}

async fn execute(storage: &dyn EventStorage, request: IoRequest) -> IoCompletion {
    match request {
        IoRequest::ReadBackward {
            correlation_id,
            stream_id,
            from_event_number,
            max_count,
        } => IoCompletion::StreamRead {
            correlation_id,
            result: storage
                .read_backward(stream_id, from_event_number, max_count)
                .await,
        },
        IoRequest::WriteEvents {
            correlation_id,
            stream_id,
            expected_version,
            events,
        } => {
            let count = events.len();
            let result = storage
                .write_events(stream_id.clone(), expected_version, events)
                .await;
            if !matches!(result, WriteResult::Success { .. }) {
                tracing::debug!(stream = %stream_id, count, ?result, "write rejected");
            }
            IoCompletion::EventsWritten {
                correlation_id,
                result,
            }
        }
        IoRequest::Delay {
            correlation_id,
            delay,
        } => {
            tokio::time::sleep(delay).await;
            IoCompletion::DelayElapsed { correlation_id }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;

    fn event(event_type: &str) -> EventToWrite {
        EventToWrite {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            is_json: true,
            data: "{}".into(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn writes_check_the_expected_version() {
        let storage = InMemoryEventStorage::default();
        let first = storage
            .write_events("s".into(), ExpectedVersion::NoStream, vec![event("A"), event("B")])
            .await;
        assert_eq!(
            first,
            WriteResult::Success {
                first_event_number: 0,
                last_event_number: 1
            }
        );
        let stale = storage
            .write_events("s".into(), ExpectedVersion::Exact(0), vec![event("C")])
            .await;
        assert_eq!(stale, WriteResult::WrongExpectedVersion { current_version: 1 });
        let again = storage
            .write_events("s".into(), ExpectedVersion::NoStream, vec![event("C")])
            .await;
        assert_eq!(again, WriteResult::WrongExpectedVersion { current_version: 1 });
        let next = storage
            .write_events("s".into(), ExpectedVersion::Exact(1), vec![event("C")])
            .await;
        assert!(matches!(next, WriteResult::Success { first_event_number: 2, .. }));
    }

    #[tokio::test]
    async fn reads_page_backward() {
        let storage = InMemoryEventStorage::default();
        storage
            .append("s", vec![event("A"), event("B"), event("C")])
            .await;

        let ReadResult::Success(newest) = storage.read_backward("s".into(), -1, 2).await else {
            panic!("expected events");
        };
        let types: Vec<&str> = newest.events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, ["C", "B"]);
        assert_eq!(newest.last_event_number, 2);
        assert!(!newest.is_end_of_stream);

        let ReadResult::Success(rest) = storage
            .read_backward("s".into(), newest.next_event_number, 2)
            .await
        else {
            panic!("expected events");
        };
        assert_eq!(rest.events.len(), 1);
        assert_eq!(rest.events[0].event_type, "A");
        assert!(rest.is_end_of_stream);
    }

    #[tokio::test]
    async fn deleted_streams_reject_reads_and_writes() {
        let storage = InMemoryEventStorage::default();
        storage.append("s", vec![event("A")]).await;
        storage.delete_stream("s").await;
        assert_eq!(
            storage.read_backward("s".into(), -1, 1).await,
            ReadResult::StreamDeleted
        );
        assert_eq!(storage.append("s", vec![event("B")]).await, WriteResult::StreamDeleted);
    }

    #[tokio::test]
    async fn dispatcher_delivers_completions() {
        let storage = Arc::new(InMemoryEventStorage::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = StorageDispatcher::new(storage.clone(), tx);

        let write_id = Uuid::new_v4();
        dispatcher.dispatch(IoRequest::WriteEvents {
            correlation_id: write_id,
            stream_id: "s".into(),
            expected_version: ExpectedVersion::NoStream,
            events: vec![event("A")],
        });
        let completion = rx.recv().await.expect("completion");
        assert_eq!(completion.correlation_id(), write_id);
        assert_eq!(storage.read_stream("s").await.len(), 1);

        let delay_id = Uuid::new_v4();
        dispatcher.dispatch(IoRequest::Delay {
            correlation_id: delay_id,
            delay: Duration::from_millis(1),
        });
        assert_eq!(
            rx.recv().await.expect("completion"),
            IoCompletion::DelayElapsed {
                correlation_id: delay_id
            }
        );
    }
}
