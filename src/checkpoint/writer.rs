use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use uuid::Uuid;

use crate::error::ProjectionError;
use crate::io::{EventToWrite, ExpectedVersion, IoCompletion, IoDispatcher, IoRequest, WriteResult};
use crate::names::{
    ADMINS_ROLE, PROJECTION_CHECKPOINT_EVENT_TYPE, ProjectionNames, STREAM_METADATA_EVENT_TYPE,
};
use crate::partition::PartitionState;
use crate::tag::{CheckpointTag, ProjectionVersion};

/// Number of failed attempts after which a checkpoint write is abandoned.
pub const MAX_CHECKPOINT_WRITE_ATTEMPTS: u32 = 12;

/// Payload size above which a one-time warning is logged.
pub const LARGE_CHECKPOINT_BYTES: usize = 8_000_000;

/// Result of a checkpoint write, once it is final.
#[derive(Debug, Clone, PartialEq)]
pub enum WriterOutcome {
    /// The checkpoint at this tag is durable.
    Written(CheckpointTag),
    /// The write failed permanently.
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Metadata,
    Checkpoint,
}

#[derive(Debug)]
struct PendingWrite {
    tag: CheckpointTag,
    event: EventToWrite,
    failures: u32,
    step: Step,
    waiting_for: Uuid,
}

/// Delay before retry `attempt` of a timed-out checkpoint write.
///
/// The first retry is immediate; later ones wait a random whole number of
/// seconds in `1..=min(2^(attempt-1), 256)`.
pub(crate) fn retry_delay(attempt: u32) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let ceiling = 2u64.saturating_pow(attempt - 1).min(256);
    Duration::from_secs(rand::thread_rng().gen_range(1..=ceiling))
}

/// Appends checkpoint events to a projection's checkpoint stream.
///
/// Before the first checkpoint of a new stream the writer restricts the
/// stream's access through its metadata stream. Each checkpoint is appended
/// at the expected next event number. Timeouts are retried with randomized
/// backoff; a wrong expected version means another writer touched the
/// stream and fails immediately.
#[derive(Debug)]
pub struct CheckpointWriter {
    checkpoint_stream: String,
    version: ProjectionVersion,
    dispatcher: Arc<dyn IoDispatcher>,
    last_written_event_number: i64,
    metadata_written: bool,
    pending: Option<PendingWrite>,
    large_payload_warned: bool,
}

impl CheckpointWriter {
    /// Create a writer for the checkpoint stream of the projection named by
    /// `names`.
    pub fn new(
        names: &ProjectionNames,
        version: ProjectionVersion,
        dispatcher: Arc<dyn IoDispatcher>,
    ) -> Self {
        Self {
            checkpoint_stream: names.checkpoint_stream(),
            version,
            dispatcher,
            last_written_event_number: -1,
            metadata_written: false,
            pending: None,
            large_payload_warned: false,
        }
    }

    /// Abandon any write in progress and forget the stream position.
    pub fn initialize(&mut self) {
        self.pending = None;
        self.last_written_event_number = -1;
        self.metadata_written = false;
    }

    /// Continue after the checkpoint at `event_number` (`-1` when the stream
    /// does not exist, in which case its metadata is written first).
    pub fn start_from(&mut self, event_number: i64) {
        self.last_written_event_number = event_number;
        self.metadata_written = event_number != -1;
    }

    /// Event number of the last checkpoint written.
    pub fn last_written_event_number(&self) -> i64 {
        self.last_written_event_number
    }

    /// Whether a checkpoint write is in flight.
    pub fn is_writing(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether `completion` answers a request of this writer.
    pub fn owns(&self, completion: &IoCompletion) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|p| p.waiting_for == completion.correlation_id())
    }

    /// Start writing the checkpoint at `tag` with the root partition's
    /// `state`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::CheckpointInProgress`] if a write is
    /// already in flight.
    pub fn begin_write_checkpoint(
        &mut self,
        tag: &CheckpointTag,
        state: &PartitionState,
    ) -> Result<(), ProjectionError> {
        if self.pending.is_some() {
            return Err(ProjectionError::CheckpointInProgress);
        }
        let event = EventToWrite {
            event_id: Uuid::new_v4(),
            event_type: PROJECTION_CHECKPOINT_EVENT_TYPE.to_owned(),
            is_json: true,
            data: tag.to_json_string_with(&self.version, &serde_json::Map::new()),
            metadata: Some(state.serialize()),
        };
        let size = event.data.len() + event.metadata.as_ref().map_or(0, String::len);
        if size > LARGE_CHECKPOINT_BYTES && !self.large_payload_warned {
            self.large_payload_warned = true;
            tracing::warn!(
                stream = %self.checkpoint_stream,
                size,
                "checkpoint payload is approaching the maximum event size"
            );
        }
        let step = if self.metadata_written {
            Step::Checkpoint
        } else {
            Step::Metadata
        };
        self.pending = Some(PendingWrite {
            tag: tag.clone(),
            event,
            failures: 0,
            step,
            waiting_for: Uuid::nil(),
        });
        self.issue();
        Ok(())
    }

    /// Handle the completion of one of this writer's requests.
    ///
    /// Returns the final outcome once the checkpoint is written or has
    /// failed, and `None` while the write is still in progress or when the
    /// completion is not this writer's.
    pub fn handle_completion(&mut self, completion: &IoCompletion) -> Option<WriterOutcome> {
        if !self.owns(completion) {
            return None;
        }
        match completion {
            IoCompletion::DelayElapsed { .. } => {
                self.issue();
                None
            }
            IoCompletion::EventsWritten { result, .. } => self.handle_write(*result),
            IoCompletion::StreamRead { .. } => None,
        }
    }

    fn handle_write(&mut self, result: WriteResult) -> Option<WriterOutcome> {
        let pending = self.pending.as_mut()?;
        match (result, pending.step) {
            (WriteResult::Success { .. }, Step::Metadata) => {
                self.metadata_written = true;
                pending.step = Step::Checkpoint;
                self.issue();
                None
            }
            (
                WriteResult::Success {
                    last_event_number, ..
                },
                Step::Checkpoint,
            ) => {
                self.last_written_event_number = last_event_number;
                let done = self.pending.take()?;
                tracing::debug!(
                    stream = %self.checkpoint_stream,
                    tag = %done.tag,
                    event_number = last_event_number,
                    "checkpoint written"
                );
                Some(WriterOutcome::Written(done.tag))
            }
            (result, _) if result.is_timeout() => {
                pending.failures += 1;
                if pending.failures >= MAX_CHECKPOINT_WRITE_ATTEMPTS {
                    let reason = format!(
                        "failed to write checkpoint to `{}` after {} attempts: {result:?}",
                        self.checkpoint_stream, pending.failures
                    );
                    return Some(self.fail(reason));
                }
                let delay = retry_delay(pending.failures);
                tracing::warn!(
                    stream = %self.checkpoint_stream,
                    attempt = pending.failures,
                    delay_ms = delay.as_millis() as u64,
                    result = ?result,
                    "checkpoint write timed out, retrying"
                );
                if delay.is_zero() {
                    self.issue();
                } else {
                    let correlation_id = Uuid::new_v4();
                    pending.waiting_for = correlation_id;
                    self.dispatcher.dispatch(IoRequest::Delay {
                        correlation_id,
                        delay,
                    });
                }
                None
            }
            (WriteResult::WrongExpectedVersion { current_version }, _) => {
                let reason = format!(
                    "checkpoint stream `{}` was written by another writer \
                     (expected version {}, actual {current_version})",
                    self.checkpoint_stream, self.last_written_event_number
                );
                Some(self.fail(reason))
            }
            (result, _) => {
                let reason = format!(
                    "failed to write checkpoint to `{}`: {result:?}",
                    self.checkpoint_stream
                );
                Some(self.fail(reason))
            }
        }
    }

    fn fail(&mut self, reason: String) -> WriterOutcome {
        self.pending = None;
        tracing::error!(stream = %self.checkpoint_stream, reason = %reason, "checkpoint write failed");
        WriterOutcome::Failed(reason)
    }

    fn issue(&mut self) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        let correlation_id = Uuid::new_v4();
        pending.waiting_for = correlation_id;
        let request = match pending.step {
            Step::Metadata => IoRequest::WriteEvents {
                correlation_id,
                stream_id: ProjectionNames::metadata_stream(&self.checkpoint_stream),
                expected_version: ExpectedVersion::Any,
                events: vec![EventToWrite {
                    event_id: Uuid::new_v4(),
                    event_type: STREAM_METADATA_EVENT_TYPE.to_owned(),
                    is_json: true,
                    data: serde_json::json!({
                        "$acl": { "$r": ADMINS_ROLE, "$w": ADMINS_ROLE }
                    })
                    .to_string(),
                    metadata: None,
                }],
            },
            Step::Checkpoint => IoRequest::WriteEvents {
                correlation_id,
                stream_id: self.checkpoint_stream.clone(),
                expected_version: ExpectedVersion::after(self.last_written_event_number),
                events: vec![pending.event.clone()],
            },
        };
        self.dispatcher.dispatch(request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::testing::{RecordingDispatcher, written, written_after};
    use crate::tag::TfPos;

    fn tag(commit: i64) -> CheckpointTag {
        CheckpointTag::from_position(0, TfPos::new(commit, commit - 1)).expect("valid tag")
    }

    fn setup() -> (CheckpointWriter, Arc<RecordingDispatcher>) {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let writer = CheckpointWriter::new(
            &ProjectionNames::new("p"),
            ProjectionVersion::new(1, 0, 1),
            dispatcher.clone(),
        );
        (writer, dispatcher)
    }

    fn state(at: i64) -> PartitionState {
        PartitionState::new(Some(r#"{"n":1}"#.into()), None, tag(at))
    }

    fn single(dispatcher: &RecordingDispatcher) -> IoRequest {
        let mut requests = dispatcher.take();
        assert_eq!(requests.len(), 1, "expected exactly one request");
        requests.remove(0)
    }

    #[test]
    fn retry_delay_bounds() {
        assert_eq!(retry_delay(1), Duration::ZERO);
        for attempt in 2..=12 {
            let delay = retry_delay(attempt).as_secs();
            let ceiling = 2u64.pow(attempt - 1).min(256);
            assert!((1..=ceiling).contains(&delay), "attempt {attempt}: {delay}");
        }
    }

    #[test]
    fn first_checkpoint_writes_metadata_then_checkpoint() {
        let (mut writer, dispatcher) = setup();
        writer.start_from(-1);
        writer
            .begin_write_checkpoint(&tag(10), &state(10))
            .expect("not writing");

        let metadata = single(&dispatcher);
        let IoRequest::WriteEvents {
            stream_id,
            expected_version,
            events,
            ..
        } = &metadata
        else {
            panic!("expected a write, got {metadata:?}");
        };
        assert_eq!(stream_id, "$$$projections-p-checkpoint");
        assert_eq!(*expected_version, ExpectedVersion::Any);
        assert_eq!(events[0].event_type, STREAM_METADATA_EVENT_TYPE);
        assert!(events[0].data.contains("$admins"));
        assert_eq!(writer.handle_completion(&written_after(&metadata, -1)), None);

        let checkpoint = single(&dispatcher);
        let IoRequest::WriteEvents {
            stream_id,
            expected_version,
            events,
            ..
        } = &checkpoint
        else {
            panic!("expected a write, got {checkpoint:?}");
        };
        assert_eq!(stream_id, "$projections-p-checkpoint");
        assert_eq!(*expected_version, ExpectedVersion::NoStream);
        assert_eq!(events[0].event_type, PROJECTION_CHECKPOINT_EVENT_TYPE);
        let decoded = CheckpointTag::from_json(&events[0].data).expect("tag json");
        assert_eq!(decoded.tag, tag(10));
        assert_eq!(decoded.version, ProjectionVersion::new(1, 0, 1));

        assert_eq!(
            writer.handle_completion(&written_after(&checkpoint, -1)),
            Some(WriterOutcome::Written(tag(10)))
        );
        assert_eq!(writer.last_written_event_number(), 0);
        assert!(!writer.is_writing());
    }

    #[test]
    fn existing_stream_skips_metadata_and_expects_last_number() {
        let (mut writer, dispatcher) = setup();
        writer.start_from(4);
        writer
            .begin_write_checkpoint(&tag(10), &state(10))
            .expect("not writing");
        let request = single(&dispatcher);
        assert!(matches!(
            &request,
            IoRequest::WriteEvents {
                expected_version: ExpectedVersion::Exact(4),
                ..
            }
        ));
    }

    #[test]
    fn second_write_while_writing_is_rejected() {
        let (mut writer, _dispatcher) = setup();
        writer.start_from(0);
        writer
            .begin_write_checkpoint(&tag(10), &state(10))
            .expect("not writing");
        assert!(matches!(
            writer.begin_write_checkpoint(&tag(20), &state(20)),
            Err(ProjectionError::CheckpointInProgress)
        ));
    }

    #[test]
    fn wrong_expected_version_fails_without_retry() {
        let (mut writer, dispatcher) = setup();
        writer.start_from(3);
        writer
            .begin_write_checkpoint(&tag(10), &state(10))
            .expect("not writing");
        let request = single(&dispatcher);
        let outcome = writer.handle_completion(&written(
            &request,
            WriteResult::WrongExpectedVersion { current_version: 7 },
        ));
        assert!(matches!(outcome, Some(WriterOutcome::Failed(_))));
        assert!(dispatcher.take().is_empty());
    }

    #[test]
    fn twelve_commit_timeouts_fail_on_the_twelfth() {
        let (mut writer, dispatcher) = setup();
        writer.start_from(0);
        writer
            .begin_write_checkpoint(&tag(10), &state(10))
            .expect("not writing");

        for attempt in 1..=12u32 {
            // Skip over backoff delays by completing them.
            let mut request = single(&dispatcher);
            while let IoRequest::Delay { correlation_id, .. } = request {
                assert_eq!(
                    writer.handle_completion(&IoCompletion::DelayElapsed { correlation_id }),
                    None
                );
                request = single(&dispatcher);
            }
            let outcome = writer.handle_completion(&written(&request, WriteResult::CommitTimeout));
            if attempt < 12 {
                assert_eq!(outcome, None, "attempt {attempt} must retry");
            } else {
                assert!(
                    matches!(outcome, Some(WriterOutcome::Failed(_))),
                    "attempt {attempt} must fail"
                );
            }
        }
        assert!(dispatcher.take().is_empty());
        assert!(!writer.is_writing());
    }

    #[test]
    fn first_retry_is_immediate() {
        let (mut writer, dispatcher) = setup();
        writer.start_from(0);
        writer
            .begin_write_checkpoint(&tag(10), &state(10))
            .expect("not writing");
        let request = single(&dispatcher);
        writer.handle_completion(&written(&request, WriteResult::PrepareTimeout));
        assert!(matches!(single(&dispatcher), IoRequest::WriteEvents { .. }));
    }

    #[test]
    fn foreign_completions_are_ignored() {
        let (mut writer, _dispatcher) = setup();
        writer.start_from(0);
        writer
            .begin_write_checkpoint(&tag(10), &state(10))
            .expect("not writing");
        let foreign = IoCompletion::DelayElapsed {
            correlation_id: Uuid::new_v4(),
        };
        assert!(!writer.owns(&foreign));
        assert_eq!(writer.handle_completion(&foreign), None);
        assert!(writer.is_writing());
    }
}
