use std::collections::VecDeque;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::ProjectionConfig;
use crate::error::ProjectionError;
use crate::event::{EmittedEvent, EmittedStreamMetadata};
use crate::io::{
    EventToWrite, ExpectedVersion, IoCompletion, IoDispatcher, IoRequest, ReadResult, WriteResult,
};
use crate::names::{ProjectionNames, STREAM_METADATA_EVENT_TYPE};
use crate::tag::{CheckpointTag, ProjectionVersion};

/// Why an emitted stream stopped writing for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFailure {
    /// The projection cannot continue.
    Failed(String),
    /// The stream changed under the projection; restarting from the last
    /// checkpoint recovers.
    RestartRequested(String),
}

#[derive(Debug)]
enum InFlight {
    ReadLast,
    Metadata,
    Events(Vec<EmittedEvent>),
    Delay,
}

/// Queues and writes the events a projection emits to one stream.
///
/// Before the first write the stream's last event is read so that events
/// already written before a restart are not written twice: every queued
/// event whose causing tag is at or before the tag stored in that event's
/// metadata is dropped. Events are then appended in batches, each expecting
/// the stream to end at the previously written event.
///
/// At most one request is in flight at a time. Writing begins once the
/// stream is [started](Self::start).
#[derive(Debug)]
pub struct EmittedStream {
    stream_id: String,
    version: ProjectionVersion,
    config: Arc<ProjectionConfig>,
    dispatcher: Arc<dyn IoDispatcher>,
    metadata: Option<EmittedStreamMetadata>,
    metadata_written: bool,
    pending: VecDeque<EmittedEvent>,
    last_queued_tag: Option<CheckpointTag>,
    last_event_number: Option<i64>,
    in_flight: Option<(Uuid, InFlight)>,
    failures: u32,
    started: bool,
    checkpoint_requested: bool,
    failed: bool,
}

impl EmittedStream {
    /// Create an idle writer for `stream_id`.
    pub fn new(
        stream_id: impl Into<String>,
        version: ProjectionVersion,
        config: Arc<ProjectionConfig>,
        dispatcher: Arc<dyn IoDispatcher>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            version,
            config,
            dispatcher,
            metadata: None,
            metadata_written: false,
            pending: VecDeque::new(),
            last_queued_tag: None,
            last_event_number: None,
            in_flight: None,
            failures: 0,
            started: false,
            checkpoint_requested: false,
            failed: false,
        }
    }

    /// Destination stream.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Metadata to write to the stream before its first event. Only the
    /// first metadata supplied is kept.
    pub fn set_metadata(&mut self, metadata: EmittedStreamMetadata) {
        if self.metadata.is_none() {
            self.metadata = Some(metadata);
        }
    }

    /// Queue `event`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::EmittedOutOfOrder`] if the event was caused
    /// by an earlier event than the one queued before it, or a tag error if
    /// the two causing tags cannot be compared.
    pub fn emit(&mut self, event: EmittedEvent) -> Result<(), ProjectionError> {
        if let Some(last) = &self.last_queued_tag
            && event.caused_by_tag.try_lt(last)?
        {
            return Err(ProjectionError::EmittedOutOfOrder {
                stream: self.stream_id.clone(),
                last: last.to_string(),
                current: event.caused_by_tag.to_string(),
            });
        }
        self.last_queued_tag = Some(event.caused_by_tag.clone());
        self.pending.push_back(event);
        Ok(())
    }

    /// Allow the stream to write.
    pub fn start(&mut self) {
        self.started = true;
    }

    /// Mark the stream as part of a checkpoint. Returns whether everything
    /// queued is already written.
    pub fn request_checkpoint(&mut self) -> bool {
        self.checkpoint_requested = true;
        self.is_flushed()
    }

    /// Whether [`request_checkpoint`](Self::request_checkpoint) was called.
    pub fn is_checkpoint_requested(&self) -> bool {
        self.checkpoint_requested
    }

    /// Whether nothing is queued or in flight.
    pub fn is_flushed(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_none()
    }

    /// Whether a request is in flight.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Number of events waiting to be written.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether `completion` answers this stream's in-flight request.
    pub fn owns(&self, completion: &IoCompletion) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|(id, _)| *id == completion.correlation_id())
    }

    /// Issue the next request if the stream is started, idle and has events
    /// to write. Returns whether a request was issued.
    pub fn issue(&mut self) -> bool {
        if self.failed || !self.started || self.in_flight.is_some() || self.pending.is_empty() {
            return false;
        }
        let correlation_id = Uuid::new_v4();
        let (kind, request) = match self.last_event_number {
            None => (
                InFlight::ReadLast,
                IoRequest::ReadBackward {
                    correlation_id,
                    stream_id: self.stream_id.clone(),
                    from_event_number: -1,
                    max_count: 1,
                },
            ),
            Some(_) if !self.metadata_written && self.metadata.is_some() => {
                let data = serde_json::to_string(&self.metadata).unwrap_or_default();
                (
                    InFlight::Metadata,
                    IoRequest::WriteEvents {
                        correlation_id,
                        stream_id: ProjectionNames::metadata_stream(&self.stream_id),
                        expected_version: ExpectedVersion::Any,
                        events: vec![EventToWrite {
                            event_id: Uuid::new_v4(),
                            event_type: STREAM_METADATA_EVENT_TYPE.to_owned(),
                            is_json: true,
                            data,
                            metadata: None,
                        }],
                    },
                )
            }
            Some(last) => {
                let count = self.pending.len().min(self.config.max_write_batch_length);
                let batch: Vec<EmittedEvent> = self.pending.drain(..count).collect();
                let events = batch
                    .iter()
                    .map(|event| event.to_event_data(&self.version))
                    .collect();
                (
                    InFlight::Events(batch),
                    IoRequest::WriteEvents {
                        correlation_id,
                        stream_id: self.stream_id.clone(),
                        expected_version: ExpectedVersion::after(last),
                        events,
                    },
                )
            }
        };
        self.in_flight = Some((correlation_id, kind));
        self.dispatcher.dispatch(request);
        true
    }

    /// Handle the completion of this stream's in-flight request. The caller
    /// issues the next request.
    ///
    /// # Errors
    ///
    /// Returns a [`StreamFailure`] when the stream cannot be written. The
    /// stream stays failed afterwards.
    pub fn handle_completion(&mut self, completion: &IoCompletion) -> Result<(), StreamFailure> {
        if !self.owns(completion) {
            return Ok(());
        }
        let Some((_, kind)) = self.in_flight.take() else {
            return Ok(());
        };
        let outcome = match (kind, completion) {
            (InFlight::Delay, IoCompletion::DelayElapsed { .. }) => Ok(()),
            (InFlight::ReadLast, IoCompletion::StreamRead { result, .. }) => self.handle_read(result),
            (InFlight::Metadata, IoCompletion::EventsWritten { result, .. }) => {
                self.handle_metadata_written(*result)
            }
            (InFlight::Events(batch), IoCompletion::EventsWritten { result, .. }) => {
                self.handle_events_written(batch, *result)
            }
            (kind, completion) => {
                tracing::debug!(
                    stream = %self.stream_id,
                    request = ?kind,
                    completion = ?completion,
                    "ignoring mismatched completion"
                );
                Ok(())
            }
        };
        if let Err(failure) = &outcome {
            self.failed = true;
            tracing::error!(stream = %self.stream_id, failure = ?failure, "emitted stream failed");
        }
        outcome
    }

    fn handle_read(&mut self, result: &ReadResult) -> Result<(), StreamFailure> {
        match result {
            ReadResult::Success(slice) => {
                match slice.events.first() {
                    Some(last) => {
                        self.last_event_number = Some(last.event_number);
                        self.metadata_written = true;
                        if let Some(metadata) = &last.metadata
                            && let Ok(stored) = CheckpointTag::from_json(metadata)
                        {
                            self.drop_already_written(&stored.tag)?;
                        }
                    }
                    None => {
                        self.last_event_number = Some(slice.last_event_number);
                        self.metadata_written = slice.last_event_number >= 0;
                    }
                }
                self.failures = 0;
                Ok(())
            }
            ReadResult::NoStream => {
                self.last_event_number = Some(-1);
                self.metadata_written = false;
                self.failures = 0;
                Ok(())
            }
            ReadResult::Timeout => self.retry("read"),
            ReadResult::StreamDeleted | ReadResult::AccessDenied => Err(StreamFailure::Failed(
                format!("cannot read emitted stream `{}`: {result:?}", self.stream_id),
            )),
        }
    }

    fn drop_already_written(&mut self, written: &CheckpointTag) -> Result<(), StreamFailure> {
        let mut dropped = 0;
        while let Some(front) = self.pending.front() {
            let already = front
                .caused_by_tag
                .try_le(written)
                .map_err(|e| StreamFailure::Failed(e.to_string()))?;
            if !already {
                break;
            }
            self.pending.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            tracing::debug!(
                stream = %self.stream_id,
                dropped,
                written = %written,
                "skipping events written before restart"
            );
        }
        Ok(())
    }

    fn handle_metadata_written(&mut self, result: WriteResult) -> Result<(), StreamFailure> {
        match result {
            WriteResult::Success { .. } => {
                self.metadata_written = true;
                self.failures = 0;
                Ok(())
            }
            result if result.is_timeout() => self.retry("metadata write"),
            result => Err(StreamFailure::Failed(format!(
                "cannot write metadata of emitted stream `{}`: {result:?}",
                self.stream_id
            ))),
        }
    }

    fn handle_events_written(
        &mut self,
        batch: Vec<EmittedEvent>,
        result: WriteResult,
    ) -> Result<(), StreamFailure> {
        match result {
            WriteResult::Success {
                last_event_number, ..
            } => {
                self.last_event_number = Some(last_event_number);
                self.failures = 0;
                Ok(())
            }
            result if result.is_timeout() => {
                for event in batch.into_iter().rev() {
                    self.pending.push_front(event);
                }
                self.retry("write")
            }
            WriteResult::WrongExpectedVersion { current_version } => {
                Err(StreamFailure::RestartRequested(format!(
                    "emitted stream `{}` was written concurrently \
                     (expected version {}, actual {current_version})",
                    self.stream_id,
                    self.last_event_number.unwrap_or(-1)
                )))
            }
            result => Err(StreamFailure::Failed(format!(
                "cannot write to emitted stream `{}`: {result:?}",
                self.stream_id
            ))),
        }
    }

    fn retry(&mut self, operation: &str) -> Result<(), StreamFailure> {
        self.failures += 1;
        if self.failures > self.config.max_allowed_write_retries {
            return Err(StreamFailure::Failed(format!(
                "emitted stream `{}` {operation} timed out {} times",
                self.stream_id, self.failures
            )));
        }
        let delay = self.config.emitted_retry_delay(self.failures);
        tracing::warn!(
            stream = %self.stream_id,
            operation,
            attempt = self.failures,
            delay_ms = delay.as_millis() as u64,
            "emitted stream request timed out, retrying"
        );
        let correlation_id = Uuid::new_v4();
        self.in_flight = Some((correlation_id, InFlight::Delay));
        self.dispatcher.dispatch(IoRequest::Delay {
            correlation_id,
            delay,
        });
        Ok(())
    }
}
