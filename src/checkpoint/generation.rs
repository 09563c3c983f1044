use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::ProjectionConfig;
use crate::error::ProjectionError;
use crate::event::EmittedEventEnvelope;
use crate::io::{IoCompletion, IoDispatcher};
use crate::tag::{CheckpointTag, ProjectionVersion};

use super::emitted_stream::{EmittedStream, StreamFailure};

#[derive(Debug)]
struct StreamSlot {
    lane: usize,
    reported: bool,
    stream: EmittedStream,
}

/// One checkpoint interval and the events emitted during it.
///
/// A generation collects emitted events from `from` onward until
/// [`prepare`](Self::prepare) closes it at a checkpoint position. It is
/// ready for the checkpoint to be written once every stream it routed
/// events to has flushed.
///
/// With a finite `maximum_write_concurrency` destination streams share
/// write lanes assigned round-robin, and only one stream per lane has a
/// request in flight at a time.
#[derive(Debug)]
pub struct ProjectionCheckpoint {
    from: CheckpointTag,
    last: CheckpointTag,
    version: ProjectionVersion,
    config: Arc<ProjectionConfig>,
    dispatcher: Arc<dyn IoDispatcher>,
    streams: BTreeMap<String, StreamSlot>,
    next_lane: usize,
    started: bool,
    prepared_at: Option<CheckpointTag>,
    outstanding: usize,
    ready_reported: bool,
}

impl ProjectionCheckpoint {
    /// Open a generation starting after the checkpoint at `from`.
    pub fn new(
        from: CheckpointTag,
        version: ProjectionVersion,
        config: Arc<ProjectionConfig>,
        dispatcher: Arc<dyn IoDispatcher>,
    ) -> Self {
        Self {
            last: from.clone(),
            from,
            version,
            config,
            dispatcher,
            streams: BTreeMap::new(),
            next_lane: 0,
            started: false,
            prepared_at: None,
            outstanding: 0,
            ready_reported: false,
        }
    }

    /// The checkpoint this generation starts after.
    pub fn from(&self) -> &CheckpointTag {
        &self.from
    }

    /// Highest causing tag routed through this generation.
    pub fn last(&self) -> &CheckpointTag {
        &self.last
    }

    /// Position the generation was closed at, if prepared.
    pub fn prepared_at(&self) -> Option<&CheckpointTag> {
        self.prepared_at.as_ref()
    }

    /// Whether the generation's streams may write.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Number of destination streams written by this generation.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Let every stream write, including streams created later.
    pub fn start(&mut self) {
        self.started = true;
        for slot in self.streams.values_mut() {
            slot.stream.start();
        }
        self.pump();
    }

    /// Route `events` to their destination streams.
    ///
    /// The generation's high-water mark is raised to the highest causing tag
    /// in the batch before any event is queued.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::CheckpointAlreadyRequested`] once the generation
    ///   is prepared.
    /// - [`ProjectionError::EmittedOutOfOrder`] if a stream receives an event
    ///   caused before the one queued ahead of it.
    pub fn validate_order_and_emit_events(
        &mut self,
        events: Vec<EmittedEventEnvelope>,
    ) -> Result<(), ProjectionError> {
        if self.prepared_at.is_some() {
            return Err(ProjectionError::CheckpointAlreadyRequested);
        }
        for envelope in &events {
            if envelope.event.caused_by_tag.try_gt(&self.last)? {
                self.last = envelope.event.caused_by_tag.clone();
            }
        }
        for envelope in events {
            let slot = self.slot_mut(&envelope.event.stream_id);
            if let Some(metadata) = envelope.stream_metadata {
                slot.stream.set_metadata(metadata);
            }
            slot.stream.emit(envelope.event)?;
        }
        self.pump();
        Ok(())
    }

    /// Close the generation at `position` and ask every stream to flush.
    ///
    /// Returns `true` if everything is already flushed. Otherwise readiness
    /// is reported later by [`handle_completion`](Self::handle_completion).
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::CheckpointAlreadyRequested`] if already prepared.
    /// - [`ProjectionError::InvalidCheckpointPosition`] if `position` is not
    ///   after the generation's start or is before its high-water mark.
    pub fn prepare(&mut self, position: CheckpointTag) -> Result<bool, ProjectionError> {
        if self.prepared_at.is_some() {
            return Err(ProjectionError::CheckpointAlreadyRequested);
        }
        if !position.try_gt(&self.from)? {
            return Err(ProjectionError::InvalidCheckpointPosition {
                position: position.to_string(),
                requirement: "after",
                bound: self.from.to_string(),
            });
        }
        if position.try_lt(&self.last)? {
            return Err(ProjectionError::InvalidCheckpointPosition {
                position: position.to_string(),
                requirement: "at or after",
                bound: self.last.to_string(),
            });
        }
        self.prepared_at = Some(position);
        // Held open until every stream has been asked, so a stream that is
        // already flushed cannot report readiness early.
        self.outstanding = 1 + self.streams.len();
        for slot in self.streams.values_mut() {
            if slot.stream.request_checkpoint() {
                slot.reported = true;
                self.outstanding -= 1;
            }
        }
        self.outstanding -= 1;
        self.pump();
        Ok(self.take_ready())
    }

    /// Whether `completion` answers a request of one of this generation's
    /// streams.
    pub fn owns(&self, completion: &IoCompletion) -> bool {
        self.streams.values().any(|slot| slot.stream.owns(completion))
    }

    /// Handle the completion of a stream request and issue follow-up writes.
    ///
    /// Returns `true` exactly once, when the prepared generation becomes
    /// ready for its checkpoint.
    ///
    /// # Errors
    ///
    /// Returns the [`StreamFailure`] of a stream that cannot be written.
    pub fn handle_completion(&mut self, completion: &IoCompletion) -> Result<bool, StreamFailure> {
        let Some(slot) = self
            .streams
            .values_mut()
            .find(|slot| slot.stream.owns(completion))
        else {
            return Ok(false);
        };
        slot.stream.handle_completion(completion)?;
        if slot.stream.is_checkpoint_requested() && !slot.reported && slot.stream.is_flushed() {
            slot.reported = true;
            self.outstanding = self.outstanding.saturating_sub(1);
        }
        self.pump();
        Ok(self.take_ready())
    }

    fn take_ready(&mut self) -> bool {
        if self.prepared_at.is_none() || self.outstanding > 0 || self.ready_reported {
            return false;
        }
        self.ready_reported = true;
        true
    }

    fn slot_mut(&mut self, stream_id: &str) -> &mut StreamSlot {
        let lanes = self.config.maximum_write_concurrency;
        let next_lane = &mut self.next_lane;
        let version = self.version;
        let config = &self.config;
        let dispatcher = &self.dispatcher;
        let started = self.started;
        self.streams
            .entry(stream_id.to_owned())
            .or_insert_with(|| {
                let lane = match lanes {
                    Some(count) => {
                        let lane = *next_lane % count;
                        *next_lane += 1;
                        lane
                    }
                    None => 0,
                };
                let mut stream =
                    EmittedStream::new(stream_id, version, config.clone(), dispatcher.clone());
                if started {
                    stream.start();
                }
                StreamSlot {
                    lane,
                    reported: false,
                    stream,
                }
            })
    }

    fn pump(&mut self) {
        if !self.started {
            return;
        }
        let Some(lanes) = self.config.maximum_write_concurrency else {
            for slot in self.streams.values_mut() {
                slot.stream.issue();
            }
            return;
        };
        let mut busy = vec![false; lanes];
        for slot in self.streams.values() {
            if slot.stream.is_busy() {
                busy[slot.lane] = true;
            }
        }
        for slot in self.streams.values_mut() {
            if !busy[slot.lane] && slot.stream.issue() {
                busy[slot.lane] = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EmittedEvent;
    use crate::io::IoRequest;
    use crate::io::testing::{RecordingDispatcher, no_stream, written_after};
    use crate::tag::TfPos;

    fn tag(commit: i64) -> CheckpointTag {
        CheckpointTag::from_position(0, TfPos::new(commit, commit - 1)).expect("valid tag")
    }

    fn envelope(stream: &str, at: i64) -> EmittedEventEnvelope {
        EmittedEventEnvelope::new(EmittedEvent::new(stream, "Derived", None, tag(at)))
    }

    fn generation(config: ProjectionConfig) -> (ProjectionCheckpoint, Arc<RecordingDispatcher>) {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let generation = ProjectionCheckpoint::new(
            tag(0),
            ProjectionVersion::new(1, 0, 1),
            Arc::new(config),
            dispatcher.clone(),
        );
        (generation, dispatcher)
    }

    /// Complete every outstanding request successfully until the generation
    /// stops issuing new ones. Returns whether it reported ready.
    fn drain(generation: &mut ProjectionCheckpoint, dispatcher: &RecordingDispatcher) -> bool {
        let mut ready = false;
        loop {
            let requests = dispatcher.take();
            if requests.is_empty() {
                return ready;
            }
            for request in requests {
                let completion = match &request {
                    IoRequest::ReadBackward { .. } => no_stream(&request),
                    _ => written_after(&request, -1),
                };
                assert!(generation.owns(&completion));
                ready |= generation
                    .handle_completion(&completion)
                    .expect("write succeeds");
            }
        }
    }

    #[test]
    fn high_water_mark_bounds_the_checkpoint_position() {
        let (mut generation, _dispatcher) = generation(ProjectionConfig::default());
        generation
            .validate_order_and_emit_events(vec![
                envelope("a", 10),
                envelope("b", 20),
                envelope("c", 30),
            ])
            .expect("in order");
        assert_eq!(generation.last(), &tag(30));

        assert!(matches!(
            generation.prepare(tag(10)),
            Err(ProjectionError::InvalidCheckpointPosition { .. })
        ));
        assert!(generation.prepare(tag(30)).is_ok());
    }

    #[test]
    fn prepare_must_move_past_the_start() {
        let (mut generation, _dispatcher) = generation(ProjectionConfig::default());
        assert!(matches!(
            generation.prepare(tag(0)),
            Err(ProjectionError::InvalidCheckpointPosition { .. })
        ));
    }

    #[test]
    fn empty_generation_is_ready_immediately() {
        let (mut generation, _dispatcher) = generation(ProjectionConfig::default());
        assert!(generation.prepare(tag(5)).expect("valid position"));
        assert!(matches!(
            generation.prepare(tag(6)),
            Err(ProjectionError::CheckpointAlreadyRequested)
        ));
    }

    #[test]
    fn emitting_after_prepare_is_rejected() {
        let (mut generation, _dispatcher) = generation(ProjectionConfig::default());
        generation.prepare(tag(5)).expect("valid position");
        assert!(matches!(
            generation.validate_order_and_emit_events(vec![envelope("a", 6)]),
            Err(ProjectionError::CheckpointAlreadyRequested)
        ));
    }

    #[test]
    fn unstarted_generation_holds_its_writes() {
        let (mut generation, dispatcher) = generation(ProjectionConfig::default());
        generation
            .validate_order_and_emit_events(vec![envelope("a", 10)])
            .expect("in order");
        assert!(dispatcher.take().is_empty());
        assert!(!generation.prepare(tag(10)).expect("valid"));

        generation.start();
        assert!(drain(&mut generation, &dispatcher));
    }

    #[test]
    fn ready_waits_for_every_stream() {
        let (mut generation, dispatcher) = generation(ProjectionConfig::default());
        generation.start();
        generation
            .validate_order_and_emit_events(vec![envelope("a", 10), envelope("b", 10)])
            .expect("in order");
        assert!(!generation.prepare(tag(10)).expect("valid"));
        assert_eq!(generation.stream_count(), 2);
        assert!(drain(&mut generation, &dispatcher));
        assert!(!drain(&mut generation, &dispatcher), "ready reported once");
    }

    #[test]
    fn write_lanes_limit_requests_in_flight() {
        let (mut generation, dispatcher) = generation(ProjectionConfig {
            maximum_write_concurrency: Some(1),
            ..ProjectionConfig::default()
        });
        generation.start();
        generation
            .validate_order_and_emit_events(vec![envelope("a", 10), envelope("b", 10)])
            .expect("in order");
        let requests = dispatcher.take();
        assert_eq!(requests.len(), 1, "one lane, one request");

        let completion = no_stream(&requests[0]);
        generation.handle_completion(&completion).expect("read ok");
        assert_eq!(dispatcher.take().len(), 1);
    }

    #[test]
    fn out_of_order_emission_to_one_stream_fails() {
        let (mut generation, _dispatcher) = generation(ProjectionConfig::default());
        assert!(matches!(
            generation.validate_order_and_emit_events(vec![envelope("a", 20), envelope("a", 10)]),
            Err(ProjectionError::EmittedOutOfOrder { .. })
        ));
    }
}
