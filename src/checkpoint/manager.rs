use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::ProjectionConfig;
use crate::error::{ProjectionError, TagError};
use crate::event::{EmittedEvent, EmittedEventEnvelope};
use crate::io::{IoCompletion, IoDispatcher, IoRequest, ReadResult};
use crate::messages::ProjectionNotification;
use crate::names::{PARTITION_CHECKPOINT_EVENT_TYPE, ProjectionNames};
use crate::partition::{PartitionState, ROOT_PARTITION};
use crate::position::{PositionTagger, PositionTracker};
use crate::tag::{CheckpointTag, ProjectionVersion};

use super::emitted_stream::StreamFailure;
use super::generation::ProjectionCheckpoint;
use super::writer::{CheckpointWriter, WriterOutcome};

/// Events read per page while searching a partition checkpoint stream.
const PARTITION_READ_PAGE: usize = 10;

/// Lifecycle of a [`CheckpointManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Created or reset; waiting for [`CheckpointManager::start`].
    Uninitialized,
    /// Tracking progress and writing checkpoints.
    Started,
    /// Draining the final checkpoint.
    Stopping,
    /// Done; further calls are rejected.
    Stopped,
}

/// Something the owner of a [`CheckpointManager`] has to react to.
///
/// Signals are collected while the manager handles a call and are taken
/// with [`CheckpointManager::drain_signals`].
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerSignal {
    /// The last checkpoint was read; processing resumes after `tag`.
    CheckpointLoaded {
        /// Tag to resume after, adjusted to the current reader strategy.
        tag: CheckpointTag,
        /// Root partition state stored with the checkpoint.
        root_state: Option<PartitionState>,
    },
    /// A partition state requested with
    /// [`CheckpointManager::begin_load_partition_state_at`] was read.
    PartitionStateLoaded {
        /// The partition.
        partition: String,
        /// Tag the state was requested at.
        at: CheckpointTag,
        /// The newest state at or before `at`, if any was checkpointed.
        state: Option<PartitionState>,
    },
    /// A checkpoint and every event emitted before it are durable.
    CheckpointCompleted(CheckpointTag),
    /// The stop checkpoint completed.
    Stopped,
    /// The projection cannot continue.
    Failed(String),
    /// The projection must restart from its last checkpoint.
    RestartRequested(String),
}

#[derive(Debug)]
struct Generations {
    active: ProjectionCheckpoint,
    closing: Option<ProjectionCheckpoint>,
}

impl Generations {
    /// Replace the active generation with `next` and return the previous
    /// one, now closing.
    fn rotate(&mut self, next: ProjectionCheckpoint) -> &mut ProjectionCheckpoint {
        let previous = std::mem::replace(&mut self.active, next);
        self.closing.insert(previous)
    }
}

#[derive(Debug)]
enum PendingRead {
    Checkpoint,
    Partition {
        partition: String,
        at: CheckpointTag,
        from_event_number: i64,
    },
}

/// Tracks a projection's progress and turns it into durable checkpoints.
///
/// Emitted events are routed through checkpoint generations: while one
/// generation drains its writes before a checkpoint, events emitted
/// afterwards collect in the next one and are not written until the
/// checkpoint completes. A checkpoint is therefore only written once every
/// event emitted before it is durable.
///
/// The manager never blocks. Storage requests go to the projection's
/// [`IoDispatcher`]; their completions come back through
/// [`handle_io_completion`](Self::handle_io_completion). Outcomes the owner
/// must act on are queued as [`ManagerSignal`]s.
///
/// Failure is terminal: after [`ManagerSignal::Failed`] or
/// [`ManagerSignal::RestartRequested`] every call is ignored until
/// [`initialize`](Self::initialize).
#[derive(Debug)]
pub struct CheckpointManager {
    projection_id: Uuid,
    names: ProjectionNames,
    version: ProjectionVersion,
    config: Arc<ProjectionConfig>,
    tagger: Arc<dyn PositionTagger>,
    dispatcher: Arc<dyn IoDispatcher>,
    notifications: mpsc::UnboundedSender<ProjectionNotification>,
    writer: CheckpointWriter,
    state: ManagerState,
    last_processed: PositionTracker,
    last_completed: Option<CheckpointTag>,
    generations: Option<Generations>,
    in_checkpoint: bool,
    checkpoint_deferred: bool,
    root_state: Option<PartitionState>,
    closing_root_state: Option<PartitionState>,
    updated_partitions: BTreeMap<String, PartitionState>,
    large_partitions: HashSet<String>,
    progress: f32,
    events_processed_after_restart: u64,
    failed: bool,
    reads: HashMap<Uuid, PendingRead>,
    signals: Vec<ManagerSignal>,
}

impl CheckpointManager {
    /// Create a manager for the projection `projection_id` named by `names`.
    ///
    /// # Arguments
    ///
    /// * `tagger` - Tagger of the projection's current phase; used for zero
    ///   tags and to adjust loaded checkpoints.
    /// * `dispatcher` - Executes storage requests.
    /// * `notifications` - Receives outbound [`ProjectionNotification`]s.
    pub fn new(
        projection_id: Uuid,
        names: ProjectionNames,
        version: ProjectionVersion,
        config: Arc<ProjectionConfig>,
        tagger: Arc<dyn PositionTagger>,
        dispatcher: Arc<dyn IoDispatcher>,
        notifications: mpsc::UnboundedSender<ProjectionNotification>,
    ) -> Self {
        let writer = CheckpointWriter::new(&names, version, Arc::clone(&dispatcher));
        Self {
            projection_id,
            names,
            version,
            config,
            last_processed: PositionTracker::new(Arc::clone(&tagger)),
            tagger,
            dispatcher,
            notifications,
            writer,
            state: ManagerState::Uninitialized,
            last_completed: None,
            generations: None,
            in_checkpoint: false,
            checkpoint_deferred: false,
            root_state: None,
            closing_root_state: None,
            updated_partitions: BTreeMap::new(),
            large_partitions: HashSet::new(),
            progress: 0.0,
            events_processed_after_restart: 0,
            failed: false,
            reads: HashMap::new(),
            signals: Vec::new(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        self.state
    }

    /// Tag of the last event reported processed.
    pub fn last_processed_tag(&self) -> Option<&CheckpointTag> {
        self.last_processed.last_tag()
    }

    /// Tag of the last completed checkpoint.
    pub fn last_completed_tag(&self) -> Option<&CheckpointTag> {
        self.last_completed.as_ref()
    }

    /// Whether a checkpoint is being written.
    pub fn in_checkpoint(&self) -> bool {
        self.in_checkpoint
    }

    /// Last reported reader progress in percent.
    pub fn progress(&self) -> f32 {
        self.progress
    }

    /// Events processed since the manager was last initialized.
    pub fn events_processed_after_restart(&self) -> u64 {
        self.events_processed_after_restart
    }

    /// Whether the manager failed or requested a restart.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// The tagger checkpoints are built for.
    pub fn tagger(&self) -> &Arc<dyn PositionTagger> {
        &self.tagger
    }

    /// Take the signals queued since the last call.
    pub fn drain_signals(&mut self) -> Vec<ManagerSignal> {
        std::mem::take(&mut self.signals)
    }

    /// Forget all progress, generations and outstanding requests.
    pub fn initialize(&mut self) {
        self.writer.initialize();
        self.state = ManagerState::Uninitialized;
        self.last_processed = PositionTracker::new(Arc::clone(&self.tagger));
        self.last_completed = None;
        self.generations = None;
        self.in_checkpoint = false;
        self.checkpoint_deferred = false;
        self.root_state = None;
        self.closing_root_state = None;
        self.updated_partitions.clear();
        self.large_partitions.clear();
        self.progress = 0.0;
        self.events_processed_after_restart = 0;
        self.failed = false;
        self.reads.clear();
        self.signals.clear();
    }

    /// Read the last checkpoint. Completes with
    /// [`ManagerSignal::CheckpointLoaded`].
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::InvalidState`] unless uninitialized.
    pub fn begin_load_state(&mut self) -> Result<(), ProjectionError> {
        if self.state != ManagerState::Uninitialized {
            return Err(self.invalid_state("load state"));
        }
        self.read_checkpoint_stream();
        Ok(())
    }

    /// Read the newest checkpointed state of `partition` at or before `at`.
    /// Completes with [`ManagerSignal::PartitionStateLoaded`].
    pub fn begin_load_partition_state_at(&mut self, partition: &str, at: CheckpointTag) {
        self.read_partition_page(partition.to_owned(), at, -1);
    }

    /// Start tracking from the checkpoint at `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::InvalidState`] unless uninitialized.
    pub fn start(
        &mut self,
        tag: CheckpointTag,
        root_state: Option<PartitionState>,
    ) -> Result<(), ProjectionError> {
        if self.state != ManagerState::Uninitialized {
            return Err(self.invalid_state("start"));
        }
        self.last_processed
            .update_by_checkpoint_tag_initial(tag.clone())?;
        let mut active = self.new_generation(tag.clone());
        active.start();
        self.generations = Some(Generations {
            active,
            closing: None,
        });
        self.last_completed = Some(tag.clone());
        self.root_state = root_state;
        self.state = ManagerState::Started;
        tracing::debug!(projection = %self.names.name(), tag = %tag, "checkpoint manager started");
        Ok(())
    }

    /// Record the new state of `partition`.
    ///
    /// A state larger than `max_projection_state_size` fails the projection.
    /// A warning is published when a partition first reaches half the limit.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::InvalidState`] unless started or stopping.
    pub fn state_updated(
        &mut self,
        partition: &str,
        state: PartitionState,
    ) -> Result<(), ProjectionError> {
        if self.failed {
            return Ok(());
        }
        self.ensure_running("update state")?;
        let size = state.size();
        let limit = self.config.max_projection_state_size;
        if size > limit {
            self.fail(format!(
                "the state of partition `{partition}` is {size} bytes, \
                 exceeding the maximum allowed size of {limit} bytes"
            ));
            return Ok(());
        }
        if size.saturating_mul(2) >= limit {
            if self.large_partitions.insert(partition.to_owned()) {
                tracing::warn!(
                    projection = %self.names.name(),
                    partition,
                    size,
                    limit,
                    "partition state is above half of the maximum size"
                );
                self.notify(ProjectionNotification::StateSizeWarning {
                    projection_id: self.projection_id,
                    partition: partition.to_owned(),
                    size,
                    limit,
                });
            }
        } else {
            self.large_partitions.remove(partition);
        }
        if partition == ROOT_PARTITION {
            self.root_state = Some(state);
        } else {
            self.updated_partitions.insert(partition.to_owned(), state);
        }
        Ok(())
    }

    /// Route events emitted while processing the event `caused_by`.
    ///
    /// Every event is stamped with `caused_by` and, unless it carries its
    /// own, with `correlation_id`. An event without a destination stream
    /// fails the projection.
    ///
    /// # Errors
    ///
    /// Propagates ordering errors from the active generation.
    pub fn events_emitted(
        &mut self,
        events: Vec<EmittedEventEnvelope>,
        caused_by: Uuid,
        correlation_id: Option<String>,
    ) -> Result<(), ProjectionError> {
        if self.failed || events.is_empty() {
            return Ok(());
        }
        self.ensure_running("emit events")?;
        if let Some(envelope) = events.iter().find(|e| e.event.stream_id.is_empty()) {
            self.fail(format!(
                "cannot emit a `{}` event without a stream id",
                envelope.event.event_type
            ));
            return Ok(());
        }
        let events = events
            .into_iter()
            .map(|mut envelope| {
                envelope.event.caused_by = Some(caused_by);
                if envelope.event.correlation_id.is_none() {
                    envelope.event.correlation_id = correlation_id.clone();
                }
                envelope
            })
            .collect();
        self.generations_mut("emit events")?
            .active
            .validate_order_and_emit_events(events)
    }

    /// Record that the event at `tag` was processed.
    ///
    /// # Errors
    ///
    /// Returns a position error if `tag` is not strictly after the last
    /// processed tag.
    pub fn event_processed(
        &mut self,
        tag: CheckpointTag,
        progress: f32,
    ) -> Result<(), ProjectionError> {
        if self.failed {
            return Ok(());
        }
        self.ensure_running("process an event")?;
        self.last_processed.update_by_checkpoint_tag_forward(tag)?;
        self.events_processed_after_restart += 1;
        self.progress = progress;
        Ok(())
    }

    /// Record reader progress.
    pub fn progress_changed(&mut self, progress: f32) {
        self.progress = progress;
    }

    /// Checkpoint at `tag` as suggested by the reader.
    ///
    /// Returns `true` if no further work is needed.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::CheckpointsDisabled`] without persistent
    ///   checkpoints.
    /// - Position errors if `tag` cannot be compared with the last
    ///   processed tag.
    pub fn checkpoint_suggested(
        &mut self,
        tag: CheckpointTag,
        progress: f32,
    ) -> Result<bool, ProjectionError> {
        if !self.config.checkpoints_enabled {
            return Err(ProjectionError::CheckpointsDisabled);
        }
        if self.failed {
            return Ok(true);
        }
        self.ensure_running("checkpoint")?;
        let ahead = match self.last_processed.last_tag() {
            Some(last) => tag.try_gt(last)?,
            None => false,
        };
        if ahead {
            self.last_processed.update_by_checkpoint_tag_forward(tag)?;
        }
        self.progress = progress;
        self.request_checkpoint()
    }

    /// Checkpoint at the last processed position.
    ///
    /// Returns `true` if nothing remains to be done: the position is
    /// already checkpointed, checkpoints are not persisted, or the
    /// checkpoint completed synchronously. A request made while another
    /// checkpoint is in flight starts once that checkpoint completes.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::InvalidState`] unless started or stopping.
    pub fn request_checkpoint(&mut self) -> Result<bool, ProjectionError> {
        if self.failed {
            return Ok(true);
        }
        self.ensure_running("request a checkpoint")?;
        if !self.config.checkpoints_enabled {
            return Ok(true);
        }
        let Some(position) = self.last_processed.last_tag().cloned() else {
            return Err(ProjectionError::InitialPositionNotSet);
        };
        if self.last_completed.as_ref() == Some(&position) {
            return Ok(true);
        }
        if self.in_checkpoint {
            self.checkpoint_deferred = true;
            return Ok(false);
        }
        self.start_checkpoint(position)?;
        Ok(!self.in_checkpoint)
    }

    /// Begin stopping: write a final checkpoint if anything was processed
    /// since the last one, even without persistent checkpoints, so that
    /// emitted events drain.
    ///
    /// Returns `true` if the manager stopped synchronously; otherwise
    /// [`ManagerSignal::Stopped`] follows.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::InvalidState`] unless started.
    pub fn stopping(&mut self) -> Result<bool, ProjectionError> {
        if self.failed {
            return Ok(true);
        }
        if self.state != ManagerState::Started {
            return Err(self.invalid_state("stop"));
        }
        self.state = ManagerState::Stopping;
        if self.in_checkpoint {
            return Ok(false);
        }
        self.finish_stop()?;
        Ok(self.state == ManagerState::Stopped)
    }

    /// Route a storage completion to whichever part of the manager issued
    /// the request. Returns whether the completion was claimed.
    ///
    /// # Errors
    ///
    /// Returns an error if a loaded checkpoint cannot be decoded or a
    /// follow-up operation violates an invariant.
    pub fn handle_io_completion(
        &mut self,
        completion: &IoCompletion,
    ) -> Result<bool, ProjectionError> {
        if self.failed {
            return Ok(false);
        }
        if let Some(read) = self.reads.remove(&completion.correlation_id()) {
            if let IoCompletion::StreamRead { result, .. } = completion {
                match read {
                    PendingRead::Checkpoint => self.handle_checkpoint_read(result)?,
                    PendingRead::Partition {
                        partition,
                        at,
                        from_event_number,
                    } => self.handle_partition_read(partition, at, from_event_number, result)?,
                }
            }
            return Ok(true);
        }
        if self.writer.owns(completion) {
            match self.writer.handle_completion(completion) {
                Some(WriterOutcome::Written(tag)) => {
                    self.notify(ProjectionNotification::CheckpointWritten {
                        projection_id: self.projection_id,
                        tag: tag.clone(),
                    });
                    self.checkpoint_completed(tag)?;
                }
                Some(WriterOutcome::Failed(reason)) => self.fail(reason),
                None => {}
            }
            return Ok(true);
        }
        let Some(generations) = self.generations.as_mut() else {
            return Ok(false);
        };
        let outcome = match generations.closing.as_mut() {
            Some(closing) if closing.owns(completion) => closing.handle_completion(completion),
            _ if generations.active.owns(completion) => generations
                .active
                .handle_completion(completion)
                .map(|_| false),
            _ => return Ok(false),
        };
        match outcome {
            Ok(true) => self.on_ready_for_checkpoint()?,
            Ok(false) => {}
            Err(StreamFailure::Failed(reason)) => self.fail(reason),
            Err(StreamFailure::RestartRequested(reason)) => self.request_restart(reason),
        }
        Ok(true)
    }

    /// Fail the projection. Ignored if already failed.
    pub fn fail(&mut self, reason: String) {
        if self.failed {
            return;
        }
        self.failed = true;
        tracing::error!(projection = %self.names.name(), reason = %reason, "projection failed");
        self.notify(ProjectionNotification::Failed {
            projection_id: self.projection_id,
            reason: reason.clone(),
        });
        self.signals.push(ManagerSignal::Failed(reason));
    }

    /// Ask for the projection to be restarted from its last checkpoint.
    /// Ignored if already failed.
    pub fn request_restart(&mut self, reason: String) {
        if self.failed {
            return;
        }
        self.failed = true;
        tracing::warn!(projection = %self.names.name(), reason = %reason, "projection restart requested");
        self.notify(ProjectionNotification::RestartRequested {
            projection_id: self.projection_id,
            reason: reason.clone(),
        });
        self.signals.push(ManagerSignal::RestartRequested(reason));
    }

    fn start_checkpoint(&mut self, position: CheckpointTag) -> Result<(), ProjectionError> {
        self.in_checkpoint = true;
        self.closing_root_state = self.root_state.clone();
        let partition_events = self.partition_checkpoint_events();
        let next = self.new_generation(position.clone());
        let generations = self.generations_mut("checkpoint")?;
        if !partition_events.is_empty() {
            generations
                .active
                .validate_order_and_emit_events(partition_events)?;
        }
        let ready = generations.rotate(next).prepare(position.clone())?;
        tracing::debug!(projection = %self.names.name(), tag = %position, "checkpoint started");
        if ready {
            self.on_ready_for_checkpoint()?;
        }
        Ok(())
    }

    fn partition_checkpoint_events(&mut self) -> Vec<EmittedEventEnvelope> {
        let updated = std::mem::take(&mut self.updated_partitions);
        if !self.config.checkpoints_enabled {
            return Vec::new();
        }
        updated
            .into_iter()
            .map(|(partition, state)| {
                EmittedEventEnvelope::new(EmittedEvent::new(
                    self.names.partition_checkpoint_stream(&partition),
                    PARTITION_CHECKPOINT_EVENT_TYPE,
                    Some(state.serialize()),
                    state.caused_by().clone(),
                ))
            })
            .collect()
    }

    fn on_ready_for_checkpoint(&mut self) -> Result<(), ProjectionError> {
        let Some(position) = self
            .generations
            .as_ref()
            .and_then(|g| g.closing.as_ref())
            .and_then(|closing| closing.prepared_at().cloned())
        else {
            return Ok(());
        };
        if self.config.checkpoints_enabled {
            let state = self
                .closing_root_state
                .take()
                .unwrap_or_else(|| PartitionState::new(None, None, position.clone()));
            self.writer.begin_write_checkpoint(&position, &state)
        } else {
            self.checkpoint_completed(position)
        }
    }

    fn checkpoint_completed(&mut self, tag: CheckpointTag) -> Result<(), ProjectionError> {
        self.last_completed = Some(tag.clone());
        self.in_checkpoint = false;
        self.closing_root_state = None;
        if let Some(generations) = self.generations.as_mut() {
            generations.closing = None;
            generations.active.start();
        }
        tracing::debug!(projection = %self.names.name(), tag = %tag, "checkpoint completed");
        self.notify(ProjectionNotification::CheckpointCompleted {
            projection_id: self.projection_id,
            tag: tag.clone(),
        });
        self.signals.push(ManagerSignal::CheckpointCompleted(tag));
        if self.state == ManagerState::Stopping {
            self.finish_stop()
        } else if self.checkpoint_deferred {
            self.checkpoint_deferred = false;
            self.request_checkpoint().map(|_| ())
        } else {
            Ok(())
        }
    }

    fn finish_stop(&mut self) -> Result<(), ProjectionError> {
        let position = self.last_processed.last_tag().cloned();
        match position {
            Some(position) if self.last_completed.as_ref() != Some(&position) => {
                self.start_checkpoint(position)
            }
            _ => {
                self.state = ManagerState::Stopped;
                self.signals.push(ManagerSignal::Stopped);
                Ok(())
            }
        }
    }

    fn handle_checkpoint_read(&mut self, result: &ReadResult) -> Result<(), ProjectionError> {
        match result {
            ReadResult::NoStream => {
                self.checkpoint_loaded(None, -1);
                Ok(())
            }
            ReadResult::Success(slice) => {
                let Some(event) = slice.events.first() else {
                    self.checkpoint_loaded(None, slice.last_event_number);
                    return Ok(());
                };
                let stored = CheckpointTag::from_json(&event.data)?;
                if stored.version.epoch < self.version.epoch {
                    tracing::debug!(
                        projection = %self.names.name(),
                        stored_epoch = stored.version.epoch,
                        epoch = self.version.epoch,
                        "ignoring checkpoint of an earlier epoch"
                    );
                    self.checkpoint_loaded(None, event.event_number);
                    return Ok(());
                }
                let tag = self.tagger.adjust_tag(&stored.tag)?;
                if tag.mode() != stored.tag.mode() {
                    tracing::debug!(
                        projection = %self.names.name(),
                        stored = %stored.tag,
                        adjusted = %tag,
                        "adjusted checkpoint tag to the current reader strategy"
                    );
                }
                let root_state = event
                    .metadata
                    .as_deref()
                    .map(|metadata| PartitionState::deserialize(metadata, tag.clone()))
                    .transpose()
                    .map_err(TagError::from)?;
                self.checkpoint_loaded(Some((tag, root_state)), event.event_number);
                Ok(())
            }
            ReadResult::Timeout => {
                tracing::warn!(projection = %self.names.name(), "checkpoint read timed out, retrying");
                self.read_checkpoint_stream();
                Ok(())
            }
            ReadResult::StreamDeleted | ReadResult::AccessDenied => {
                self.fail(format!(
                    "cannot read checkpoint stream `{}`: {result:?}",
                    self.names.checkpoint_stream()
                ));
                Ok(())
            }
        }
    }

    fn checkpoint_loaded(
        &mut self,
        loaded: Option<(CheckpointTag, Option<PartitionState>)>,
        event_number: i64,
    ) {
        self.writer.start_from(event_number);
        let (tag, root_state) =
            loaded.unwrap_or_else(|| (self.tagger.make_zero_checkpoint_tag(), None));
        tracing::debug!(projection = %self.names.name(), tag = %tag, "checkpoint loaded");
        self.signals
            .push(ManagerSignal::CheckpointLoaded { tag, root_state });
    }

    fn handle_partition_read(
        &mut self,
        partition: String,
        at: CheckpointTag,
        from_event_number: i64,
        result: &ReadResult,
    ) -> Result<(), ProjectionError> {
        match result {
            ReadResult::NoStream => {
                self.partition_loaded(partition, at, None);
                Ok(())
            }
            ReadResult::Success(slice) => {
                for event in &slice.events {
                    let Some(metadata) = event.metadata.as_deref() else {
                        continue;
                    };
                    let stored = CheckpointTag::from_json(metadata)?;
                    if stored.tag.try_le(&at)? {
                        let state = PartitionState::deserialize(&event.data, stored.tag)
                            .map_err(TagError::from)?;
                        self.partition_loaded(partition, at, Some(state));
                        return Ok(());
                    }
                }
                if slice.is_end_of_stream || slice.events.is_empty() {
                    self.partition_loaded(partition, at, None);
                } else {
                    self.read_partition_page(partition, at, slice.next_event_number);
                }
                Ok(())
            }
            ReadResult::Timeout => {
                self.read_partition_page(partition, at, from_event_number);
                Ok(())
            }
            ReadResult::StreamDeleted | ReadResult::AccessDenied => {
                self.fail(format!(
                    "cannot read checkpoint of partition `{partition}`: {result:?}"
                ));
                Ok(())
            }
        }
    }

    fn partition_loaded(
        &mut self,
        partition: String,
        at: CheckpointTag,
        state: Option<PartitionState>,
    ) {
        self.signals.push(ManagerSignal::PartitionStateLoaded {
            partition,
            at,
            state,
        });
    }

    fn read_checkpoint_stream(&mut self) {
        let correlation_id = Uuid::new_v4();
        self.reads.insert(correlation_id, PendingRead::Checkpoint);
        self.dispatcher.dispatch(IoRequest::ReadBackward {
            correlation_id,
            stream_id: self.names.checkpoint_stream(),
            from_event_number: -1,
            max_count: 1,
        });
    }

    fn read_partition_page(&mut self, partition: String, at: CheckpointTag, from_event_number: i64) {
        let correlation_id = Uuid::new_v4();
        let stream_id = self.names.partition_checkpoint_stream(&partition);
        self.reads.insert(
            correlation_id,
            PendingRead::Partition {
                partition,
                at,
                from_event_number,
            },
        );
        self.dispatcher.dispatch(IoRequest::ReadBackward {
            correlation_id,
            stream_id,
            from_event_number,
            max_count: PARTITION_READ_PAGE,
        });
    }

    fn new_generation(&self, from: CheckpointTag) -> ProjectionCheckpoint {
        ProjectionCheckpoint::new(
            from,
            self.version,
            Arc::clone(&self.config),
            Arc::clone(&self.dispatcher),
        )
    }

    fn generations_mut(
        &mut self,
        operation: &'static str,
    ) -> Result<&mut Generations, ProjectionError> {
        let state = self.state;
        self.generations
            .as_mut()
            .ok_or_else(|| ProjectionError::InvalidState {
                operation,
                state: format!("{state:?}"),
            })
    }

    fn ensure_running(&self, operation: &'static str) -> Result<(), ProjectionError> {
        match self.state {
            ManagerState::Started | ManagerState::Stopping => Ok(()),
            _ => Err(self.invalid_state(operation)),
        }
    }

    fn invalid_state(&self, operation: &'static str) -> ProjectionError {
        ProjectionError::InvalidState {
            operation,
            state: format!("{:?}", self.state),
        }
    }

    fn notify(&self, notification: ProjectionNotification) {
        let _ = self.notifications.send(notification);
    }
}
