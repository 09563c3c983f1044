//! The event-processing phase of a projection.
//!
//! A [`ProcessingPhase`] owns the state handler, the partition state cache
//! and the [`CheckpointManager`]. It accepts sequenced
//! [`SubscriptionMessage`]s from one reader subscription, queues them in tag
//! order and drains the queue on the projection's worker:
//!
//! 1. the partition of an event is selected and its state is loaded, from
//!    the cache or from its partition checkpoint stream;
//! 2. the handler processes the event;
//! 3. emitted events, then result and state updates, then the processed
//!    position are reported to the checkpoint manager, in that order.
//!
//! Handler errors fault the phase. Ordering violations are returned as
//! [`ProjectionError`]s.

mod queue;

pub use queue::WorkQueue;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::checkpoint::{CheckpointManager, ManagerSignal};
use crate::config::ProjectionConfig;
use crate::error::ProjectionError;
use crate::event::ResolvedEvent;
use crate::handler::{HandlerError, ProcessEventOutcome, StateHandler};
use crate::io::IoCompletion;
use crate::messages::{ReaderCommand, SubscriptionMessage, SubscriptionPayload};
use crate::names::ProjectionNames;
use crate::partition::{PartitionState, PartitionStateCache, ROOT_PARTITION};
use crate::results::ResultWriter;
use crate::source::{PartitionSelector, SourceDefinition};
use crate::tag::CheckpointTag;

/// Lifecycle of a [`ProcessingPhase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    /// Not subscribed; inbound messages are ignored.
    Stopped,
    /// Subscribed, waiting for the reader to confirm.
    Starting,
    /// Processing events.
    Running,
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::Running => "Running",
        })
    }
}

/// State of the phase's reader subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// No subscription was requested yet.
    Unknown,
    /// Subscribe was sent; the reader has not confirmed.
    Subscribing,
    /// The reader is delivering events.
    Subscribed,
    /// The subscription ended.
    Unsubscribed,
    /// The reader reported a failure.
    Failed,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "Unknown",
            Self::Subscribing => "Subscribing",
            Self::Subscribed => "Subscribed",
            Self::Unsubscribed => "Unsubscribed",
            Self::Failed => "Failed",
        })
    }
}

/// Something the owner of a [`ProcessingPhase`] has to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseSignal {
    /// The last checkpoint was read; call [`ProcessingPhase::start`].
    CheckpointLoaded {
        /// Tag to resume after.
        tag: CheckpointTag,
        /// Root partition state stored with the checkpoint.
        root_state: Option<PartitionState>,
    },
    /// A checkpoint completed.
    CheckpointCompleted(CheckpointTag),
    /// A partition state requested with
    /// [`ProcessingPhase::query_partition_state`] is available.
    PartitionStateReady {
        /// The partition.
        partition: String,
        /// Its state.
        state: Option<PartitionState>,
    },
    /// The reader reached the end of its input and every event before it
    /// was processed.
    PhaseCompleted,
    /// The stop checkpoint completed.
    Stopped,
    /// The handler or the reader failed.
    Faulted(String),
    /// The checkpoint manager failed.
    ManagerFailed(String),
    /// The checkpoint manager asks for a restart from the last checkpoint.
    RestartRequested(String),
}

/// Answer to [`ProcessingPhase::query_partition_state`].
#[derive(Debug, Clone, PartialEq)]
pub enum StateQuery {
    /// The state is known.
    Ready(Option<PartitionState>),
    /// The state is being read; [`PhaseSignal::PartitionStateReady`]
    /// follows.
    Loading,
}

#[derive(Debug)]
enum WorkItem {
    Event {
        tag: CheckpointTag,
        event: Box<ResolvedEvent>,
        progress: f32,
        partition: Option<String>,
    },
    PartitionDeleted {
        tag: CheckpointTag,
        partition: String,
    },
    CheckpointSuggested {
        tag: CheckpointTag,
        progress: f32,
    },
    Progress {
        progress: f32,
    },
    Completed,
}

#[derive(Debug, Default, Clone, Copy)]
struct PendingLoad {
    lock: bool,
    query: bool,
}

/// Processes the events of one reader subscription.
pub struct ProcessingPhase {
    names: ProjectionNames,
    handler: Box<dyn StateHandler>,
    handler_type: &'static str,
    selector: PartitionSelector,
    shares_state: bool,
    result_writer: Option<ResultWriter>,
    config: Arc<ProjectionConfig>,
    manager: CheckpointManager,
    cache: PartitionStateCache,
    reader: mpsc::UnboundedSender<ReaderCommand>,
    queue: WorkQueue<WorkItem>,
    state: PhaseState,
    subscription_state: SubscriptionState,
    subscription_id: Option<Uuid>,
    next_sequence: i64,
    loaded_partition: Option<String>,
    pending_loads: HashMap<String, PendingLoad>,
    paused: bool,
    fault: Option<String>,
    signals: Vec<PhaseSignal>,
}

impl fmt::Debug for ProcessingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingPhase")
            .field("projection", &self.names.name())
            .field("handler", &self.handler_type)
            .field("state", &self.state)
            .field("subscription_state", &self.subscription_state)
            .field("buffered", &self.queue.len())
            .field("fault", &self.fault)
            .finish_non_exhaustive()
    }
}

impl ProcessingPhase {
    /// Create a stopped phase.
    ///
    /// # Arguments
    ///
    /// * `handler` - Computes partition states; its source definition picks
    ///   the partition selector and whether results are written.
    /// * `manager` - Checkpoint manager built for the same projection.
    /// * `reader` - Receives subscribe, pause, resume and unsubscribe
    ///   commands.
    pub fn new(
        names: ProjectionNames,
        handler: Box<dyn StateHandler>,
        manager: CheckpointManager,
        config: Arc<ProjectionConfig>,
        reader: mpsc::UnboundedSender<ReaderCommand>,
    ) -> Self {
        let source: SourceDefinition = handler.source_definition();
        let result_writer = source
            .produces_results
            .then(|| ResultWriter::new(names.clone()));
        Self {
            handler_type: handler.type_name(),
            selector: source.partition_selector(),
            shares_state: source.is_bi_state && source.is_partitioned(),
            result_writer,
            names,
            handler,
            config,
            manager,
            cache: PartitionStateCache::default(),
            reader,
            queue: WorkQueue::default(),
            state: PhaseState::Stopped,
            subscription_state: SubscriptionState::Unknown,
            subscription_id: None,
            next_sequence: 0,
            loaded_partition: None,
            pending_loads: HashMap::new(),
            paused: false,
            fault: None,
            signals: Vec::new(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PhaseState {
        self.state
    }

    /// Current subscription state.
    pub fn subscription_state(&self) -> SubscriptionState {
        self.subscription_state
    }

    /// Id of the current subscription.
    pub fn subscription_id(&self) -> Option<Uuid> {
        self.subscription_id
    }

    /// Fault reason, if the phase faulted.
    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    /// Number of queued, unprocessed work items.
    pub fn buffered_events(&self) -> usize {
        self.queue.len()
    }

    /// Human-readable status, e.g. `Running/Subscribed/Paused`.
    pub fn status(&self) -> String {
        let mut status = format!("{}/{}", self.state, self.subscription_state);
        if self.paused {
            status.push_str("/Paused");
        }
        if self.fault.is_some() {
            status.push_str("/Faulted");
        }
        status
    }

    /// The checkpoint manager.
    pub fn manager(&self) -> &CheckpointManager {
        &self.manager
    }

    /// The checkpoint manager, mutably. Signals it raises are picked up on
    /// the next drain.
    pub fn manager_mut(&mut self) -> &mut CheckpointManager {
        &mut self.manager
    }

    /// Take the signals raised since the last call.
    pub fn drain_signals(&mut self) -> Vec<PhaseSignal> {
        std::mem::take(&mut self.signals)
    }

    /// Reset to a stopped phase with an empty cache and a fresh checkpoint
    /// manager.
    pub fn initialize(&mut self) {
        self.send_unsubscribe();
        self.manager.initialize();
        self.cache.initialize();
        self.queue.initialize(None);
        self.pending_loads.clear();
        self.loaded_partition = None;
        self.paused = false;
        self.fault = None;
        self.state = PhaseState::Stopped;
        self.subscription_state = SubscriptionState::Unknown;
        self.signals.clear();
    }

    /// Start processing after `from` and subscribe to the reader.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::InvalidState`] unless stopped, or an error
    /// from [`CheckpointManager::start`].
    pub fn start(
        &mut self,
        from: CheckpointTag,
        root_state: Option<PartitionState>,
    ) -> Result<(), ProjectionError> {
        if self.state != PhaseState::Stopped {
            return Err(ProjectionError::InvalidState {
                operation: "start",
                state: self.state.to_string(),
            });
        }
        self.manager.start(from.clone(), root_state.clone())?;
        let root = root_state.unwrap_or_else(|| PartitionState::new(None, None, from.clone()));
        self.cache
            .cache_and_lock(ROOT_PARTITION, root.clone(), from.clone());
        self.loaded_partition = None;
        if let Err(err) = self.load_shared_state(&root) {
            self.enter_fault(format!(
                "The {} projection failed to load its shared state.\nHandler: {}\n\nMessage:\n\n{err}",
                self.names.name(),
                self.handler_type
            ));
            return Ok(());
        }

        self.queue.initialize(Some(from.clone()));
        self.next_sequence = 0;
        let subscription_id = Uuid::new_v4();
        self.subscription_id = Some(subscription_id);
        self.subscription_state = SubscriptionState::Subscribing;
        self.state = PhaseState::Starting;
        tracing::debug!(
            projection = %self.names.name(),
            subscription_id = %subscription_id,
            from = %from,
            "subscribing"
        );
        let _ = self.reader.send(ReaderCommand::Subscribe {
            subscription_id,
            from,
        });
        Ok(())
    }

    /// Unsubscribe and drop queued work. Further messages are ignored.
    pub fn stop(&mut self) {
        self.send_unsubscribe();
        self.queue.initialize(None);
        self.pending_loads.retain(|_, load| load.query);
        self.state = PhaseState::Stopped;
    }

    /// Accept a message from the reader and process what can be processed.
    ///
    /// Messages of other subscriptions are discarded.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::SequenceMismatch`] if the message is not the
    ///   next one of the subscription.
    /// - [`ProjectionError::InvalidOrder`] if its tag is before the last
    ///   queued tag.
    /// - Any invariant violation raised while processing.
    pub fn handle_subscription_message(
        &mut self,
        message: SubscriptionMessage,
    ) -> Result<(), ProjectionError> {
        if self.subscription_id != Some(message.subscription_id) {
            tracing::debug!(
                projection = %self.names.name(),
                subscription_id = %message.subscription_id,
                sequence_number = message.sequence_number,
                "discarding message of a stale subscription"
            );
            return Ok(());
        }
        if message.sequence_number != self.next_sequence {
            return Err(ProjectionError::SequenceMismatch {
                expected: self.next_sequence,
                actual: message.sequence_number,
            });
        }
        self.next_sequence += 1;

        match message.payload {
            SubscriptionPayload::Started { starting_tag } => {
                tracing::debug!(projection = %self.names.name(), from = %starting_tag, "subscribed");
                self.subscription_state = SubscriptionState::Subscribed;
                self.state = PhaseState::Running;
            }
            SubscriptionPayload::CommittedEvent {
                tag,
                event,
                progress,
            } => {
                let item = WorkItem::Event {
                    tag: tag.clone(),
                    event,
                    progress,
                    partition: None,
                };
                self.queue.enqueue(item, Some(&tag), false)?;
            }
            SubscriptionPayload::CheckpointSuggested { tag, progress } => {
                if self.config.checkpoints_enabled {
                    let item = WorkItem::CheckpointSuggested {
                        tag: tag.clone(),
                        progress,
                    };
                    self.queue.enqueue(item, Some(&tag), true)?;
                }
            }
            SubscriptionPayload::ProgressChanged { progress } => {
                self.queue.enqueue(WorkItem::Progress { progress }, None, false)?;
            }
            SubscriptionPayload::EofReached { tag } => {
                self.send_unsubscribe();
                self.queue.enqueue(WorkItem::Completed, Some(&tag), true)?;
            }
            SubscriptionPayload::PartitionDeleted { partition, tag } => {
                let item = WorkItem::PartitionDeleted {
                    tag: tag.clone(),
                    partition,
                };
                self.queue.enqueue(item, Some(&tag), true)?;
            }
            SubscriptionPayload::Failed { reason } => {
                self.enter_fault(format!("the reader subscription failed: {reason}"));
                self.subscription_state = SubscriptionState::Failed;
                return Ok(());
            }
        }
        self.drain()
    }

    /// Route a storage completion to the checkpoint manager and continue
    /// processing. Returns whether the completion was claimed.
    ///
    /// # Errors
    ///
    /// Propagates invariant violations from the manager or from processing.
    pub fn handle_io_completion(
        &mut self,
        completion: &IoCompletion,
    ) -> Result<bool, ProjectionError> {
        let claimed = self.manager.handle_io_completion(completion)?;
        if claimed {
            self.drain()?;
        }
        Ok(claimed)
    }

    /// State of `partition`, reading it from its checkpoint stream if it is
    /// not cached.
    pub fn query_partition_state(&mut self, partition: &str) -> StateQuery {
        if let Some(state) = self.cache.try_get(partition) {
            return StateQuery::Ready(Some(state.clone()));
        }
        let at = match self.manager.last_processed_tag() {
            Some(at) if self.config.checkpoints_enabled && !self.manager.is_failed() => at.clone(),
            _ => return StateQuery::Ready(None),
        };
        if partition == ROOT_PARTITION {
            return StateQuery::Ready(None);
        }
        self.request_load(partition, at, PendingLoad {
            lock: false,
            query: true,
        });
        StateQuery::Loading
    }

    /// Process queued work until the queue is empty or blocked on a
    /// partition load.
    ///
    /// # Errors
    ///
    /// Propagates invariant violations.
    pub fn drain(&mut self) -> Result<(), ProjectionError> {
        self.absorb_manager_signals();
        while self.accepts_work() {
            let Some(item) = self.queue.pop_front() else {
                break;
            };
            let blocked = self.process_item(item)?;
            self.absorb_manager_signals();
            if let Some(item) = blocked {
                self.queue.push_front(item);
                break;
            }
        }
        self.apply_backpressure();
        Ok(())
    }

    fn accepts_work(&self) -> bool {
        self.state != PhaseState::Stopped && self.fault.is_none() && !self.manager.is_failed()
    }

    /// Returns the item back if it waits for a partition load.
    fn process_item(&mut self, item: WorkItem) -> Result<Option<WorkItem>, ProjectionError> {
        match item {
            WorkItem::Event {
                tag,
                event,
                progress,
                partition,
            } => self.process_event(tag, event, progress, partition),
            WorkItem::PartitionDeleted { tag, partition } => {
                self.process_partition_deleted(tag, partition)
            }
            WorkItem::CheckpointSuggested { tag, progress } => {
                self.manager.checkpoint_suggested(tag, progress)?;
                Ok(None)
            }
            WorkItem::Progress { progress } => {
                self.manager.progress_changed(progress);
                Ok(None)
            }
            WorkItem::Completed => {
                tracing::debug!(projection = %self.names.name(), "phase completed");
                self.signals.push(PhaseSignal::PhaseCompleted);
                Ok(None)
            }
        }
    }

    fn process_event(
        &mut self,
        tag: CheckpointTag,
        event: Box<ResolvedEvent>,
        progress: f32,
        partition: Option<String>,
    ) -> Result<Option<WorkItem>, ProjectionError> {
        let partition = match partition {
            Some(partition) => partition,
            None => match self.select_partition(&tag, &event) {
                Ok(Some(partition)) => partition,
                Ok(None) => {
                    self.manager.event_processed(tag, progress)?;
                    return Ok(None);
                }
                Err(err) => {
                    self.handler_failed(&tag, progress, err);
                    return Ok(None);
                }
            },
        };
        let Some(previous) = self.lock_partition(&partition, &tag) else {
            return Ok(Some(WorkItem::Event {
                tag,
                event,
                progress,
                partition: Some(partition),
            }));
        };
        if let Err(err) = self.switch_partition(&partition, &previous) {
            self.handler_failed(&tag, progress, err);
            return Ok(None);
        }

        let outcome = match self
            .handler
            .process_event(&partition, &tag, event.category(), &event)
        {
            Ok(outcome) => outcome,
            Err(err) => {
                self.handler_failed(&tag, progress, err);
                return Ok(None);
            }
        };
        let ProcessEventOutcome {
            handled,
            new_state,
            new_shared_state,
            emitted_events,
        } = outcome;
        let updated = if handled {
            match self.updated_state(new_state, &previous, &tag) {
                Ok(updated) => updated,
                Err(err) => {
                    self.handler_failed(&tag, progress, err);
                    return Ok(None);
                }
            }
        } else {
            None
        };

        let correlation_id = event.correlation_id();
        if !emitted_events.is_empty() {
            if !self.config.emit_event_enabled {
                self.manager.progress_changed(progress);
                self.enter_fault(format!(
                    "The {} projection emitted {} event(s) at {tag} but emitting events is disabled.",
                    self.names.name(),
                    emitted_events.len()
                ));
                return Ok(None);
            }
            self.manager
                .events_emitted(emitted_events, event.event_id, correlation_id.clone())?;
        }
        if let Some(updated) = updated {
            self.publish_state(&partition, &previous, updated, event.event_id, correlation_id)?;
        }
        if self.shares_state
            && let Some(shared) = new_shared_state
        {
            self.publish_shared_state(shared, &tag)?;
        }
        self.manager.event_processed(tag, progress)?;
        Ok(None)
    }

    fn process_partition_deleted(
        &mut self,
        tag: CheckpointTag,
        partition: String,
    ) -> Result<Option<WorkItem>, ProjectionError> {
        let Some(previous) = self.lock_partition(&partition, &tag) else {
            return Ok(Some(WorkItem::PartitionDeleted { tag, partition }));
        };
        let progress = self.manager.progress();
        if let Err(err) = self.switch_partition(&partition, &previous) {
            self.handler_failed(&tag, progress, err);
            return Ok(None);
        }
        let outcome = match self.handler.process_partition_deleted(&partition, &tag) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.handler_failed(&tag, progress, err);
                return Ok(None);
            }
        };
        if !outcome.handled {
            return Ok(None);
        }
        match self.updated_state(outcome.new_state, &previous, &tag) {
            // No event caused the deletion.
            Ok(Some(updated)) => self.publish_state(&partition, &previous, updated, Uuid::nil(), None)?,
            Ok(None) => {}
            Err(err) => self.handler_failed(&tag, progress, err),
        }
        Ok(None)
    }

    fn select_partition(
        &mut self,
        tag: &CheckpointTag,
        event: &ResolvedEvent,
    ) -> Result<Option<String>, HandlerError> {
        match self.selector {
            PartitionSelector::Root => Ok(Some(ROOT_PARTITION.to_owned())),
            PartitionSelector::ByStream => Ok(Some(event.event_stream_id.clone())),
            PartitionSelector::ByHandler => {
                self.handler
                    .get_state_partition(tag, event.category(), event)
            }
        }
    }

    /// Cached state of `partition`, locked at `at`. `None` means a load was
    /// started.
    fn lock_partition(&mut self, partition: &str, at: &CheckpointTag) -> Option<PartitionState> {
        if let Some(state) = self.cache.try_get_and_lock(partition, at) {
            return Some(state.clone());
        }
        if !self.config.checkpoints_enabled {
            let fresh = PartitionState::new(None, None, at.clone());
            self.cache.cache_and_lock(partition, fresh.clone(), at.clone());
            return Some(fresh);
        }
        self.request_load(partition, at.clone(), PendingLoad {
            lock: true,
            query: false,
        });
        None
    }

    fn request_load(&mut self, partition: &str, at: CheckpointTag, purpose: PendingLoad) {
        if let Some(pending) = self.pending_loads.get_mut(partition) {
            pending.lock |= purpose.lock;
            pending.query |= purpose.query;
            return;
        }
        tracing::debug!(projection = %self.names.name(), partition, at = %at, "loading partition state");
        self.pending_loads.insert(partition.to_owned(), purpose);
        self.manager.begin_load_partition_state_at(partition, at);
    }

    fn partition_loaded(
        &mut self,
        partition: String,
        at: CheckpointTag,
        state: Option<PartitionState>,
    ) {
        let Some(pending) = self.pending_loads.remove(&partition) else {
            return;
        };
        let state = state.unwrap_or_else(|| PartitionState::new(None, None, at.clone()));
        if pending.lock {
            self.cache.cache_and_lock(&partition, state.clone(), at);
        } else {
            self.cache.cache(&partition, state.clone());
        }
        if pending.query {
            self.signals.push(PhaseSignal::PartitionStateReady {
                partition,
                state: Some(state),
            });
        }
    }

    /// Point the handler at `partition`, loading its state only if another
    /// partition is loaded.
    fn switch_partition(
        &mut self,
        partition: &str,
        state: &PartitionState,
    ) -> Result<(), HandlerError> {
        if self.loaded_partition.as_deref() == Some(partition) {
            return Ok(());
        }
        self.loaded_partition = None;
        match state.state() {
            Some(serialized) => self.handler.load(Some(serialized))?,
            None => self.handler.initialize()?,
        }
        self.loaded_partition = Some(partition.to_owned());
        Ok(())
    }

    fn load_shared_state(&mut self, root: &PartitionState) -> Result<(), HandlerError> {
        if !self.shares_state {
            return Ok(());
        }
        match root.state() {
            Some(shared) => self.handler.load_shared(Some(shared)),
            None => self.handler.initialize_shared(),
        }
    }

    /// The new state of a partition, or `None` if neither state nor result
    /// changed.
    fn updated_state(
        &mut self,
        new_state: Option<String>,
        previous: &PartitionState,
        tag: &CheckpointTag,
    ) -> Result<Option<PartitionState>, HandlerError> {
        let result = match self.result_writer {
            Some(_) => self.handler.transform_state_to_result()?,
            None => None,
        };
        let updated = PartitionState::new(new_state, result, tag.clone());
        Ok((!updated.same_content(previous)).then_some(updated))
    }

    fn publish_state(
        &mut self,
        partition: &str,
        previous: &PartitionState,
        updated: PartitionState,
        caused_by: Uuid,
        correlation_id: Option<String>,
    ) -> Result<(), ProjectionError> {
        if let Some(writer) = &self.result_writer
            && updated.result() != previous.result()
        {
            let events = writer.result_events(partition, updated.result(), updated.caused_by());
            self.manager
                .events_emitted(events, caused_by, correlation_id)?;
        }
        self.cache
            .cache_and_lock(partition, updated.clone(), updated.caused_by().clone());
        self.manager.state_updated(partition, updated)
    }

    fn publish_shared_state(
        &mut self,
        shared: String,
        tag: &CheckpointTag,
    ) -> Result<(), ProjectionError> {
        let updated = PartitionState::new(Some(shared), None, tag.clone());
        if self
            .cache
            .try_get(ROOT_PARTITION)
            .is_some_and(|previous| previous.same_content(&updated))
        {
            return Ok(());
        }
        self.cache
            .cache_and_lock(ROOT_PARTITION, updated.clone(), tag.clone());
        self.manager.state_updated(ROOT_PARTITION, updated)
    }

    fn absorb_manager_signals(&mut self) {
        for signal in self.manager.drain_signals() {
            match signal {
                ManagerSignal::CheckpointLoaded { tag, root_state } => {
                    self.signals
                        .push(PhaseSignal::CheckpointLoaded { tag, root_state });
                }
                ManagerSignal::PartitionStateLoaded {
                    partition,
                    at,
                    state,
                } => self.partition_loaded(partition, at, state),
                ManagerSignal::CheckpointCompleted(tag) => {
                    self.cache.unlock(&tag);
                    self.signals.push(PhaseSignal::CheckpointCompleted(tag));
                }
                ManagerSignal::Stopped => self.signals.push(PhaseSignal::Stopped),
                ManagerSignal::Failed(reason) => {
                    self.send_unsubscribe();
                    self.signals.push(PhaseSignal::ManagerFailed(reason));
                }
                ManagerSignal::RestartRequested(reason) => {
                    self.send_unsubscribe();
                    self.signals.push(PhaseSignal::RestartRequested(reason));
                }
            }
        }
    }

    fn handler_failed(&mut self, tag: &CheckpointTag, progress: f32, err: HandlerError) {
        self.manager.progress_changed(progress);
        self.enter_fault(format!(
            "The {} projection failed to process an event.\nHandler: {}\nEvent Position: {tag}\n\nMessage:\n\n{err}",
            self.names.name(),
            self.handler_type
        ));
    }

    fn enter_fault(&mut self, reason: String) {
        if self.fault.is_some() {
            return;
        }
        tracing::error!(projection = %self.names.name(), reason = %reason, "projection faulted");
        self.send_unsubscribe();
        self.queue.initialize(None);
        self.fault = Some(reason.clone());
        self.signals.push(PhaseSignal::Faulted(reason));
    }

    fn send_unsubscribe(&mut self) {
        if let Some(subscription_id) = self.subscription_id.take() {
            let _ = self
                .reader
                .send(ReaderCommand::Unsubscribe { subscription_id });
            self.subscription_state = SubscriptionState::Unsubscribed;
        }
        self.paused = false;
    }

    fn apply_backpressure(&mut self) {
        let Some(subscription_id) = self.subscription_id else {
            return;
        };
        let buffered = self.queue.len();
        let threshold = self.config.pending_events_threshold;
        if !self.paused && buffered >= threshold {
            self.paused = true;
            tracing::debug!(projection = %self.names.name(), buffered, "pausing subscription");
            let _ = self.reader.send(ReaderCommand::Pause { subscription_id });
        } else if self.paused && buffered <= threshold / 2 {
            self.paused = false;
            tracing::debug!(projection = %self.names.name(), buffered, "resuming subscription");
            let _ = self.reader.send(ReaderCommand::Resume { subscription_id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::testing::{CallLog, CountingHandler};
    use crate::io::testing::{RecordingDispatcher, no_stream, written_after};
    use crate::io::{ExpectedVersion, IoRequest, ReadResult, RecordedEvent, StreamSlice};
    use crate::messages::ProjectionNotification;
    use crate::tag::{ProjectionVersion, TfPos};

    fn tag(commit: i64) -> CheckpointTag {
        CheckpointTag::from_position(0, TfPos::new(commit, commit - 1)).expect("valid tag")
    }

    struct Fixture {
        phase: ProcessingPhase,
        dispatcher: Arc<RecordingDispatcher>,
        reader: mpsc::UnboundedReceiver<ReaderCommand>,
        calls: CallLog,
        _notifications: mpsc::UnboundedReceiver<ProjectionNotification>,
        subscription_id: Uuid,
        sequence: i64,
    }

    fn fixture(source: SourceDefinition, config: ProjectionConfig) -> Fixture {
        let config = Arc::new(config);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (reader_tx, reader_rx) = mpsc::unbounded_channel();
        let manager = CheckpointManager::new(
            Uuid::new_v4(),
            ProjectionNames::new("p"),
            ProjectionVersion::new(1, 0, 1),
            Arc::clone(&config),
            source.position_tagger(0).expect("valid source"),
            dispatcher.clone(),
            notify_tx,
        );
        let (handler, calls) = CountingHandler::new(source);
        let phase = ProcessingPhase::new(
            ProjectionNames::new("p"),
            Box::new(handler),
            manager,
            config,
            reader_tx,
        );
        Fixture {
            phase,
            dispatcher,
            reader: reader_rx,
            calls,
            _notifications: notify_rx,
            subscription_id: Uuid::nil(),
            sequence: 0,
        }
    }

    fn without_checkpoints() -> ProjectionConfig {
        ProjectionConfig {
            checkpoints_enabled: false,
            ..ProjectionConfig::default()
        }
    }

    impl Fixture {
        /// Start at `tag(0)` without reading a checkpoint.
        fn start(&mut self) {
            self.phase.start(tag(0), None).expect("stopped");
            self.subscribe();
        }

        /// Read the (missing) checkpoint and start from it.
        fn load_and_start(&mut self) {
            self.phase
                .manager_mut()
                .begin_load_state()
                .expect("uninitialized");
            self.complete_io();
            let signals = self.phase.drain_signals();
            let [PhaseSignal::CheckpointLoaded { tag, root_state }] = signals.as_slice() else {
                panic!("expected a loaded checkpoint, got {signals:?}");
            };
            self.phase
                .start(tag.clone(), root_state.clone())
                .expect("stopped");
            self.subscribe();
        }

        fn subscribe(&mut self) {
            let command = self.reader.try_recv().expect("subscribe command");
            let ReaderCommand::Subscribe {
                subscription_id, ..
            } = command
            else {
                panic!("expected subscribe, got {command:?}");
            };
            self.subscription_id = subscription_id;
            self.sequence = 0;
            self.send(SubscriptionPayload::Started {
                starting_tag: tag(0),
            })
            .expect("started");
        }

        fn send(&mut self, payload: SubscriptionPayload) -> Result<(), ProjectionError> {
            let message = SubscriptionMessage {
                subscription_id: self.subscription_id,
                sequence_number: self.sequence,
                payload,
            };
            self.sequence += 1;
            self.phase.handle_subscription_message(message)
        }

        fn event(&mut self, commit: i64, stream: &str, event_type: &str) {
            let event = ResolvedEvent::new(
                stream,
                commit,
                TfPos::new(commit, commit - 1),
                event_type,
                "{}",
            );
            self.send(SubscriptionPayload::CommittedEvent {
                tag: tag(commit),
                event: Box::new(event),
                progress: commit as f32,
            })
            .expect("in order");
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("lock poisoned").clone()
        }

        fn commands(&mut self) -> Vec<ReaderCommand> {
            let mut commands = Vec::new();
            while let Ok(command) = self.reader.try_recv() {
                commands.push(command);
            }
            commands
        }

        /// Complete every request as if all streams were empty, until no
        /// new requests are issued.
        fn complete_io(&mut self) {
            loop {
                let requests = self.dispatcher.take();
                if requests.is_empty() {
                    break;
                }
                for request in requests {
                    let completion = match &request {
                        IoRequest::ReadBackward { .. } => no_stream(&request),
                        IoRequest::WriteEvents {
                            expected_version, ..
                        } => {
                            let last = match expected_version {
                                ExpectedVersion::Exact(last) => *last,
                                ExpectedVersion::Any | ExpectedVersion::NoStream => -1,
                            };
                            written_after(&request, last)
                        }
                        IoRequest::Delay { correlation_id, .. } => IoCompletion::DelayElapsed {
                            correlation_id: *correlation_id,
                        },
                    };
                    self.phase
                        .handle_io_completion(&completion)
                        .expect("completion handled");
                }
            }
        }
    }

    fn read_streams(requests: &[IoRequest]) -> Vec<&str> {
        requests
            .iter()
            .filter_map(|request| match request {
                IoRequest::ReadBackward { stream_id, .. } => Some(stream_id.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn events_update_the_root_partition() {
        let mut f = fixture(SourceDefinition::from_all(), without_checkpoints());
        f.start();
        assert_eq!(f.phase.status(), "Running/Subscribed");

        f.event(10, "orders-1", "Placed");
        f.event(20, "orders-2", "Placed");

        assert_eq!(f.calls(), ["initialize", "process  Placed", "process  Placed"]);
        assert_eq!(f.phase.manager().last_processed_tag(), Some(&tag(20)));
        assert_eq!(f.phase.buffered_events(), 0);
        assert_eq!(
            f.phase.query_partition_state(ROOT_PARTITION),
            StateQuery::Ready(Some(PartitionState::new(
                Some(r#"{"count":2}"#.into()),
                None,
                tag(20)
            )))
        );
    }

    #[test]
    fn messages_of_other_subscriptions_are_discarded() {
        let mut f = fixture(SourceDefinition::from_all(), without_checkpoints());
        f.start();
        let stale = SubscriptionMessage {
            subscription_id: Uuid::new_v4(),
            sequence_number: 7,
            payload: SubscriptionPayload::ProgressChanged { progress: 50.0 },
        };
        f.phase.handle_subscription_message(stale).expect("discarded");
        assert_eq!(f.phase.manager().progress(), 0.0);
    }

    #[test]
    fn sequence_gap_is_an_error() {
        let mut f = fixture(SourceDefinition::from_all(), without_checkpoints());
        f.start();
        f.sequence += 1;
        let err = f
            .send(SubscriptionPayload::ProgressChanged { progress: 1.0 })
            .expect_err("gap");
        assert!(matches!(
            err,
            ProjectionError::SequenceMismatch {
                expected: 1,
                actual: 2
            }
        ));
    }

    #[test]
    fn events_out_of_order_are_rejected() {
        let mut f = fixture(SourceDefinition::from_all(), without_checkpoints());
        f.start();
        f.event(20, "s", "Placed");
        let event = ResolvedEvent::new("s", 1, TfPos::new(10, 9), "Placed", "{}");
        let err = f
            .send(SubscriptionPayload::CommittedEvent {
                tag: tag(10),
                event: Box::new(event),
                progress: 0.0,
            })
            .expect_err("regression");
        assert!(matches!(err, ProjectionError::InvalidOrder { .. }));
    }

    #[test]
    fn handler_failure_faults_at_the_failing_position() {
        let mut f = fixture(SourceDefinition::from_all(), without_checkpoints());
        f.start();
        f.event(10, "s", "Placed");
        f.event(20, "s", "Fail");

        let signals = f.phase.drain_signals();
        let [PhaseSignal::Faulted(reason)] = signals.as_slice() else {
            panic!("expected a fault, got {signals:?}");
        };
        assert!(reason.starts_with("The p projection failed to process an event."));
        assert!(reason.contains("CountingHandler"));
        assert!(reason.contains(&format!("Event Position: {}", tag(20))));
        assert!(reason.ends_with("boom"));
        assert_eq!(f.phase.manager().progress(), 20.0);
        assert_eq!(f.phase.manager().last_processed_tag(), Some(&tag(10)));
        assert!(matches!(
            f.commands().as_slice(),
            [ReaderCommand::Unsubscribe { .. }]
        ));
        assert!(f.phase.status().ends_with("/Faulted"));

        // Later messages are ignored.
        f.event(30, "s", "Placed");
        assert_eq!(f.phase.manager().last_processed_tag(), Some(&tag(10)));
    }

    #[test]
    fn emitting_while_disabled_faults() {
        let mut f = fixture(SourceDefinition::from_all(), without_checkpoints());
        f.start();
        f.event(10, "s", "Emit");
        let signals = f.phase.drain_signals();
        assert!(matches!(
            signals.as_slice(),
            [PhaseSignal::Faulted(reason)] if reason.contains("emitting events is disabled")
        ));
        assert!(f.dispatcher.take().is_empty());
    }

    #[test]
    fn emitted_events_reach_their_stream() {
        let config = ProjectionConfig {
            emit_event_enabled: true,
            ..without_checkpoints()
        };
        let mut f = fixture(SourceDefinition::from_all(), config);
        f.start();
        f.event(10, "s", "Emit");
        assert!(f.phase.drain_signals().is_empty());
        assert_eq!(read_streams(&f.dispatcher.take()), ["out-"]);
        assert_eq!(f.phase.manager().last_processed_tag(), Some(&tag(10)));
    }

    #[test]
    fn handler_state_is_switched_only_between_partitions() {
        let source = SourceDefinition::from_all().partitioned_by_stream();
        let mut f = fixture(source, without_checkpoints());
        f.start();
        f.event(10, "a", "Placed");
        f.event(20, "a", "Placed");
        f.event(30, "b", "Placed");
        f.event(40, "a", "Placed");
        assert_eq!(
            f.calls(),
            [
                "initialize",
                "process a Placed",
                "process a Placed",
                "initialize",
                "process b Placed",
                r#"load {"count":2}"#,
                "process a Placed",
            ]
        );
    }

    #[test]
    fn uncached_partition_is_read_from_its_checkpoint_stream() {
        let source = SourceDefinition::from_all().partitioned_by_stream();
        let mut f = fixture(source, ProjectionConfig::default());
        f.load_and_start();

        f.event(10, "a", "Placed");
        f.event(11, "a", "Placed");
        assert_eq!(f.phase.buffered_events(), 2);
        let requests = f.dispatcher.take();
        assert_eq!(read_streams(&requests), ["$projections-p-a-checkpoint"]);

        let stored = PartitionState::new(Some(r#"{"count":5}"#.into()), None, tag(5));
        let completion = IoCompletion::StreamRead {
            correlation_id: requests[0].correlation_id(),
            result: ReadResult::Success(StreamSlice {
                events: vec![RecordedEvent {
                    stream_id: "$projections-p-a-checkpoint".into(),
                    event_number: 0,
                    event_id: Uuid::new_v4(),
                    event_type: "$Checkpoint".into(),
                    data: stored.serialize(),
                    metadata: Some(tag(5).to_json_string()),
                }],
                next_event_number: -1,
                last_event_number: 0,
                is_end_of_stream: true,
            }),
        };
        assert!(f.phase.handle_io_completion(&completion).expect("loaded"));

        assert_eq!(
            f.calls(),
            [r#"load {"count":5}"#, "process a Placed", "process a Placed"]
        );
        assert_eq!(f.phase.buffered_events(), 0);
        assert_eq!(f.phase.manager().last_processed_tag(), Some(&tag(11)));
    }

    #[test]
    fn saturated_queue_pauses_the_reader_until_drained() {
        let source = SourceDefinition::from_all().partitioned_by_stream();
        let config = ProjectionConfig {
            pending_events_threshold: 2,
            ..ProjectionConfig::default()
        };
        let mut f = fixture(source, config);
        f.load_and_start();

        f.event(10, "a", "Placed");
        assert!(f.commands().is_empty());
        f.event(20, "b", "Placed");
        assert!(matches!(
            f.commands().as_slice(),
            [ReaderCommand::Pause { .. }]
        ));
        assert_eq!(f.phase.status(), "Running/Subscribed/Paused");

        f.complete_io();
        assert_eq!(f.phase.buffered_events(), 0);
        assert!(matches!(
            f.commands().as_slice(),
            [ReaderCommand::Resume { .. }]
        ));
    }

    #[test]
    fn suggested_checkpoint_is_written() {
        let mut f = fixture(SourceDefinition::from_all(), ProjectionConfig::default());
        f.load_and_start();
        f.event(10, "s", "Placed");
        f.event(20, "s", "Placed");
        f.send(SubscriptionPayload::CheckpointSuggested {
            tag: tag(20),
            progress: 40.0,
        })
        .expect("at the current position");
        assert!(f.phase.manager().in_checkpoint());

        f.complete_io();
        assert_eq!(
            f.phase.drain_signals(),
            vec![PhaseSignal::CheckpointCompleted(tag(20))]
        );
        assert_eq!(f.phase.manager().last_completed_tag(), Some(&tag(20)));
    }

    #[test]
    fn suggestions_are_dropped_without_checkpoints() {
        let mut f = fixture(SourceDefinition::from_all(), without_checkpoints());
        f.start();
        f.event(10, "s", "Placed");
        f.send(SubscriptionPayload::CheckpointSuggested {
            tag: tag(10),
            progress: 40.0,
        })
        .expect("ignored");
        assert!(!f.phase.manager().in_checkpoint());
        assert!(f.dispatcher.take().is_empty());
    }

    #[test]
    fn end_of_input_unsubscribes_and_completes() {
        let mut f = fixture(SourceDefinition::from_all(), without_checkpoints());
        f.start();
        f.event(10, "s", "Placed");
        f.send(SubscriptionPayload::EofReached { tag: tag(10) })
            .expect("eof");
        assert!(matches!(
            f.commands().as_slice(),
            [ReaderCommand::Unsubscribe { .. }]
        ));
        assert_eq!(f.phase.drain_signals(), vec![PhaseSignal::PhaseCompleted]);
        assert_eq!(f.phase.subscription_state(), SubscriptionState::Unsubscribed);
    }

    #[test]
    fn changed_results_are_published_and_ignored_events_are_not() {
        let source = SourceDefinition::from_all().with_results();
        let mut f = fixture(source, without_checkpoints());
        f.start();

        f.event(10, "s", "Ignored");
        assert!(f.dispatcher.take().is_empty());
        assert_eq!(f.phase.manager().last_processed_tag(), Some(&tag(10)));

        f.event(20, "s", "Placed");
        assert_eq!(read_streams(&f.dispatcher.take()), ["$projections-p-result"]);
    }

    #[test]
    fn uncached_partition_query_reads_its_checkpoint() {
        let source = SourceDefinition::from_all().partitioned_by_stream();
        let mut f = fixture(source, ProjectionConfig::default());
        f.load_and_start();

        assert_eq!(f.phase.query_partition_state("x"), StateQuery::Loading);
        f.complete_io();
        let signals = f.phase.drain_signals();
        assert!(matches!(
            signals.as_slice(),
            [PhaseSignal::PartitionStateReady { partition, state: Some(state) }]
                if partition == "x" && state.state().is_none()
        ));
        assert!(matches!(
            f.phase.query_partition_state("x"),
            StateQuery::Ready(Some(_))
        ));
    }

    #[test]
    fn reader_failure_faults_the_phase() {
        let mut f = fixture(SourceDefinition::from_all(), without_checkpoints());
        f.start();
        f.send(SubscriptionPayload::Failed {
            reason: "disconnected".into(),
        })
        .expect("handled");
        assert_eq!(f.phase.subscription_state(), SubscriptionState::Failed);
        assert!(f.phase.fault().is_some_and(|r| r.contains("disconnected")));
    }
}
