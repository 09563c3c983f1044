//! A single projection: checkpoint loading, processing and shutdown.
//!
//! [`CoreProjection`] ties a [`ProcessingPhase`] to its lifecycle. It loads
//! the last checkpoint, starts the phase from it, reacts to the signals the
//! phase and its checkpoint manager raise, and publishes
//! [`ProjectionNotification`]s. It is driven synchronously by its owner; see
//! [`spawn_projection`](crate::spawn_projection) for the tokio worker that
//! runs it.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::checkpoint::CheckpointManager;
use crate::config::ProjectionConfig;
use crate::error::{ConfigError, ProjectionError};
use crate::handler::StateHandler;
use crate::io::{IoCompletion, IoDispatcher};
use crate::messages::{ProjectionNotification, ReaderCommand, SubscriptionMessage};
use crate::names::ProjectionNames;
use crate::partition::PartitionState;
use crate::phase::{PhaseSignal, ProcessingPhase, StateQuery};
use crate::tag::{CheckpointTag, ProjectionVersion};

/// Lifecycle of a [`CoreProjection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionState {
    /// Created, not started.
    Initial,
    /// Reading the last checkpoint.
    LoadingState,
    /// Processing events.
    Running,
    /// Writing the stop checkpoint.
    Stopping,
    /// Stopped; may be started again.
    Stopped,
    /// Failed; processing will not resume.
    Faulted,
}

impl ProjectionState {
    /// Whether the projection will not process anything until restarted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Faulted)
    }
}

impl fmt::Display for ProjectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initial => "Initial",
            Self::LoadingState => "LoadingState",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Faulted => "Faulted",
        })
    }
}

/// Point-in-time view of a projection.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionStatus {
    /// Lifecycle state.
    pub state: ProjectionState,
    /// Status of the processing phase, e.g. `Running/Subscribed`.
    pub phase_status: String,
    /// Queued, unprocessed work items.
    pub buffered_events: usize,
    /// Tag of the last processed event.
    pub last_processed_tag: Option<CheckpointTag>,
    /// Tag of the last completed checkpoint.
    pub last_checkpoint_tag: Option<CheckpointTag>,
    /// Why the projection faulted.
    pub fault_reason: Option<String>,
    /// Events processed since the projection last (re)started.
    pub events_processed: u64,
}

/// One projection instance.
pub struct CoreProjection {
    projection_id: Uuid,
    names: ProjectionNames,
    config: Arc<ProjectionConfig>,
    phase: ProcessingPhase,
    notifications: mpsc::UnboundedSender<ProjectionNotification>,
    state: ProjectionState,
    completed: bool,
    fault_reason: Option<String>,
    ready_states: Vec<(String, Option<PartitionState>)>,
}

impl fmt::Debug for CoreProjection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreProjection")
            .field("projection_id", &self.projection_id)
            .field("name", &self.names.name())
            .field("state", &self.state)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl CoreProjection {
    /// Create a projection in the [`Initial`](ProjectionState::Initial)
    /// state.
    ///
    /// # Arguments
    ///
    /// * `projection_id` - Correlation id stamped on every notification.
    /// * `handler` - Computes state; its source definition picks the reader
    ///   strategy.
    /// * `dispatcher` - Executes storage requests. Completions must be fed
    ///   back with [`handle_io_completion`](Self::handle_io_completion).
    /// * `reader` - Receives subscription commands.
    /// * `notifications` - Receives outbound notifications.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` or the handler's source
    /// definition is invalid.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        projection_id: Uuid,
        names: ProjectionNames,
        version: ProjectionVersion,
        handler: Box<dyn StateHandler>,
        config: ProjectionConfig,
        dispatcher: Arc<dyn IoDispatcher>,
        reader: mpsc::UnboundedSender<ReaderCommand>,
        notifications: mpsc::UnboundedSender<ProjectionNotification>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        let tagger = handler.source_definition().position_tagger(0)?;
        let manager = CheckpointManager::new(
            projection_id,
            names.clone(),
            version,
            Arc::clone(&config),
            tagger,
            dispatcher,
            notifications.clone(),
        );
        let phase = ProcessingPhase::new(
            names.clone(),
            handler,
            manager,
            Arc::clone(&config),
            reader,
        );
        Ok(Self {
            projection_id,
            names,
            config,
            phase,
            notifications,
            state: ProjectionState::Initial,
            completed: false,
            fault_reason: None,
            ready_states: Vec::new(),
        })
    }

    /// Correlation id of this projection.
    pub fn projection_id(&self) -> Uuid {
        self.projection_id
    }

    /// Names of the projection's streams.
    pub fn names(&self) -> &ProjectionNames {
        &self.names
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProjectionState {
        self.state
    }

    /// Snapshot of the projection's progress.
    pub fn status(&self) -> ProjectionStatus {
        let manager = self.phase.manager();
        ProjectionStatus {
            state: self.state,
            phase_status: self.phase.status(),
            buffered_events: self.phase.buffered_events(),
            last_processed_tag: manager.last_processed_tag().cloned(),
            last_checkpoint_tag: manager.last_completed_tag().cloned(),
            fault_reason: self.fault_reason.clone(),
            events_processed: manager.events_processed_after_restart(),
        }
    }

    /// Read the last checkpoint; processing starts once it is loaded.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::InvalidState`] unless the projection is
    /// new or stopped.
    pub fn start(&mut self) -> Result<(), ProjectionError> {
        if !matches!(
            self.state,
            ProjectionState::Initial | ProjectionState::Stopped
        ) {
            return Err(ProjectionError::InvalidState {
                operation: "start",
                state: self.state.to_string(),
            });
        }
        tracing::info!(projection = %self.names.name(), "starting projection");
        self.completed = false;
        self.load_state()
    }

    /// Stop reading and write a final checkpoint.
    ///
    /// [`ProjectionNotification::Stopped`] is published once every emitted
    /// event and the checkpoint are written; immediately if nothing was
    /// processed since the last checkpoint.
    pub fn stop(&mut self) {
        if let Err(err) = self.begin_stop() {
            self.fail(err);
        }
        self.settle();
    }

    /// Handle a message from the reader subscription.
    ///
    /// An invariant violation faults the projection.
    pub fn handle_subscription_message(&mut self, message: SubscriptionMessage) {
        if let Err(err) = self.phase.handle_subscription_message(message) {
            self.fail(err);
        }
        self.settle();
    }

    /// Handle a storage completion. Returns whether the projection had
    /// requested it.
    pub fn handle_io_completion(&mut self, completion: &IoCompletion) -> bool {
        let claimed = match self.phase.handle_io_completion(completion) {
            Ok(claimed) => claimed,
            Err(err) => {
                self.fail(err);
                true
            }
        };
        self.settle();
        claimed
    }

    /// State of `partition`. [`StateQuery::Loading`] means the answer
    /// arrives through [`take_ready_states`](Self::take_ready_states).
    pub fn query_partition_state(&mut self, partition: &str) -> StateQuery {
        self.phase.query_partition_state(partition)
    }

    /// Partition states loaded for queries since the last call.
    pub fn take_ready_states(&mut self) -> Vec<(String, Option<PartitionState>)> {
        std::mem::take(&mut self.ready_states)
    }

    fn load_state(&mut self) -> Result<(), ProjectionError> {
        self.phase.initialize();
        self.phase.manager_mut().begin_load_state()?;
        self.state = ProjectionState::LoadingState;
        Ok(())
    }

    fn begin_stop(&mut self) -> Result<(), ProjectionError> {
        match self.state {
            ProjectionState::LoadingState => {
                self.phase.initialize();
                self.stopped();
            }
            ProjectionState::Running => {
                tracing::info!(projection = %self.names.name(), "stopping projection");
                self.state = ProjectionState::Stopping;
                self.phase.stop();
                let synchronous = self.phase.manager_mut().stopping()?;
                self.phase.drain()?;
                // A failed manager stops without signalling.
                if synchronous && self.phase.manager().is_failed() {
                    self.stopped();
                }
            }
            ProjectionState::Initial
            | ProjectionState::Stopping
            | ProjectionState::Stopped
            | ProjectionState::Faulted => {}
        }
        Ok(())
    }

    /// React to signals until none are left.
    fn settle(&mut self) {
        loop {
            let signals = self.phase.drain_signals();
            if signals.is_empty() {
                return;
            }
            for signal in signals {
                match self.apply(signal) {
                    Ok(true) => {}
                    // Signals raised before a restart are stale.
                    Ok(false) => break,
                    Err(err) => self.fail(err),
                }
            }
        }
    }

    /// Returns `false` if the remaining signals of the batch must be
    /// dropped.
    fn apply(&mut self, signal: PhaseSignal) -> Result<bool, ProjectionError> {
        match signal {
            PhaseSignal::CheckpointLoaded { tag, root_state } => {
                if self.state != ProjectionState::LoadingState {
                    return Ok(true);
                }
                self.phase.start(tag.clone(), root_state)?;
                self.state = ProjectionState::Running;
                tracing::info!(projection = %self.names.name(), from = %tag, "projection started");
                self.notify(ProjectionNotification::Started {
                    projection_id: self.projection_id,
                    from: tag,
                });
            }
            PhaseSignal::CheckpointCompleted(_) => {}
            PhaseSignal::PartitionStateReady { partition, state } => {
                self.ready_states.push((partition, state));
            }
            PhaseSignal::PhaseCompleted => {
                self.completed = true;
                if self.config.stop_on_eof {
                    self.begin_stop()?;
                }
            }
            PhaseSignal::Stopped => {
                if self.state == ProjectionState::Stopping {
                    self.stopped();
                }
            }
            PhaseSignal::Faulted(reason) => {
                if self.state != ProjectionState::Faulted {
                    self.phase.stop();
                    self.faulted(reason.clone());
                    self.notify(ProjectionNotification::Failed {
                        projection_id: self.projection_id,
                        reason,
                    });
                }
            }
            PhaseSignal::ManagerFailed(reason) => {
                self.phase.stop();
                self.faulted(reason);
            }
            PhaseSignal::RestartRequested(reason) => {
                tracing::warn!(
                    projection = %self.names.name(),
                    reason = %reason,
                    "restarting projection from its last checkpoint"
                );
                self.load_state()?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Fault on an invariant violation. The manager publishes the failure.
    fn fail(&mut self, err: ProjectionError) {
        if self.state == ProjectionState::Faulted {
            return;
        }
        let reason = err.to_string();
        self.phase.manager_mut().fail(reason.clone());
        self.phase.stop();
        self.faulted(reason);
    }

    fn faulted(&mut self, reason: String) {
        if self.state == ProjectionState::Faulted {
            return;
        }
        self.state = ProjectionState::Faulted;
        self.fault_reason = Some(reason);
    }

    fn stopped(&mut self) {
        self.state = ProjectionState::Stopped;
        tracing::info!(
            projection = %self.names.name(),
            completed = self.completed,
            "projection stopped"
        );
        self.notify(ProjectionNotification::Stopped {
            projection_id: self.projection_id,
            completed: self.completed,
        });
    }

    fn notify(&self, notification: ProjectionNotification) {
        let _ = self.notifications.send(notification);
    }
}
