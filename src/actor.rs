//! Worker task that owns a [`CoreProjection`] and serializes its inputs.
//!
//! The worker runs on a tokio task and handles one input at a time: reader
//! messages and queries arrive on a bounded `mpsc` channel from
//! [`ProjectionHandle`]s, storage completions arrive from the
//! [`StorageDispatcher`] the worker created. Nothing else touches the
//! projection, so the checkpoint pipeline needs no locking.
//!
//! Public API: [`ProjectionHandle`] (cloneable async handle) and
//! [`spawn_projection`] (factory that wires storage and starts the worker).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

use crate::config::ProjectionConfig;
use crate::error::{ConfigError, QueryError};
use crate::handler::StateHandler;
use crate::io::IoCompletion;
use crate::messages::{ProjectionNotification, ReaderCommand, SubscriptionMessage};
use crate::names::ProjectionNames;
use crate::partition::PartitionState;
use crate::phase::StateQuery;
use crate::projection::{CoreProjection, ProjectionState, ProjectionStatus};
use crate::storage::{EventStorage, StorageDispatcher};
use crate::tag::ProjectionVersion;

/// Capacity of the worker's inbox.
const INBOX_CAPACITY: usize = 32;

type QueryReply = oneshot::Sender<Result<Option<String>, QueryError>>;

/// Messages sent from [`ProjectionHandle`] to the worker.
pub(crate) enum ProjectionMessage {
    /// A message from the reader subscription.
    Subscription(SubscriptionMessage),

    /// Read the serialized state of a partition.
    GetState {
        /// The partition; `""` for the root partition.
        partition: String,
        /// Channel to send back the state.
        reply: QueryReply,
    },

    /// Read the serialized result of a partition.
    GetResult {
        /// The partition; `""` for the root partition.
        partition: String,
        /// Channel to send back the result.
        reply: QueryReply,
    },

    /// Report the projection's status.
    Status {
        /// Channel to send back the status.
        reply: oneshot::Sender<ProjectionStatus>,
    },

    /// Stop the projection and exit once it has stopped.
    Stop {
        /// Signalled when the projection is stopped or faulted.
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy)]
enum QueryKind {
    State,
    Result,
}

impl QueryKind {
    fn answer(self, state: Option<&PartitionState>) -> Option<String> {
        let state = state?;
        match self {
            Self::State => state.state().map(str::to_owned),
            Self::Result => state.result().map(str::to_owned),
        }
    }
}

/// Queries waiting for a partition state to be read from storage.
#[derive(Default)]
struct PendingQueries {
    by_partition: HashMap<String, Vec<(QueryKind, QueryReply)>>,
}

impl PendingQueries {
    fn ask(
        &mut self,
        projection: &mut CoreProjection,
        partition: String,
        kind: QueryKind,
        reply: QueryReply,
    ) {
        match projection.query_partition_state(&partition) {
            StateQuery::Ready(state) => {
                let _ = reply.send(Ok(kind.answer(state.as_ref())));
            }
            StateQuery::Loading => self
                .by_partition
                .entry(partition)
                .or_default()
                .push((kind, reply)),
        }
    }

    fn answer_ready(&mut self, projection: &mut CoreProjection) {
        for (partition, state) in projection.take_ready_states() {
            for (kind, reply) in self.by_partition.remove(&partition).unwrap_or_default() {
                let _ = reply.send(Ok(kind.answer(state.as_ref())));
            }
        }
    }

    fn fail_all(&mut self) {
        for (partition, waiting) in self.by_partition.drain() {
            for (_, reply) in waiting {
                let _ = reply.send(Err(QueryError::LoadFailed(partition.clone())));
            }
        }
    }
}

/// Runs the projection worker until a stop completes or every handle is
/// dropped and the projection has stopped.
///
/// # Arguments
///
/// * `projection` - The projection; started by the worker.
/// * `rx` - Receiving end of the handle channel.
/// * `completions` - Completions of the projection's storage requests.
async fn run_projection(
    mut projection: CoreProjection,
    mut rx: mpsc::Receiver<ProjectionMessage>,
    mut completions: mpsc::UnboundedReceiver<IoCompletion>,
) {
    let name = projection.names().name().to_owned();
    if let Err(err) = projection.start() {
        tracing::error!(projection = %name, error = %err, "projection failed to start");
        return;
    }

    let mut queries = PendingQueries::default();
    let mut stop_waiters: Vec<oneshot::Sender<()>> = Vec::new();
    let mut inbox_open = true;
    loop {
        tokio::select! {
            message = rx.recv(), if inbox_open => match message {
                Some(ProjectionMessage::Subscription(message)) => {
                    projection.handle_subscription_message(message);
                }
                Some(ProjectionMessage::GetState { partition, reply }) => {
                    queries.ask(&mut projection, partition, QueryKind::State, reply);
                }
                Some(ProjectionMessage::GetResult { partition, reply }) => {
                    queries.ask(&mut projection, partition, QueryKind::Result, reply);
                }
                Some(ProjectionMessage::Status { reply }) => {
                    let _ = reply.send(projection.status());
                }
                Some(ProjectionMessage::Stop { reply }) => {
                    stop_waiters.push(reply);
                    projection.stop();
                }
                // Every handle is gone: stop cleanly, then exit.
                None => {
                    inbox_open = false;
                    projection.stop();
                }
            },
            Some(completion) = completions.recv() => {
                if !projection.handle_io_completion(&completion) {
                    tracing::debug!(
                        projection = %name,
                        correlation_id = %completion.correlation_id(),
                        "ignoring unclaimed completion"
                    );
                }
            }
            else => break,
        }

        queries.answer_ready(&mut projection);
        let state = projection.state();
        // Loads in flight are dropped on restart and on stop.
        if state.is_terminal() || state == ProjectionState::LoadingState {
            queries.fail_all();
        }
        if state.is_terminal() && (!stop_waiters.is_empty() || !inbox_open) {
            break;
        }
    }
    for waiter in stop_waiters {
        let _ = waiter.send(());
    }
    tracing::debug!(projection = %name, "projection worker exited");
}

/// Async handle to a running projection worker.
///
/// Lightweight, cloneable, and `Send + Sync`. Dropping every handle stops
/// the projection.
#[derive(Debug, Clone)]
pub struct ProjectionHandle {
    sender: mpsc::Sender<ProjectionMessage>,
    /// The worker task, taken and awaited once by [`stop`](Self::stop).
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl ProjectionHandle {
    /// Deliver one message from the reader subscription.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::WorkerGone`] if the worker has exited.
    pub async fn send_subscription_message(
        &self,
        message: SubscriptionMessage,
    ) -> Result<(), QueryError> {
        self.sender
            .send(ProjectionMessage::Subscription(message))
            .await
            .map_err(|_| QueryError::WorkerGone)
    }

    /// Deliver every message of `messages`, in order.
    ///
    /// # Returns
    ///
    /// The number of messages delivered.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::WorkerGone`] if the worker exits before the
    /// stream ends.
    pub async fn feed<S>(&self, mut messages: S) -> Result<usize, QueryError>
    where
        S: Stream<Item = SubscriptionMessage> + Unpin,
    {
        let mut delivered = 0;
        while let Some(message) = messages.next().await {
            self.send_subscription_message(message).await?;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Serialized state of `partition`, read from its checkpoint stream if
    /// it is not cached. `None` if the partition has no state.
    ///
    /// # Errors
    ///
    /// * [`QueryError::LoadFailed`] -- the projection stopped or failed
    ///   before the state was read.
    /// * [`QueryError::WorkerGone`] -- the worker has exited.
    pub async fn get_state(&self, partition: &str) -> Result<Option<String>, QueryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ProjectionMessage::GetState {
                partition: partition.to_owned(),
                reply: tx,
            })
            .await
            .map_err(|_| QueryError::WorkerGone)?;
        rx.await.map_err(|_| QueryError::WorkerGone)?
    }

    /// Serialized result of `partition`. `None` if the projection does not
    /// produce results or the partition has none.
    ///
    /// # Errors
    ///
    /// Same as [`get_state`](Self::get_state).
    pub async fn get_result(&self, partition: &str) -> Result<Option<String>, QueryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ProjectionMessage::GetResult {
                partition: partition.to_owned(),
                reply: tx,
            })
            .await
            .map_err(|_| QueryError::WorkerGone)?;
        rx.await.map_err(|_| QueryError::WorkerGone)?
    }

    /// Current status of the projection.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::WorkerGone`] if the worker has exited.
    pub async fn status(&self) -> Result<ProjectionStatus, QueryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ProjectionMessage::Status { reply: tx })
            .await
            .map_err(|_| QueryError::WorkerGone)?;
        rx.await.map_err(|_| QueryError::WorkerGone)
    }

    /// Stop the projection, wait for its final checkpoint and for the
    /// worker to exit.
    ///
    /// Calling `stop` more than once is safe.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::WorkerGone`] if the worker task panicked.
    pub async fn stop(&self) -> Result<(), QueryError> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ProjectionMessage::Stop { reply: tx })
            .await
            .is_ok()
        {
            // The worker drops the reply only if it exits first.
            let _ = rx.await;
        }
        let task = self.task.lock().await.take();
        match task {
            Some(task) => task.await.map_err(|_| QueryError::WorkerGone),
            None => Ok(()),
        }
    }

    /// Whether the worker is still running.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// A running projection and the channels its owner consumes.
#[derive(Debug)]
pub struct SpawnedProjection {
    /// Correlation id stamped on the projection's notifications.
    pub projection_id: Uuid,
    /// Handle to the worker.
    pub handle: ProjectionHandle,
    /// Commands for the reader that feeds the projection.
    pub reader_commands: mpsc::UnboundedReceiver<ReaderCommand>,
    /// Notifications published by the projection.
    pub notifications: mpsc::UnboundedReceiver<ProjectionNotification>,
}

/// Start a projection on a tokio task.
///
/// The projection reads its last checkpoint from `storage`, then asks its
/// reader to subscribe through `reader_commands`. Must be called from
/// within a tokio runtime.
///
/// # Arguments
///
/// * `names` - Names of the projection's streams.
/// * `version` - Version stamped on written checkpoints.
/// * `handler` - Computes the projection's state.
/// * `config` - Checkpointing, backpressure and emission settings.
/// * `storage` - Backing store for checkpoints and emitted events.
///
/// # Errors
///
/// Returns [`ConfigError`] if `config` or the handler's source definition
/// is invalid.
pub fn spawn_projection<H: StateHandler>(
    names: ProjectionNames,
    version: ProjectionVersion,
    handler: H,
    config: ProjectionConfig,
    storage: Arc<dyn EventStorage>,
) -> Result<SpawnedProjection, ConfigError> {
    let projection_id = Uuid::new_v4();
    let (completion_tx, completion_rx) = mpsc::unbounded_channel();
    let (reader_tx, reader_commands) = mpsc::unbounded_channel();
    let (notify_tx, notifications) = mpsc::unbounded_channel();
    let dispatcher = Arc::new(StorageDispatcher::new(storage, completion_tx));
    let projection = CoreProjection::new(
        projection_id,
        names,
        version,
        Box::new(handler),
        config,
        dispatcher,
        reader_tx,
        notify_tx,
    )?;

    let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
    let task = tokio::spawn(run_projection(projection, rx, completion_rx));
    Ok(SpawnedProjection {
        projection_id,
        handle: ProjectionHandle {
            sender: tx,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        },
        reader_commands,
        notifications,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ResolvedEvent;
    use crate::handler::testing::CountingHandler;
    use crate::source::SourceDefinition;
    use crate::storage::InMemoryEventStorage;
    use crate::subscription::ReaderSubscription;
    use crate::tag::TfPos;

    async fn subscription(
        spawned: &mut SpawnedProjection,
        source: &SourceDefinition,
    ) -> ReaderSubscription {
        let command = spawned
            .reader_commands
            .recv()
            .await
            .expect("reader command");
        let ReaderCommand::Subscribe {
            subscription_id,
            from,
        } = command
        else {
            panic!("expected subscribe, got {command:?}");
        };
        let tagger = source.position_tagger(0).expect("valid source");
        ReaderSubscription::new(
            subscription_id,
            from,
            source.clone(),
            tagger,
            &ProjectionConfig::default(),
        )
        .expect("compatible tag")
    }

    fn events(subscription: &mut ReaderSubscription, commits: &[i64]) -> Vec<SubscriptionMessage> {
        let mut messages = vec![subscription.started()];
        for &commit in commits {
            let event = ResolvedEvent::new(
                "orders-1",
                commit,
                TfPos::new(commit, commit - 1),
                "Placed",
                "{}",
            );
            messages.extend(subscription.handle_event(event, 0.0).expect("tagged"));
        }
        messages
    }

    fn spawn(source: &SourceDefinition, storage: Arc<InMemoryEventStorage>) -> SpawnedProjection {
        let (handler, _) = CountingHandler::new(source.clone());
        spawn_projection(
            ProjectionNames::new("orders"),
            ProjectionVersion::new(1, 0, 1),
            handler,
            ProjectionConfig::default(),
            storage,
        )
        .expect("valid config")
    }

    #[tokio::test]
    async fn processes_fed_messages_and_answers_queries() {
        let source = SourceDefinition::from_all().with_results();
        let storage = Arc::new(InMemoryEventStorage::default());
        let mut spawned = spawn(&source, storage);
        let mut sub = subscription(&mut spawned, &source).await;

        let delivered = spawned
            .handle
            .feed(tokio_stream::iter(events(&mut sub, &[10, 20])))
            .await
            .expect("fed");
        assert_eq!(delivered, 3);

        let status = spawned.handle.status().await.expect("status");
        assert_eq!(status.state, ProjectionState::Running);
        assert_eq!(status.events_processed, 2);
        assert_eq!(
            spawned.handle.get_state("").await.expect("state"),
            Some(r#"{"count":2}"#.to_owned())
        );
        assert_eq!(
            spawned.handle.get_result("").await.expect("result"),
            Some("2".to_owned())
        );
        spawned.handle.stop().await.expect("stopped");
    }

    #[tokio::test]
    async fn stop_writes_checkpoint_and_exits() {
        let source = SourceDefinition::from_all();
        let storage = Arc::new(InMemoryEventStorage::default());
        let mut spawned = spawn(&source, storage.clone());
        let mut sub = subscription(&mut spawned, &source).await;
        spawned
            .handle
            .feed(tokio_stream::iter(events(&mut sub, &[10])))
            .await
            .expect("fed");

        spawned.handle.stop().await.expect("stopped");
        assert!(!spawned.handle.is_alive());
        spawned.handle.stop().await.expect("second stop is a no-op");

        let checkpoints = storage.read_stream("$projections-orders-checkpoint").await;
        assert_eq!(checkpoints.len(), 1);
        let mut stopped = false;
        while let Ok(notification) = spawned.notifications.try_recv() {
            stopped |= matches!(notification, ProjectionNotification::Stopped { .. });
        }
        assert!(stopped);
        assert_eq!(
            spawned.handle.status().await,
            Err(QueryError::WorkerGone)
        );
    }
}
