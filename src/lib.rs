//! Checkpointing and event-processing core for continuous projections.
//!
//! A projection folds the events of an event store into per-partition
//! state. This crate provides the machinery between the reader that
//! delivers events and the handler that computes state: position tags and
//! their ordering, the processing phase, and the checkpoint pipeline that
//! makes state and emitted events durable in order.
//!
//! Start with [`spawn_projection`], which runs a [`StateHandler`] against
//! an [`EventStorage`] on a tokio task and returns a [`ProjectionHandle`].

mod actor;
pub use actor::{ProjectionHandle, SpawnedProjection, spawn_projection};
mod checkpoint;
pub use checkpoint::{
    CheckpointManager, CheckpointWriter, EmittedStream, LARGE_CHECKPOINT_BYTES,
    MAX_CHECKPOINT_WRITE_ATTEMPTS, ManagerSignal, ManagerState, ProjectionCheckpoint,
    StreamFailure, WriterOutcome,
};
mod config;
mod error;
mod event;
mod handler;
mod io;
mod messages;
mod names;
mod partition;
mod phase;
mod position;
mod projection;
mod results;
mod source;
mod storage;
mod subscription;
mod tag;

pub use config::ProjectionConfig;
pub use error::{ConfigError, ProjectionError, QueryError, TagError};
pub use event::{
    CAUSED_BY_KEY, CORRELATION_ID_KEY, EmittedEvent, EmittedEventEnvelope, EmittedStreamMetadata,
    ResolvedEvent,
};
pub use handler::{HandlerError, PartitionDeletedOutcome, ProcessEventOutcome, StateHandler};
pub use io::{
    EventToWrite, ExpectedVersion, IoCompletion, IoDispatcher, IoRequest, ReadResult,
    RecordedEvent, StreamSlice, WriteResult,
};
pub use messages::{ProjectionNotification, ReaderCommand, SubscriptionMessage, SubscriptionPayload};
pub use names::{
    ADMINS_ROLE, PARTITION_CHECKPOINT_EVENT_TYPE, PROJECTION_CHECKPOINT_EVENT_TYPE,
    ProjectionNames, RESULT_EVENT_TYPE, RESULT_REMOVED_EVENT_TYPE, STREAM_METADATA_EVENT_TYPE,
};
pub use partition::{DEFAULT_MAX_CACHED_PARTITIONS, PartitionState, PartitionStateCache, ROOT_PARTITION};
pub use phase::{PhaseSignal, PhaseState, ProcessingPhase, StateQuery, SubscriptionState, WorkQueue};
pub use position::{
    CatalogStreamPositionTagger, EventByTypeIndexPositionTagger, MultiStreamPositionTagger,
    PhasePositionTagger, PositionTagger, PositionTracker, PreparePositionTagger,
    StreamPositionTagger, TransactionFilePositionTagger,
};
pub use projection::{CoreProjection, ProjectionState, ProjectionStatus};
pub use results::ResultWriter;
pub use source::{CATEGORY_STREAM_PREFIX, PartitionSelector, SourceDefinition};
pub use storage::{EventStorage, InMemoryEventStorage, StorageDispatcher, StorageFuture};
pub use subscription::{ReaderSubscription, STREAM_DELETED_EVENT_TYPE};
pub use tag::{
    ByStreamPosition, CheckpointTag, CheckpointTagVersion, NO_STREAM, PROJECTIONS_SYSTEM_VERSION,
    ProjectionVersion, TagMode, TfPos,
};
