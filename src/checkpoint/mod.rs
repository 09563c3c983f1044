//! Checkpointing: generations of emitted events, the checkpoint writer and
//! the manager that ties them to a projection's progress.
//!
//! A checkpoint is only written once every event emitted before its
//! position is durable. The pieces, from the bottom up:
//!
//! - [`EmittedStream`]: queues and writes emitted events for one stream.
//! - [`ProjectionCheckpoint`]: one checkpoint interval; reports readiness
//!   once all of its streams have flushed.
//! - [`CheckpointWriter`]: appends checkpoint events with retry and backoff.
//! - [`CheckpointManager`]: rotates generations, hands ready checkpoints to
//!   the writer, and loads persisted checkpoints and partition states.

mod emitted_stream;
mod generation;
mod manager;
mod writer;

pub use emitted_stream::{EmittedStream, StreamFailure};
pub use generation::ProjectionCheckpoint;
pub use manager::{CheckpointManager, ManagerSignal, ManagerState};
pub use writer::{
    CheckpointWriter, LARGE_CHECKPOINT_BYTES, MAX_CHECKPOINT_WRITE_ATTEMPTS, WriterOutcome,
};
