//! Crate-level error types for the tag algebra, the checkpoint pipeline and
//! configuration.
//!
//! Errors returned from this crate are *invariant violations*: they mean a
//! reader, tagger or handler broke its contract and the affected projection
//! must halt. Expected branching (handled / not handled, found / not found,
//! completed synchronously) is expressed through return values instead.

use crate::tag::TagMode;

/// Error returned when building, comparing, adjusting or decoding a
/// [`CheckpointTag`](crate::CheckpointTag) fails.
#[derive(Debug, thiserror::Error)]
pub enum TagError {
    /// The two tags use modes that cannot be compared, even after upgrading
    /// the narrower one.
    #[error("cannot compare checkpoint tags in different modes: {left} vs {right}")]
    UnsupportedComparison {
        /// Mode of the left operand.
        left: TagMode,
        /// Mode of the right operand.
        right: TagMode,
    },

    /// Two by-stream tags refer to different catalog streams.
    #[error("cannot compare by-stream checkpoint tags over different catalogs: `{left}` vs `{right}`")]
    IncompatibleCatalog {
        /// Catalog stream of the left operand.
        left: String,
        /// Catalog stream of the right operand.
        right: String,
    },

    /// Neither multi-stream tag dominates the other: each one is ahead on at
    /// least one stream. The histories the tags describe have diverged.
    #[error("checkpoint tags {left} and {right} are incomparable")]
    IncomparableTags {
        /// Rendering of the left operand.
        left: String,
        /// Rendering of the right operand.
        right: String,
    },

    /// Two single-stream tags refer to different streams.
    #[error("cannot compare stream checkpoint tags across different streams: `{left}` vs `{right}`")]
    DifferentStreams {
        /// Stream of the left operand.
        left: String,
        /// Stream of the right operand.
        right: String,
    },

    /// A factory rejected its arguments.
    #[error("invalid checkpoint tag: {0}")]
    InvalidTag(String),

    /// The stream or event type is not tracked by the tag being updated.
    #[error("stream or event type `{0}` is not tracked by this checkpoint tag")]
    StreamNotFound(String),

    /// The operation is not defined for the tag's mode.
    #[error("{operation} is not supported for {mode} checkpoint tags")]
    InvalidMode {
        /// Name of the attempted operation.
        operation: &'static str,
        /// Mode of the tag the operation was attempted on.
        mode: TagMode,
    },

    /// The tag belongs to a later phase than the tagger handling it.
    #[error("invalid checkpoint tag phase: expected at most {expected}, was {actual}")]
    PhaseAhead {
        /// The tagger's own phase.
        expected: i32,
        /// The tag's phase.
        actual: i32,
    },

    /// The tag cannot be converted into the mode the tagger produces.
    #[error("conversion from {from} to {to} checkpoint tag is not supported")]
    UnsupportedAdjustment {
        /// Mode of the tag being adjusted.
        from: TagMode,
        /// Mode the tagger produces.
        to: TagMode,
    },

    /// The JSON text could not be parsed at all.
    #[error("malformed checkpoint tag JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Fatal invariant violation raised by the checkpoint pipeline or the
/// processing phase.
///
/// These are never retried: the projection that raised one is faulted.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// A tag comparison, update or adjustment failed.
    #[error(transparent)]
    Tag(#[from] TagError),

    /// [`PositionTracker::update_by_checkpoint_tag_initial`](crate::PositionTracker::update_by_checkpoint_tag_initial)
    /// was called a second time.
    #[error("initial position was already set to {0}")]
    InitialPositionAlreadySet(String),

    /// A forward update was attempted before the initial position was set.
    #[error("initial position was not set")]
    InitialPositionNotSet,

    /// A tag did not move strictly forward.
    #[error("event at checkpoint tag {new} has already been processed (last tag: {last})")]
    PositionRegression {
        /// The last accepted tag.
        last: String,
        /// The rejected tag.
        new: String,
    },

    /// A tag was produced by a different reader strategy than the tracker's.
    #[error("checkpoint tag {tag} is not compatible with the {tagger} position tagger")]
    IncompatibleTag {
        /// Rendering of the rejected tag.
        tag: String,
        /// Name of the tagger that rejected it.
        tagger: &'static str,
    },

    /// A subscription message arrived out of sequence.
    #[error("subscription message out of order: expected sequence number {expected}, got {actual}")]
    SequenceMismatch {
        /// The next sequence number the phase expected.
        expected: i64,
        /// The sequence number carried by the message.
        actual: i64,
    },

    /// Events were emitted into, or a second prepare was issued on, a
    /// checkpoint generation that is already closing.
    #[error("checkpoint already requested")]
    CheckpointAlreadyRequested,

    /// A checkpoint was requested at a position before work already routed
    /// through the generation.
    #[error("checkpoint position {position} must be {requirement} {bound}")]
    InvalidCheckpointPosition {
        /// The requested checkpoint position.
        position: String,
        /// Human-readable relation that was violated.
        requirement: &'static str,
        /// The bound the position was compared against.
        bound: String,
    },

    /// Emitted events for one stream were not in causing-tag order.
    #[error("events emitted to `{stream}` are out of order: {current} follows {last}")]
    EmittedOutOfOrder {
        /// Destination stream.
        stream: String,
        /// Causing tag of the previously accepted event.
        last: String,
        /// Causing tag of the rejected event.
        current: String,
    },

    /// Work was queued with a tag behind the last queued tag.
    #[error("invalid order: last known tag is {last}, current tag is {current}")]
    InvalidOrder {
        /// Last tag accepted by the queue.
        last: String,
        /// Rejected tag.
        current: String,
    },

    /// A lifecycle operation was called in a state that does not allow it.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// The attempted operation.
        operation: &'static str,
        /// Description of the current state.
        state: String,
    },

    /// A checkpoint was suggested to a projection without persistent
    /// checkpoints.
    #[error("checkpoints are not enabled for this projection")]
    CheckpointsDisabled,

    /// A checkpoint was requested while another one was still in flight.
    #[error("a checkpoint is already in progress")]
    CheckpointInProgress,
}

/// Error returned when a [`ProjectionConfig`](crate::ProjectionConfig) or a
/// [`SourceDefinition`](crate::SourceDefinition) is unusable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A threshold or limit that must be positive was zero.
    #[error("{field} must be greater than zero")]
    Zero {
        /// Name of the offending field.
        field: &'static str,
    },

    /// The source definition does not select any reader strategy.
    #[error("invalid source definition: {0}")]
    InvalidSource(String),
}

/// Error returned from a [`ProjectionHandle`](crate::ProjectionHandle)
/// request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// The partition state could not be read from storage.
    #[error("failed to load partition `{0}`")]
    LoadFailed(String),

    /// The projection worker has exited.
    #[error("projection worker is no longer running")]
    WorkerGone,
}
