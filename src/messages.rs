//! Messages exchanged between a projection, its reader and its owner.
//!
//! - [`SubscriptionMessage`]: reader to projection, strictly sequenced per
//!   subscription.
//! - [`ReaderCommand`]: projection to reader (subscribe, pause, resume,
//!   unsubscribe).
//! - [`ProjectionNotification`]: projection to its owner.

use uuid::Uuid;

use crate::event::ResolvedEvent;
use crate::tag::CheckpointTag;

/// A message delivered by a reader subscription.
///
/// Messages of one subscription carry consecutive sequence numbers starting
/// at zero. A projection discards messages of other subscriptions and treats
/// a gap in the sequence as a fatal ordering violation.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionMessage {
    /// Subscription the message belongs to.
    pub subscription_id: Uuid,
    /// Position of the message in the subscription's sequence.
    pub sequence_number: i64,
    /// The message itself.
    pub payload: SubscriptionPayload,
}

/// Content of a [`SubscriptionMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionPayload {
    /// The subscription is live, starting after `starting_tag`.
    Started {
        /// Tag the subscription starts after.
        starting_tag: CheckpointTag,
    },
    /// An event to process.
    CommittedEvent {
        /// Tag of the event.
        tag: CheckpointTag,
        /// The event.
        event: Box<ResolvedEvent>,
        /// Reader progress in percent.
        progress: f32,
    },
    /// The reader suggests checkpointing at `tag`.
    CheckpointSuggested {
        /// Tag to checkpoint at.
        tag: CheckpointTag,
        /// Reader progress in percent.
        progress: f32,
    },
    /// Reader progress changed without new events.
    ProgressChanged {
        /// Reader progress in percent.
        progress: f32,
    },
    /// The reader reached the end of its input.
    EofReached {
        /// Tag of the end of the input.
        tag: CheckpointTag,
    },
    /// The source stream of a partition was deleted.
    PartitionDeleted {
        /// The affected partition.
        partition: String,
        /// Tag of the deletion.
        tag: CheckpointTag,
    },
    /// The reader failed.
    Failed {
        /// Why the reader failed.
        reason: String,
    },
}

impl SubscriptionMessage {
    /// Tag the message is positioned at, if it carries one.
    pub fn tag(&self) -> Option<&CheckpointTag> {
        match &self.payload {
            SubscriptionPayload::Started { starting_tag } => Some(starting_tag),
            SubscriptionPayload::CommittedEvent { tag, .. }
            | SubscriptionPayload::CheckpointSuggested { tag, .. }
            | SubscriptionPayload::EofReached { tag }
            | SubscriptionPayload::PartitionDeleted { tag, .. } => Some(tag),
            SubscriptionPayload::ProgressChanged { .. } | SubscriptionPayload::Failed { .. } => {
                None
            }
        }
    }
}

/// A command from a projection to its reader, scoped by subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderCommand {
    /// Start delivering events after `from`.
    Subscribe {
        /// Id to stamp on every message of the new subscription.
        subscription_id: Uuid,
        /// Tag to start after.
        from: CheckpointTag,
    },
    /// Stop delivering until resumed.
    Pause {
        /// Affected subscription.
        subscription_id: Uuid,
    },
    /// Continue delivering after a pause.
    Resume {
        /// Affected subscription.
        subscription_id: Uuid,
    },
    /// Stop delivering for good.
    Unsubscribe {
        /// Affected subscription.
        subscription_id: Uuid,
    },
}

/// Outcome reported by a projection to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionNotification {
    /// The projection loaded its checkpoint and started reading.
    Started {
        /// Projection correlation id.
        projection_id: Uuid,
        /// Tag reading starts after.
        from: CheckpointTag,
    },
    /// A checkpoint event was durably written.
    CheckpointWritten {
        /// Projection correlation id.
        projection_id: Uuid,
        /// Tag of the checkpoint.
        tag: CheckpointTag,
    },
    /// A checkpoint completed, including all emitted events before it.
    CheckpointCompleted {
        /// Projection correlation id.
        projection_id: Uuid,
        /// Tag of the checkpoint.
        tag: CheckpointTag,
    },
    /// The projection must be restarted from its last checkpoint.
    RestartRequested {
        /// Projection correlation id.
        projection_id: Uuid,
        /// Why a restart is needed.
        reason: String,
    },
    /// The projection failed and stopped processing.
    Failed {
        /// Projection correlation id.
        projection_id: Uuid,
        /// Why the projection failed.
        reason: String,
    },
    /// The projection stopped.
    Stopped {
        /// Projection correlation id.
        projection_id: Uuid,
        /// Whether the reader had reached the end of its input.
        completed: bool,
    },
    /// A partition's state reached half of the configured size limit.
    StateSizeWarning {
        /// Projection correlation id.
        projection_id: Uuid,
        /// The partition.
        partition: String,
        /// Size of the partition state in bytes.
        size: usize,
        /// Configured limit in bytes.
        limit: usize,
    },
}
