//! Building and tracking checkpoint tags for one reading strategy.
//!
//! A [`PositionTagger`] knows how the projection's reader positions events
//! and builds [`CheckpointTag`](crate::CheckpointTag)s for them. A
//! [`PositionTracker`] holds the last tag reached and refuses to move
//! backward.

mod tagger;
mod tracker;

pub use tagger::{
    CatalogStreamPositionTagger, EventByTypeIndexPositionTagger, MultiStreamPositionTagger,
    PhasePositionTagger, PositionTagger, PreparePositionTagger, StreamPositionTagger,
    TransactionFilePositionTagger,
};
pub use tracker::PositionTracker;
