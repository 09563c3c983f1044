use std::sync::Arc;

use crate::error::ProjectionError;
use crate::position::PositionTagger;
use crate::tag::CheckpointTag;

/// Holds the last checkpoint tag reached by one processing stream and
/// enforces that it only moves forward.
#[derive(Debug, Clone)]
pub struct PositionTracker {
    tagger: Arc<dyn PositionTagger>,
    last_tag: Option<CheckpointTag>,
}

impl PositionTracker {
    /// Create a tracker with no position for tags built by `tagger`.
    pub fn new(tagger: Arc<dyn PositionTagger>) -> Self {
        Self {
            tagger,
            last_tag: None,
        }
    }

    /// The last tag reached, if the initial position has been set.
    pub fn last_tag(&self) -> Option<&CheckpointTag> {
        self.last_tag.as_ref()
    }

    /// The tagger whose tags this tracker accepts.
    pub fn tagger(&self) -> &Arc<dyn PositionTagger> {
        &self.tagger
    }

    /// Set the starting position.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::InitialPositionAlreadySet`] if a position
    /// was already set since the last [`initialize`](Self::initialize).
    pub fn update_by_checkpoint_tag_initial(
        &mut self,
        tag: CheckpointTag,
    ) -> Result<(), ProjectionError> {
        if let Some(last) = &self.last_tag {
            return Err(ProjectionError::InitialPositionAlreadySet(last.to_string()));
        }
        self.last_tag = Some(tag);
        Ok(())
    }

    /// Advance to `tag`, which must be strictly after the current position
    /// and produced by this tracker's tagger.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::InitialPositionNotSet`] before the initial
    ///   position is set.
    /// - [`ProjectionError::IncompatibleTag`] if the tagger does not produce
    ///   tags like `tag`.
    /// - [`ProjectionError::PositionRegression`] if `tag` is not after the
    ///   current position.
    /// - [`ProjectionError::Tag`] if the tags cannot be compared.
    pub fn update_by_checkpoint_tag_forward(
        &mut self,
        tag: CheckpointTag,
    ) -> Result<(), ProjectionError> {
        let Some(last) = &self.last_tag else {
            return Err(ProjectionError::InitialPositionNotSet);
        };
        if !self.tagger.is_compatible(&tag) {
            return Err(ProjectionError::IncompatibleTag {
                tag: tag.to_string(),
                tagger: self.tagger.name(),
            });
        }
        if !tag.try_gt(last)? {
            return Err(ProjectionError::PositionRegression {
                last: last.to_string(),
                new: tag.to_string(),
            });
        }
        self.last_tag = Some(tag);
        Ok(())
    }

    /// Forget the current position.
    pub fn initialize(&mut self) {
        self.last_tag = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{MultiStreamPositionTagger, TransactionFilePositionTagger};
    use crate::tag::TfPos;

    fn tracker() -> PositionTracker {
        PositionTracker::new(Arc::new(TransactionFilePositionTagger::new(0)))
    }

    fn pos(commit: i64) -> CheckpointTag {
        CheckpointTag::from_position(0, TfPos::new(commit, commit - 1)).expect("valid tag")
    }

    #[test]
    fn initial_position_can_only_be_set_once() {
        let mut tracker = tracker();
        tracker
            .update_by_checkpoint_tag_initial(pos(10))
            .expect("first set succeeds");
        assert!(matches!(
            tracker.update_by_checkpoint_tag_initial(pos(20)),
            Err(ProjectionError::InitialPositionAlreadySet(_))
        ));
        tracker.initialize();
        assert!(tracker.last_tag().is_none());
        tracker
            .update_by_checkpoint_tag_initial(pos(20))
            .expect("set after initialize succeeds");
    }

    #[test]
    fn forward_requires_initial_position() {
        let mut tracker = tracker();
        assert!(matches!(
            tracker.update_by_checkpoint_tag_forward(pos(10)),
            Err(ProjectionError::InitialPositionNotSet)
        ));
    }

    #[test]
    fn forward_is_strictly_monotonic() {
        let mut tracker = tracker();
        tracker
            .update_by_checkpoint_tag_initial(pos(10))
            .expect("initial");
        tracker
            .update_by_checkpoint_tag_forward(pos(20))
            .expect("moves forward");
        assert_eq!(tracker.last_tag(), Some(&pos(20)));
        assert!(matches!(
            tracker.update_by_checkpoint_tag_forward(pos(20)),
            Err(ProjectionError::PositionRegression { .. })
        ));
        assert!(matches!(
            tracker.update_by_checkpoint_tag_forward(pos(15)),
            Err(ProjectionError::PositionRegression { .. })
        ));
    }

    #[test]
    fn forward_rejects_tags_from_another_tagger() {
        let mut tracker = tracker();
        tracker
            .update_by_checkpoint_tag_initial(pos(10))
            .expect("initial");
        let stream = CheckpointTag::from_stream_position(0, "s", 1).expect("valid");
        assert!(matches!(
            tracker.update_by_checkpoint_tag_forward(stream),
            Err(ProjectionError::IncompatibleTag { .. })
        ));
    }

    #[test]
    fn forward_surfaces_incomparable_multi_stream_tags() {
        let tagger = MultiStreamPositionTagger::new(0, ["s1", "s2"]).expect("valid streams");
        let mut tracker = PositionTracker::new(Arc::new(tagger));
        let a = CheckpointTag::from_stream_positions(0, [("s1".into(), 5), ("s2".into(), 3)])
            .expect("valid");
        let b = CheckpointTag::from_stream_positions(0, [("s1".into(), 3), ("s2".into(), 5)])
            .expect("valid");
        tracker.update_by_checkpoint_tag_initial(a).expect("initial");
        assert!(matches!(
            tracker.update_by_checkpoint_tag_forward(b),
            Err(ProjectionError::Tag(_))
        ));
    }
}
