//! Turns the raw events of a reader into sequenced subscription messages.

use std::sync::Arc;

use uuid::Uuid;

use crate::config::ProjectionConfig;
use crate::error::ProjectionError;
use crate::event::ResolvedEvent;
use crate::messages::{SubscriptionMessage, SubscriptionPayload};
use crate::position::{PositionTagger, PositionTracker};
use crate::source::SourceDefinition;
use crate::tag::CheckpointTag;

/// Event type marking the deletion of a stream.
pub const STREAM_DELETED_EVENT_TYPE: &str = "$streamDeleted";

/// One subscription of a projection to its reader.
///
/// Events at or before the last position are skipped. Every other event
/// advances the subscription's position; events that pass the source
/// filter are delivered, the rest only count towards the next checkpoint
/// suggestion. A checkpoint is suggested after
/// `checkpoint_handled_threshold` delivered events, or once filtered-out
/// events have moved the log position by `checkpoint_unhandled_bytes_threshold`.
///
/// # Examples
///
/// ```
/// use eventfold_projections::{
///     ProjectionConfig, ReaderSubscription, ResolvedEvent, SourceDefinition, TfPos,
/// };
/// use uuid::Uuid;
///
/// let source = SourceDefinition::from_all();
/// let tagger = source.position_tagger(0).unwrap();
/// let from = tagger.make_zero_checkpoint_tag();
/// let mut subscription = ReaderSubscription::new(
///     Uuid::new_v4(),
///     from,
///     source,
///     tagger,
///     &ProjectionConfig::default(),
/// )
/// .unwrap();
///
/// let started = subscription.started();
/// assert_eq!(started.sequence_number, 0);
/// let event = ResolvedEvent::new("order-1", 0, TfPos::new(100, 90), "OrderPlaced", "{}");
/// let messages = subscription.handle_event(event, 10.0).unwrap();
/// assert_eq!(messages[0].sequence_number, 1);
/// ```
#[derive(Debug)]
pub struct ReaderSubscription {
    subscription_id: Uuid,
    source: SourceDefinition,
    tracker: PositionTracker,
    handled_threshold: usize,
    unhandled_bytes_threshold: i64,
    next_sequence: i64,
    handled_since_suggestion: usize,
    suggested_at_prepare: Option<i64>,
}

impl ReaderSubscription {
    /// Create a subscription delivering events after `from`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::IncompatibleTag`] if `from` is not a tag
    /// `tagger` produces.
    pub fn new(
        subscription_id: Uuid,
        from: CheckpointTag,
        source: SourceDefinition,
        tagger: Arc<dyn PositionTagger>,
        config: &ProjectionConfig,
    ) -> Result<Self, ProjectionError> {
        if !tagger.is_compatible(&from) {
            return Err(ProjectionError::IncompatibleTag {
                tag: from.to_string(),
                tagger: tagger.name(),
            });
        }
        let mut tracker = PositionTracker::new(tagger);
        tracker.update_by_checkpoint_tag_initial(from)?;
        Ok(Self {
            subscription_id,
            source,
            tracker,
            handled_threshold: config.checkpoint_handled_threshold,
            unhandled_bytes_threshold: config.checkpoint_unhandled_bytes_threshold,
            next_sequence: 0,
            handled_since_suggestion: 0,
            suggested_at_prepare: None,
        })
    }

    /// Id stamped on every message.
    pub fn subscription_id(&self) -> Uuid {
        self.subscription_id
    }

    /// Tag of the last event seen.
    pub fn last_tag(&self) -> Option<&CheckpointTag> {
        self.tracker.last_tag()
    }

    /// The first message of the subscription.
    pub fn started(&mut self) -> SubscriptionMessage {
        let starting_tag = self
            .tracker
            .last_tag()
            .cloned()
            .unwrap_or_else(|| self.tracker.tagger().make_zero_checkpoint_tag());
        self.message(SubscriptionPayload::Started { starting_tag })
    }

    /// Messages for one event read by the reader; empty if the event is not
    /// after the current position.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be positioned by the
    /// subscription's tagger.
    pub fn handle_event(
        &mut self,
        event: ResolvedEvent,
        progress: f32,
    ) -> Result<Vec<SubscriptionMessage>, ProjectionError> {
        let last = self
            .tracker
            .last_tag()
            .ok_or(ProjectionError::InitialPositionNotSet)?;
        let tagger = Arc::clone(self.tracker.tagger());
        if !tagger.is_message_after_checkpoint_tag(last, &event)? {
            return Ok(Vec::new());
        }
        let tag = tagger.make_checkpoint_tag(last, &event)?;
        self.tracker.update_by_checkpoint_tag_forward(tag.clone())?;

        let prepare = event.position.prepare;
        let mut messages = Vec::new();
        if event.event_type == STREAM_DELETED_EVENT_TYPE {
            if self.source.by_streams {
                messages.push(self.message(SubscriptionPayload::PartitionDeleted {
                    partition: event.event_stream_id.clone(),
                    tag: tag.clone(),
                }));
            }
        } else if self.source.passes(&event) {
            messages.push(self.message(SubscriptionPayload::CommittedEvent {
                tag: tag.clone(),
                event: Box::new(event),
                progress,
            }));
            self.handled_since_suggestion += 1;
            if self.handled_since_suggestion >= self.handled_threshold {
                messages.push(self.suggest(tag, prepare, progress));
            }
            return Ok(messages);
        }

        let base = *self.suggested_at_prepare.get_or_insert(prepare);
        if prepare - base >= self.unhandled_bytes_threshold {
            messages.push(self.suggest(tag, prepare, progress));
        }
        Ok(messages)
    }

    /// Report reader progress without new events.
    pub fn progress_changed(&mut self, progress: f32) -> SubscriptionMessage {
        self.message(SubscriptionPayload::ProgressChanged { progress })
    }

    /// Report the end of the reader's input, positioned at the last event
    /// seen.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::InitialPositionNotSet`] if the
    /// subscription has no position.
    pub fn eof_reached(&mut self) -> Result<SubscriptionMessage, ProjectionError> {
        let tag = self
            .tracker
            .last_tag()
            .cloned()
            .ok_or(ProjectionError::InitialPositionNotSet)?;
        Ok(self.message(SubscriptionPayload::EofReached { tag }))
    }

    /// Report a reader failure.
    pub fn failed(&mut self, reason: impl Into<String>) -> SubscriptionMessage {
        self.message(SubscriptionPayload::Failed {
            reason: reason.into(),
        })
    }

    fn suggest(&mut self, tag: CheckpointTag, prepare: i64, progress: f32) -> SubscriptionMessage {
        self.handled_since_suggestion = 0;
        self.suggested_at_prepare = Some(prepare);
        self.message(SubscriptionPayload::CheckpointSuggested { tag, progress })
    }

    fn message(&mut self, payload: SubscriptionPayload) -> SubscriptionMessage {
        let sequence_number = self.next_sequence;
        self.next_sequence += 1;
        SubscriptionMessage {
            subscription_id: self.subscription_id,
            sequence_number,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::TfPos;

    fn subscription(source: SourceDefinition, config: ProjectionConfig) -> ReaderSubscription {
        let tagger = source.position_tagger(0).expect("valid source");
        let from = tagger.make_zero_checkpoint_tag();
        ReaderSubscription::new(Uuid::new_v4(), from, source, tagger, &config)
            .expect("compatible tag")
    }

    fn event(commit: i64, stream: &str, event_type: &str) -> ResolvedEvent {
        ResolvedEvent::new(stream, 0, TfPos::new(commit, commit), event_type, "{}")
    }

    fn kinds(messages: &[SubscriptionMessage]) -> Vec<&'static str> {
        messages
            .iter()
            .map(|m| match m.payload {
                SubscriptionPayload::Started { .. } => "started",
                SubscriptionPayload::CommittedEvent { .. } => "event",
                SubscriptionPayload::CheckpointSuggested { .. } => "checkpoint",
                SubscriptionPayload::ProgressChanged { .. } => "progress",
                SubscriptionPayload::EofReached { .. } => "eof",
                SubscriptionPayload::PartitionDeleted { .. } => "deleted",
                SubscriptionPayload::Failed { .. } => "failed",
            })
            .collect()
    }

    #[test]
    fn messages_are_sequenced_from_zero() {
        let mut sub = subscription(SourceDefinition::from_all(), ProjectionConfig::default());
        let mut messages = vec![sub.started()];
        messages.extend(sub.handle_event(event(10, "s", "A"), 1.0).expect("tagged"));
        messages.push(sub.progress_changed(2.0));
        messages.push(sub.eof_reached().expect("positioned"));
        let sequence: Vec<i64> = messages.iter().map(|m| m.sequence_number).collect();
        assert_eq!(sequence, [0, 1, 2, 3]);
        assert_eq!(kinds(&messages), ["started", "event", "progress", "eof"]);
        assert_eq!(messages[3].tag(), messages[1].tag());
    }

    #[test]
    fn events_not_after_the_position_are_skipped() {
        let mut sub = subscription(SourceDefinition::from_all(), ProjectionConfig::default());
        sub.handle_event(event(10, "s", "A"), 0.0).expect("tagged");
        assert!(sub.handle_event(event(10, "s", "A"), 0.0).expect("tagged").is_empty());
        assert!(sub.handle_event(event(5, "s", "A"), 0.0).expect("tagged").is_empty());
    }

    #[test]
    fn checkpoint_is_suggested_after_handled_threshold() {
        let config = ProjectionConfig {
            checkpoint_handled_threshold: 2,
            ..ProjectionConfig::default()
        };
        let mut sub = subscription(SourceDefinition::from_all(), config);
        let first = sub.handle_event(event(10, "s", "A"), 0.0).expect("tagged");
        let second = sub.handle_event(event(20, "s", "A"), 0.0).expect("tagged");
        assert_eq!(kinds(&first), ["event"]);
        assert_eq!(kinds(&second), ["event", "checkpoint"]);
        assert_eq!(second[1].tag(), second[0].tag());
    }

    #[test]
    fn filtered_events_suggest_after_unhandled_bytes() {
        let config = ProjectionConfig {
            checkpoint_unhandled_bytes_threshold: 100,
            ..ProjectionConfig::default()
        };
        let mut sub = subscription(SourceDefinition::from_all(), config);
        assert!(sub.handle_event(event(10, "s", "$stats"), 0.0).expect("tagged").is_empty());
        assert!(sub.handle_event(event(60, "s", "$stats"), 0.0).expect("tagged").is_empty());
        let messages = sub.handle_event(event(110, "s", "$stats"), 0.0).expect("tagged");
        assert_eq!(kinds(&messages), ["checkpoint"]);
    }

    #[test]
    fn stream_deletion_deletes_the_partition() {
        let source = SourceDefinition::from_all().partitioned_by_stream();
        let mut sub = subscription(source, ProjectionConfig::default());
        let messages = sub
            .handle_event(event(10, "order-1", STREAM_DELETED_EVENT_TYPE), 0.0)
            .expect("tagged");
        assert!(matches!(
            &messages[0].payload,
            SubscriptionPayload::PartitionDeleted { partition, .. } if partition == "order-1"
        ));
    }

    #[test]
    fn incompatible_start_tag_is_rejected() {
        let source = SourceDefinition::from_stream("orders");
        let tagger = source.position_tagger(0).expect("valid source");
        let from = CheckpointTag::from_position(0, TfPos::ZERO).expect("zero");
        let err = ReaderSubscription::new(
            Uuid::new_v4(),
            from,
            source,
            tagger,
            &ProjectionConfig::default(),
        )
        .expect_err("stream tagger rejects a position tag");
        assert!(matches!(err, ProjectionError::IncompatibleTag { .. }));
    }
}
