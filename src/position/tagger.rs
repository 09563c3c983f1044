use std::collections::BTreeSet;
use std::fmt;

use crate::error::TagError;
use crate::event::ResolvedEvent;
use crate::tag::{CheckpointTag, NO_STREAM, TagMode, TfPos};

/// Prefix of the per-event-type index streams.
pub(crate) const EVENT_TYPE_STREAM_PREFIX: &str = "$et-";

/// Builds checkpoint tags for one reading strategy.
///
/// Each reader strategy positions events differently (by log position, by
/// stream sequence number, through a catalog, ...). The tagger for a
/// strategy decides whether an event lies after a tag, builds the tag of an
/// event, and converts tags written under another strategy when a
/// projection resumes.
pub trait PositionTagger: Send + Sync + fmt::Debug {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Phase the tagger builds tags for.
    fn phase(&self) -> i32;

    /// Whether `event` lies after `previous`.
    ///
    /// # Errors
    ///
    /// Returns a [`TagError`] if `previous` is not a tag this tagger can
    /// reason about.
    fn is_message_after_checkpoint_tag(
        &self,
        previous: &CheckpointTag,
        event: &ResolvedEvent,
    ) -> Result<bool, TagError>;

    /// Tag of `event`, given the tag of the event before it.
    ///
    /// # Errors
    ///
    /// Returns a [`TagError`] if `previous` belongs to another phase or the
    /// event cannot be positioned by this tagger.
    fn make_checkpoint_tag(
        &self,
        previous: &CheckpointTag,
        event: &ResolvedEvent,
    ) -> Result<CheckpointTag, TagError>;

    /// Tag before any event of the phase.
    fn make_zero_checkpoint_tag(&self) -> CheckpointTag;

    /// Whether `tag` is in the mode this tagger produces.
    fn is_compatible(&self, tag: &CheckpointTag) -> bool;

    /// Convert a tag written under a possibly different strategy into this
    /// tagger's mode. Tags from earlier phases are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::PhaseAhead`] if the tag belongs to a later phase
    /// and [`TagError::UnsupportedAdjustment`] if it cannot be converted.
    fn adjust_tag(&self, tag: &CheckpointTag) -> Result<CheckpointTag, TagError>;
}

fn check_phase(phase: i32, tag: &CheckpointTag) -> Result<Option<CheckpointTag>, TagError> {
    if tag.phase() < phase {
        return Ok(Some(tag.clone()));
    }
    if tag.phase() > phase {
        return Err(TagError::PhaseAhead {
            expected: phase,
            actual: tag.phase(),
        });
    }
    Ok(None)
}

fn require_phase(phase: i32, previous: &CheckpointTag) -> Result<(), TagError> {
    if previous.phase() != phase {
        return Err(TagError::InvalidTag(format!(
            "previous tag {previous} is not in phase {phase}"
        )));
    }
    Ok(())
}

fn require_position(tag: &CheckpointTag, operation: &'static str) -> Result<TfPos, TagError> {
    match tag.mode() {
        TagMode::Position | TagMode::EventTypeIndex => tag.position().ok_or(TagError::InvalidMode {
            operation,
            mode: tag.mode(),
        }),
        mode => Err(TagError::InvalidMode { operation, mode }),
    }
}

fn unsupported(tag: &CheckpointTag, to: TagMode) -> TagError {
    TagError::UnsupportedAdjustment {
        from: tag.mode(),
        to,
    }
}

/// Positions events by their transaction log position.
#[derive(Debug, Clone)]
pub struct TransactionFilePositionTagger {
    phase: i32,
}

impl TransactionFilePositionTagger {
    /// Create a tagger for `phase`.
    pub fn new(phase: i32) -> Self {
        Self { phase }
    }
}

impl PositionTagger for TransactionFilePositionTagger {
    fn name(&self) -> &'static str {
        "transaction-file"
    }

    fn phase(&self) -> i32 {
        self.phase
    }

    fn is_message_after_checkpoint_tag(
        &self,
        previous: &CheckpointTag,
        event: &ResolvedEvent,
    ) -> Result<bool, TagError> {
        if previous.phase() < self.phase {
            return Ok(true);
        }
        Ok(event.position > require_position(previous, "is_message_after_checkpoint_tag")?)
    }

    fn make_checkpoint_tag(
        &self,
        previous: &CheckpointTag,
        event: &ResolvedEvent,
    ) -> Result<CheckpointTag, TagError> {
        require_phase(self.phase, previous)?;
        CheckpointTag::from_position(self.phase, event.position)
    }

    fn make_zero_checkpoint_tag(&self) -> CheckpointTag {
        CheckpointTag::from_position(self.phase, TfPos::ZERO)
            .unwrap_or_else(|_| CheckpointTag::from_phase(self.phase, false))
    }

    fn is_compatible(&self, tag: &CheckpointTag) -> bool {
        tag.mode() == TagMode::Position
    }

    fn adjust_tag(&self, tag: &CheckpointTag) -> Result<CheckpointTag, TagError> {
        if let Some(earlier) = check_phase(self.phase, tag)? {
            return Ok(earlier);
        }
        match tag.mode() {
            TagMode::Position => Ok(tag.clone()),
            TagMode::EventTypeIndex => {
                let position = require_position(tag, "adjust_tag")?;
                tracing::debug!(tag = %tag, "adjusting event-type-index tag to a log position");
                CheckpointTag::from_position(self.phase, position)
            }
            _ => Err(unsupported(tag, TagMode::Position)),
        }
    }
}

/// Positions events by prepare position only.
#[derive(Debug, Clone)]
pub struct PreparePositionTagger {
    phase: i32,
}

impl PreparePositionTagger {
    /// Create a tagger for `phase`.
    pub fn new(phase: i32) -> Self {
        Self { phase }
    }
}

impl PositionTagger for PreparePositionTagger {
    fn name(&self) -> &'static str {
        "prepare-position"
    }

    fn phase(&self) -> i32 {
        self.phase
    }

    fn is_message_after_checkpoint_tag(
        &self,
        previous: &CheckpointTag,
        event: &ResolvedEvent,
    ) -> Result<bool, TagError> {
        if previous.phase() < self.phase {
            return Ok(true);
        }
        let prepare = previous.prepare_position().ok_or(TagError::InvalidMode {
            operation: "is_message_after_checkpoint_tag",
            mode: previous.mode(),
        })?;
        Ok(event.position.prepare > prepare)
    }

    fn make_checkpoint_tag(
        &self,
        previous: &CheckpointTag,
        event: &ResolvedEvent,
    ) -> Result<CheckpointTag, TagError> {
        require_phase(self.phase, previous)?;
        CheckpointTag::from_prepare_position(self.phase, event.position.prepare)
    }

    fn make_zero_checkpoint_tag(&self) -> CheckpointTag {
        CheckpointTag::from_prepare_position(self.phase, -1)
            .unwrap_or_else(|_| CheckpointTag::from_phase(self.phase, false))
    }

    fn is_compatible(&self, tag: &CheckpointTag) -> bool {
        tag.mode() == TagMode::PreparePosition
    }

    fn adjust_tag(&self, tag: &CheckpointTag) -> Result<CheckpointTag, TagError> {
        if let Some(earlier) = check_phase(self.phase, tag)? {
            return Ok(earlier);
        }
        match tag.mode() {
            TagMode::PreparePosition => Ok(tag.clone()),
            TagMode::Position | TagMode::EventTypeIndex => {
                let prepare = tag
                    .prepare_position()
                    .ok_or_else(|| unsupported(tag, TagMode::PreparePosition))?;
                tracing::debug!(tag = %tag, "adjusting log position tag to a prepare position");
                CheckpointTag::from_prepare_position(self.phase, prepare)
            }
            _ => Err(unsupported(tag, TagMode::PreparePosition)),
        }
    }
}

/// Positions events by sequence number in a single stream.
#[derive(Debug, Clone)]
pub struct StreamPositionTagger {
    phase: i32,
    stream: String,
}

impl StreamPositionTagger {
    /// Create a tagger for `stream` in `phase`.
    pub fn new(phase: i32, stream: impl Into<String>) -> Self {
        Self {
            phase,
            stream: stream.into(),
        }
    }

    fn check_stream(&self, event: &ResolvedEvent) -> Result<(), TagError> {
        if event.position_stream_id != self.stream {
            return Err(TagError::DifferentStreams {
                left: self.stream.clone(),
                right: event.position_stream_id.clone(),
            });
        }
        Ok(())
    }
}

impl PositionTagger for StreamPositionTagger {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn phase(&self) -> i32 {
        self.phase
    }

    fn is_message_after_checkpoint_tag(
        &self,
        previous: &CheckpointTag,
        event: &ResolvedEvent,
    ) -> Result<bool, TagError> {
        if previous.phase() < self.phase {
            return Ok(true);
        }
        self.check_stream(event)?;
        let sequence = previous
            .stream_position(&self.stream)
            .ok_or_else(|| TagError::StreamNotFound(self.stream.clone()))?;
        Ok(event.position_sequence_number > sequence)
    }

    fn make_checkpoint_tag(
        &self,
        previous: &CheckpointTag,
        event: &ResolvedEvent,
    ) -> Result<CheckpointTag, TagError> {
        require_phase(self.phase, previous)?;
        self.check_stream(event)?;
        CheckpointTag::from_stream_position(
            self.phase,
            self.stream.clone(),
            event.position_sequence_number,
        )
    }

    fn make_zero_checkpoint_tag(&self) -> CheckpointTag {
        CheckpointTag::from_stream_position(self.phase, self.stream.clone(), NO_STREAM)
            .unwrap_or_else(|_| CheckpointTag::from_phase(self.phase, false))
    }

    fn is_compatible(&self, tag: &CheckpointTag) -> bool {
        tag.mode() == TagMode::Stream && tag.stream_position(&self.stream).is_some()
    }

    fn adjust_tag(&self, tag: &CheckpointTag) -> Result<CheckpointTag, TagError> {
        if let Some(earlier) = check_phase(self.phase, tag)? {
            return Ok(earlier);
        }
        match tag.mode() {
            TagMode::Stream if self.is_compatible(tag) => Ok(tag.clone()),
            _ => Err(unsupported(tag, TagMode::Stream)),
        }
    }
}

/// Positions events by sequence numbers across a fixed set of streams.
#[derive(Debug, Clone)]
pub struct MultiStreamPositionTagger {
    phase: i32,
    streams: BTreeSet<String>,
}

impl MultiStreamPositionTagger {
    /// Create a tagger over `streams` in `phase`.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::InvalidTag`] if `streams` is empty.
    pub fn new(
        phase: i32,
        streams: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, TagError> {
        let streams: BTreeSet<String> = streams.into_iter().map(Into::into).collect();
        if streams.is_empty() {
            return Err(TagError::InvalidTag(
                "a multi-stream tagger needs at least one stream".into(),
            ));
        }
        Ok(Self { phase, streams })
    }

    fn tracks_same_streams(&self, tag: &CheckpointTag) -> bool {
        let streams = tag.streams();
        streams.len() == self.streams.len()
            && self.streams.iter().all(|s| streams.contains_key(s.as_str()))
    }
}

impl PositionTagger for MultiStreamPositionTagger {
    fn name(&self) -> &'static str {
        "multi-stream"
    }

    fn phase(&self) -> i32 {
        self.phase
    }

    fn is_message_after_checkpoint_tag(
        &self,
        previous: &CheckpointTag,
        event: &ResolvedEvent,
    ) -> Result<bool, TagError> {
        if previous.phase() < self.phase {
            return Ok(true);
        }
        let sequence = previous
            .stream_position(&event.position_stream_id)
            .ok_or_else(|| TagError::StreamNotFound(event.position_stream_id.clone()))?;
        Ok(event.position_sequence_number > sequence)
    }

    fn make_checkpoint_tag(
        &self,
        previous: &CheckpointTag,
        event: &ResolvedEvent,
    ) -> Result<CheckpointTag, TagError> {
        require_phase(self.phase, previous)?;
        previous.update_stream_position(&event.position_stream_id, event.position_sequence_number)
    }

    fn make_zero_checkpoint_tag(&self) -> CheckpointTag {
        CheckpointTag::from_stream_positions(
            self.phase,
            self.streams.iter().map(|s| (s.clone(), NO_STREAM)),
        )
        .unwrap_or_else(|_| CheckpointTag::from_phase(self.phase, false))
    }

    fn is_compatible(&self, tag: &CheckpointTag) -> bool {
        matches!(tag.mode(), TagMode::MultiStream | TagMode::Stream) && self.tracks_same_streams(tag)
    }

    fn adjust_tag(&self, tag: &CheckpointTag) -> Result<CheckpointTag, TagError> {
        if let Some(earlier) = check_phase(self.phase, tag)? {
            return Ok(earlier);
        }
        match tag.mode() {
            TagMode::MultiStream | TagMode::Stream => {
                if !self.tracks_same_streams(tag) {
                    tracing::debug!(tag = %tag, "adjusting multi-stream tag to a new stream set");
                }
                CheckpointTag::from_stream_positions(
                    self.phase,
                    self.streams
                        .iter()
                        .map(|s| (s.clone(), tag.stream_position(s).unwrap_or(NO_STREAM))),
                )
            }
            _ => Err(unsupported(tag, TagMode::MultiStream)),
        }
    }
}

/// Positions events read through per-event-type index streams.
///
/// Tags carry the log position plus, for each event type, the last index
/// sequence number seen, so reading can resume from the index.
#[derive(Debug, Clone)]
pub struct EventByTypeIndexPositionTagger {
    phase: i32,
    event_types: BTreeSet<String>,
}

impl EventByTypeIndexPositionTagger {
    /// Create a tagger over `event_types` in `phase`.
    pub fn new(phase: i32, event_types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            phase,
            event_types: event_types.into_iter().map(Into::into).collect(),
        }
    }

    fn index_entry<'a>(&self, event: &'a ResolvedEvent) -> Option<&'a str> {
        event
            .position_stream_id
            .strip_prefix(EVENT_TYPE_STREAM_PREFIX)
            .filter(|event_type| self.event_types.contains(*event_type))
    }
}

impl PositionTagger for EventByTypeIndexPositionTagger {
    fn name(&self) -> &'static str {
        "event-type-index"
    }

    fn phase(&self) -> i32 {
        self.phase
    }

    fn is_message_after_checkpoint_tag(
        &self,
        previous: &CheckpointTag,
        event: &ResolvedEvent,
    ) -> Result<bool, TagError> {
        if previous.phase() < self.phase {
            return Ok(true);
        }
        if previous.mode() != TagMode::EventTypeIndex {
            return Err(TagError::InvalidMode {
                operation: "is_message_after_checkpoint_tag",
                mode: previous.mode(),
            });
        }
        Ok(event.position > require_position(previous, "is_message_after_checkpoint_tag")?)
    }

    fn make_checkpoint_tag(
        &self,
        previous: &CheckpointTag,
        event: &ResolvedEvent,
    ) -> Result<CheckpointTag, TagError> {
        require_phase(self.phase, previous)?;
        let last = require_position(previous, "make_checkpoint_tag")?;
        if event.position < last {
            return Err(TagError::InvalidTag(format!(
                "event at {} is before the previous tag {previous}",
                event.position
            )));
        }
        let entry = self
            .index_entry(event)
            .map(|event_type| (event_type, event.position_sequence_number));
        previous.update_event_type_index_position(event.position, entry)
    }

    fn make_zero_checkpoint_tag(&self) -> CheckpointTag {
        CheckpointTag::from_event_type_index_positions(
            self.phase,
            TfPos::ZERO,
            self.event_types.iter().map(|t| (t.clone(), NO_STREAM)),
        )
        .unwrap_or_else(|_| CheckpointTag::from_phase(self.phase, false))
    }

    fn is_compatible(&self, tag: &CheckpointTag) -> bool {
        tag.mode() == TagMode::EventTypeIndex
    }

    fn adjust_tag(&self, tag: &CheckpointTag) -> Result<CheckpointTag, TagError> {
        if let Some(earlier) = check_phase(self.phase, tag)? {
            return Ok(earlier);
        }
        match tag.mode() {
            TagMode::EventTypeIndex | TagMode::Position => {
                let position = require_position(tag, "adjust_tag")?;
                if tag.mode() == TagMode::Position {
                    tracing::debug!(tag = %tag, "adjusting log position tag to an event-type-index tag");
                }
                CheckpointTag::from_event_type_index_positions(
                    self.phase,
                    position,
                    self.event_types
                        .iter()
                        .map(|t| (t.clone(), tag.stream_position(t).unwrap_or(NO_STREAM))),
                )
            }
            _ => Err(unsupported(tag, TagMode::EventTypeIndex)),
        }
    }
}

/// Positions events read from the data streams listed in a catalog stream.
#[derive(Debug, Clone)]
pub struct CatalogStreamPositionTagger {
    phase: i32,
    catalog_stream: String,
}

impl CatalogStreamPositionTagger {
    /// Create a tagger over `catalog_stream` in `phase`.
    pub fn new(phase: i32, catalog_stream: impl Into<String>) -> Self {
        Self {
            phase,
            catalog_stream: catalog_stream.into(),
        }
    }
}

impl PositionTagger for CatalogStreamPositionTagger {
    fn name(&self) -> &'static str {
        "catalog-stream"
    }

    fn phase(&self) -> i32 {
        self.phase
    }

    fn is_message_after_checkpoint_tag(
        &self,
        previous: &CheckpointTag,
        event: &ResolvedEvent,
    ) -> Result<bool, TagError> {
        if previous.phase() < self.phase {
            return Ok(true);
        }
        let by = previous.by_stream().ok_or(TagError::InvalidMode {
            operation: "is_message_after_checkpoint_tag",
            mode: previous.mode(),
        })?;
        if event.position_stream_id == self.catalog_stream {
            return Ok(event.position_sequence_number > by.catalog_position);
        }
        Ok(match &by.data_stream {
            None => true,
            Some(data) if *data == event.position_stream_id => {
                event.position_sequence_number > by.data_position
            }
            Some(_) => false,
        })
    }

    fn make_checkpoint_tag(
        &self,
        previous: &CheckpointTag,
        event: &ResolvedEvent,
    ) -> Result<CheckpointTag, TagError> {
        require_phase(self.phase, previous)?;
        let by = previous.by_stream().ok_or(TagError::InvalidMode {
            operation: "make_checkpoint_tag",
            mode: previous.mode(),
        })?;
        if event.position_stream_id == self.catalog_stream {
            return CheckpointTag::from_by_stream_position(
                self.phase,
                self.catalog_stream.clone(),
                event.position_sequence_number,
                None,
                NO_STREAM,
                Some(event.position.commit),
            );
        }
        CheckpointTag::from_by_stream_position(
            self.phase,
            self.catalog_stream.clone(),
            by.catalog_position,
            Some(event.position_stream_id.clone()),
            event.position_sequence_number,
            by.commit_position,
        )
    }

    fn make_zero_checkpoint_tag(&self) -> CheckpointTag {
        CheckpointTag::from_by_stream_position(
            self.phase,
            self.catalog_stream.clone(),
            NO_STREAM,
            None,
            NO_STREAM,
            None,
        )
        .unwrap_or_else(|_| CheckpointTag::from_phase(self.phase, false))
    }

    fn is_compatible(&self, tag: &CheckpointTag) -> bool {
        tag.by_stream()
            .is_some_and(|by| by.catalog_stream == self.catalog_stream)
    }

    fn adjust_tag(&self, tag: &CheckpointTag) -> Result<CheckpointTag, TagError> {
        if let Some(earlier) = check_phase(self.phase, tag)? {
            return Ok(earlier);
        }
        if self.is_compatible(tag) {
            return Ok(tag.clone());
        }
        Err(unsupported(tag, TagMode::ByStream))
    }
}

/// Tagger for phases that read no events, such as writing results after
/// the reading phase completed.
#[derive(Debug, Clone)]
pub struct PhasePositionTagger {
    phase: i32,
}

impl PhasePositionTagger {
    /// Create a tagger for `phase`.
    pub fn new(phase: i32) -> Self {
        Self { phase }
    }
}

impl PositionTagger for PhasePositionTagger {
    fn name(&self) -> &'static str {
        "phase"
    }

    fn phase(&self) -> i32 {
        self.phase
    }

    fn is_message_after_checkpoint_tag(
        &self,
        previous: &CheckpointTag,
        _event: &ResolvedEvent,
    ) -> Result<bool, TagError> {
        Err(TagError::InvalidMode {
            operation: "is_message_after_checkpoint_tag",
            mode: previous.mode(),
        })
    }

    fn make_checkpoint_tag(
        &self,
        previous: &CheckpointTag,
        _event: &ResolvedEvent,
    ) -> Result<CheckpointTag, TagError> {
        Err(TagError::InvalidMode {
            operation: "make_checkpoint_tag",
            mode: previous.mode(),
        })
    }

    fn make_zero_checkpoint_tag(&self) -> CheckpointTag {
        CheckpointTag::from_phase(self.phase, false)
    }

    fn is_compatible(&self, tag: &CheckpointTag) -> bool {
        tag.mode() == TagMode::Phase
    }

    fn adjust_tag(&self, tag: &CheckpointTag) -> Result<CheckpointTag, TagError> {
        if let Some(earlier) = check_phase(self.phase, tag)? {
            return Ok(earlier);
        }
        if self.is_compatible(tag) {
            return Ok(tag.clone());
        }
        Err(unsupported(tag, TagMode::Phase))
    }
}
