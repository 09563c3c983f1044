//! Checkpoint tags: the position a projection has reached in its input.
//!
//! A [`CheckpointTag`] is an immutable value in one of seven mutually
//! exclusive [`TagMode`]s, one per reading strategy. Tags can only be built
//! through the named factory constructors, which validate their arguments, so
//! shapes such as a multi-stream tag without streams cannot be represented.
//!
//! Comparison is fallible. Tags in the same mode compare directly; a
//! [`TagMode::Stream`] tag is upgraded to [`TagMode::MultiStream`] and a
//! [`TagMode::Position`] tag to [`TagMode::EventTypeIndex`] when compared with
//! the richer mode; every other cross-mode comparison fails with
//! [`TagError::UnsupportedComparison`]. Multi-stream tags form a partial
//! order and comparing two divergent ones fails with
//! [`TagError::IncomparableTags`].

mod json;

pub use json::{CheckpointTagVersion, PROJECTIONS_SYSTEM_VERSION, ProjectionVersion};

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TagError;

/// Sequence number meaning "the stream has no events yet".
pub const NO_STREAM: i64 = -1;

/// A position in the global transaction log.
///
/// Orders by commit position first, then by prepare position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TfPos {
    /// Commit position of the transaction containing the event.
    pub commit: i64,
    /// Prepare position of the event itself.
    pub prepare: i64,
}

impl TfPos {
    /// Position before the first event in the log.
    pub const ZERO: TfPos = TfPos {
        commit: 0,
        prepare: -1,
    };

    /// Create a log position.
    pub const fn new(commit: i64, prepare: i64) -> Self {
        Self { commit, prepare }
    }
}

impl fmt::Display for TfPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C:{}/P:{}", self.commit, self.prepare)
    }
}

/// The position encoding a [`CheckpointTag`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagMode {
    /// Before or after a whole processing phase.
    Phase,
    /// Absolute transaction log position.
    Position,
    /// Prepare position only.
    PreparePosition,
    /// Sequence number in exactly one stream.
    Stream,
    /// Sequence numbers in two or more streams.
    MultiStream,
    /// Log position plus per-event-type index hints.
    EventTypeIndex,
    /// Position in a catalog stream and in the data stream it points at.
    ByStream,
}

impl fmt::Display for TagMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TagMode::Phase => "phase",
            TagMode::Position => "position",
            TagMode::PreparePosition => "prepare-position",
            TagMode::Stream => "stream",
            TagMode::MultiStream => "multi-stream",
            TagMode::EventTypeIndex => "event-type-index",
            TagMode::ByStream => "by-stream",
        };
        f.write_str(name)
    }
}

/// Position inside a catalog stream and the data stream its current entry
/// points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByStreamPosition {
    /// The catalog stream listing data streams.
    pub catalog_stream: String,
    /// Sequence number reached in the catalog stream.
    pub catalog_position: i64,
    /// The data stream being read, if one has been reached.
    pub data_stream: Option<String>,
    /// Sequence number reached in the data stream.
    pub data_position: i64,
    /// Commit position of the catalog entry, when known.
    pub commit_position: Option<i64>,
}

#[derive(Debug, Clone)]
enum Locator {
    Phase { completed: bool },
    Position(TfPos),
    PreparePosition(i64),
    Stream { stream: String, sequence: i64 },
    MultiStream(BTreeMap<String, i64>),
    EventTypeIndex {
        position: TfPos,
        event_types: BTreeMap<String, i64>,
    },
    ByStream(ByStreamPosition),
}

/// How far a projection has progressed through its input.
///
/// See the [module documentation](self) for the comparison rules.
///
/// # Examples
///
/// ```
/// use eventfold_projections::{CheckpointTag, TfPos};
///
/// let earlier = CheckpointTag::from_position(0, TfPos::new(100, 90)).unwrap();
/// let later = CheckpointTag::from_position(0, TfPos::new(200, 190)).unwrap();
/// assert!(later.try_gt(&earlier).unwrap());
///
/// let stream = CheckpointTag::from_stream_position(0, "orders", 3).unwrap();
/// assert!(stream.try_gt(&earlier).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct CheckpointTag {
    phase: i32,
    locator: Locator,
}

fn check_sequence(name: &str, sequence: i64) -> Result<(), TagError> {
    if name.is_empty() {
        return Err(TagError::InvalidTag("stream name must not be empty".into()));
    }
    if sequence < NO_STREAM {
        return Err(TagError::InvalidTag(format!(
            "sequence number of `{name}` must be at least -1, was {sequence}"
        )));
    }
    Ok(())
}

fn check_position(position: TfPos) -> Result<(), TagError> {
    if position.commit < -1 || position.prepare < -1 {
        return Err(TagError::InvalidTag(format!(
            "log position must not be below -1, was {position}"
        )));
    }
    Ok(())
}

fn collect_positions(
    positions: impl IntoIterator<Item = (String, i64)>,
) -> Result<BTreeMap<String, i64>, TagError> {
    let mut map = BTreeMap::new();
    for (name, sequence) in positions {
        check_sequence(&name, sequence)?;
        if map.insert(name.clone(), sequence).is_some() {
            return Err(TagError::InvalidTag(format!("stream `{name}` listed twice")));
        }
    }
    Ok(map)
}

impl CheckpointTag {
    /// Tag marking the start (`completed == false`) or the end of a phase.
    pub fn from_phase(phase: i32, completed: bool) -> Self {
        Self {
            phase,
            locator: Locator::Phase { completed },
        }
    }

    /// Tag at an absolute log position.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::InvalidTag`] if either component is below `-1`.
    pub fn from_position(phase: i32, position: TfPos) -> Result<Self, TagError> {
        check_position(position)?;
        Ok(Self {
            phase,
            locator: Locator::Position(position),
        })
    }

    /// Tag at a prepare position.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::InvalidTag`] if `prepare` is below `-1`.
    pub fn from_prepare_position(phase: i32, prepare: i64) -> Result<Self, TagError> {
        if prepare < -1 {
            return Err(TagError::InvalidTag(format!(
                "prepare position must not be below -1, was {prepare}"
            )));
        }
        Ok(Self {
            phase,
            locator: Locator::PreparePosition(prepare),
        })
    }

    /// Tag at `sequence` in a single stream.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::InvalidTag`] for an empty stream name or a
    /// sequence number below `-1`.
    pub fn from_stream_position(
        phase: i32,
        stream: impl Into<String>,
        sequence: i64,
    ) -> Result<Self, TagError> {
        let stream = stream.into();
        check_sequence(&stream, sequence)?;
        Ok(Self {
            phase,
            locator: Locator::Stream { stream, sequence },
        })
    }

    /// Tag at the given positions of one or more streams.
    ///
    /// A single entry produces a [`TagMode::Stream`] tag, two or more a
    /// [`TagMode::MultiStream`] tag.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::InvalidTag`] when no positions are given, a stream
    /// is listed twice, a name is empty or a sequence number is below `-1`.
    pub fn from_stream_positions(
        phase: i32,
        positions: impl IntoIterator<Item = (String, i64)>,
    ) -> Result<Self, TagError> {
        let mut map = collect_positions(positions)?;
        let locator = if map.len() > 1 {
            Locator::MultiStream(map)
        } else if let Some((stream, sequence)) = map.pop_first() {
            Locator::Stream { stream, sequence }
        } else {
            return Err(TagError::InvalidTag(
                "a stream tag needs at least one stream".into(),
            ));
        };
        Ok(Self { phase, locator })
    }

    /// Tag at a log position with per-event-type index hints.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::InvalidTag`] for an invalid position, an empty
    /// event type or a hint below `-1`.
    pub fn from_event_type_index_positions(
        phase: i32,
        position: TfPos,
        positions: impl IntoIterator<Item = (String, i64)>,
    ) -> Result<Self, TagError> {
        check_position(position)?;
        let event_types = collect_positions(positions)?;
        Ok(Self {
            phase,
            locator: Locator::EventTypeIndex {
                position,
                event_types,
            },
        })
    }

    /// Tag inside a catalog stream and the data stream it points at.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::InvalidTag`] for an empty catalog or data stream
    /// name, or a position below `-1`.
    pub fn from_by_stream_position(
        phase: i32,
        catalog_stream: impl Into<String>,
        catalog_position: i64,
        data_stream: Option<String>,
        data_position: i64,
        commit_position: Option<i64>,
    ) -> Result<Self, TagError> {
        let catalog_stream = catalog_stream.into();
        check_sequence(&catalog_stream, catalog_position)?;
        match &data_stream {
            Some(data) => check_sequence(data, data_position)?,
            None if data_position != NO_STREAM => {
                return Err(TagError::InvalidTag(
                    "data position requires a data stream".into(),
                ));
            }
            None => {}
        }
        Ok(Self {
            phase,
            locator: Locator::ByStream(ByStreamPosition {
                catalog_stream,
                catalog_position,
                data_stream,
                data_position,
                commit_position,
            }),
        })
    }

    /// Phase the tag belongs to.
    pub fn phase(&self) -> i32 {
        self.phase
    }

    /// The tag's position encoding.
    pub fn mode(&self) -> TagMode {
        match &self.locator {
            Locator::Phase { .. } => TagMode::Phase,
            Locator::Position(_) => TagMode::Position,
            Locator::PreparePosition(_) => TagMode::PreparePosition,
            Locator::Stream { .. } => TagMode::Stream,
            Locator::MultiStream(_) => TagMode::MultiStream,
            Locator::EventTypeIndex { .. } => TagMode::EventTypeIndex,
            Locator::ByStream(_) => TagMode::ByStream,
        }
    }

    /// For phase tags, whether the phase has completed.
    pub fn completed(&self) -> Option<bool> {
        match self.locator {
            Locator::Phase { completed } => Some(completed),
            _ => None,
        }
    }

    /// Log position of [`TagMode::Position`] and [`TagMode::EventTypeIndex`]
    /// tags. Phase tags report the lowest or highest possible position.
    pub fn position(&self) -> Option<TfPos> {
        match &self.locator {
            Locator::Position(position) => Some(*position),
            Locator::EventTypeIndex { position, .. } => Some(*position),
            Locator::Phase { completed: false } => Some(TfPos::new(i64::MIN, i64::MIN)),
            Locator::Phase { completed: true } => Some(TfPos::new(i64::MAX, i64::MAX)),
            _ => None,
        }
    }

    /// Prepare position of position-based tags.
    pub fn prepare_position(&self) -> Option<i64> {
        match &self.locator {
            Locator::PreparePosition(prepare) => Some(*prepare),
            Locator::Position(position) => Some(position.prepare),
            Locator::EventTypeIndex { position, .. } => Some(position.prepare),
            _ => None,
        }
    }

    /// Per-stream (or per-event-type) positions of stream-based and
    /// event-type-index tags. Empty for other modes.
    pub fn streams(&self) -> BTreeMap<&str, i64> {
        match &self.locator {
            Locator::Stream { stream, sequence } => BTreeMap::from([(stream.as_str(), *sequence)]),
            Locator::MultiStream(streams)
            | Locator::EventTypeIndex {
                event_types: streams,
                ..
            } => streams.iter().map(|(k, v)| (k.as_str(), *v)).collect(),
            _ => BTreeMap::new(),
        }
    }

    /// Recorded position of one stream or event type.
    pub fn stream_position(&self, stream: &str) -> Option<i64> {
        match &self.locator {
            Locator::Stream {
                stream: own,
                sequence,
            } if own == stream => Some(*sequence),
            Locator::MultiStream(streams)
            | Locator::EventTypeIndex {
                event_types: streams,
                ..
            } => streams.get(stream).copied(),
            _ => None,
        }
    }

    /// Catalog and data positions of a [`TagMode::ByStream`] tag.
    pub fn by_stream(&self) -> Option<&ByStreamPosition> {
        match &self.locator {
            Locator::ByStream(position) => Some(position),
            _ => None,
        }
    }

    /// Return a new tag with `stream` raised to `max(old, sequence)`.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::StreamNotFound`] when the tag does not track
    /// `stream`, and [`TagError::InvalidMode`] for tags that are not
    /// stream-based.
    pub fn update_stream_position(&self, stream: &str, sequence: i64) -> Result<Self, TagError> {
        let locator = match &self.locator {
            Locator::Stream {
                stream: own,
                sequence: old,
            } => {
                if own != stream {
                    return Err(TagError::StreamNotFound(stream.to_owned()));
                }
                Locator::Stream {
                    stream: own.clone(),
                    sequence: (*old).max(sequence),
                }
            }
            Locator::MultiStream(streams) => {
                Locator::MultiStream(raise_entry(streams, stream, sequence)?)
            }
            _ => {
                return Err(TagError::InvalidMode {
                    operation: "update_stream_position",
                    mode: self.mode(),
                });
            }
        };
        Ok(Self {
            phase: self.phase,
            locator,
        })
    }

    /// Return a new event-type-index tag at `position`, optionally raising
    /// the hint for one event type to `max(old, sequence)`.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::StreamNotFound`] when the event type is not
    /// tracked, and [`TagError::InvalidMode`] for other modes.
    pub fn update_event_type_index_position(
        &self,
        position: TfPos,
        event_type: Option<(&str, i64)>,
    ) -> Result<Self, TagError> {
        let Locator::EventTypeIndex { event_types, .. } = &self.locator else {
            return Err(TagError::InvalidMode {
                operation: "update_event_type_index_position",
                mode: self.mode(),
            });
        };
        check_position(position)?;
        let event_types = match event_type {
            Some((name, sequence)) => raise_entry(event_types, name, sequence)?,
            None => event_types.clone(),
        };
        Ok(Self {
            phase: self.phase,
            locator: Locator::EventTypeIndex {
                position,
                event_types,
            },
        })
    }

    /// `self > other`.
    ///
    /// # Errors
    ///
    /// Returns the comparison error described on [`try_cmp`](Self::try_cmp).
    pub fn try_gt(&self, other: &Self) -> Result<bool, TagError> {
        Ok(self.try_cmp(other)? == Ordering::Greater)
    }

    /// `self >= other`.
    ///
    /// # Errors
    ///
    /// Returns the comparison error described on [`try_cmp`](Self::try_cmp).
    pub fn try_ge(&self, other: &Self) -> Result<bool, TagError> {
        Ok(self.try_cmp(other)? != Ordering::Less)
    }

    /// `self < other`.
    ///
    /// # Errors
    ///
    /// Returns the comparison error described on [`try_cmp`](Self::try_cmp).
    pub fn try_lt(&self, other: &Self) -> Result<bool, TagError> {
        Ok(self.try_cmp(other)? == Ordering::Less)
    }

    /// `self <= other`.
    ///
    /// # Errors
    ///
    /// Returns the comparison error described on [`try_cmp`](Self::try_cmp).
    pub fn try_le(&self, other: &Self) -> Result<bool, TagError> {
        Ok(self.try_cmp(other)? != Ordering::Greater)
    }

    /// Compare two tags.
    ///
    /// Tags in different phases order by phase alone. Within a phase the
    /// narrower of two compatible modes is upgraded first.
    ///
    /// # Errors
    ///
    /// - [`TagError::UnsupportedComparison`] for incompatible modes.
    /// - [`TagError::IncompatibleCatalog`] for by-stream tags over different
    ///   catalogs.
    /// - [`TagError::DifferentStreams`] for single-stream tags on different
    ///   streams.
    /// - [`TagError::IncomparableTags`] when neither multi-stream tag
    ///   dominates the other.
    pub fn try_cmp(&self, other: &Self) -> Result<Ordering, TagError> {
        if self.phase == other.phase && self.mode() != other.mode() {
            tracing::warn!(
                left = %self,
                right = %other,
                "comparing checkpoint tags produced by different reader strategies"
            );
        }
        self.compare(other)
    }

    fn compare(&self, other: &Self) -> Result<Ordering, TagError> {
        if self.phase != other.phase {
            return Ok(self.phase.cmp(&other.phase));
        }
        match (&self.locator, &other.locator) {
            (Locator::Phase { completed: a }, Locator::Phase { completed: b }) => Ok(a.cmp(b)),
            (Locator::Position(a), Locator::Position(b))
            | (Locator::Position(a), Locator::EventTypeIndex { position: b, .. })
            | (Locator::EventTypeIndex { position: a, .. }, Locator::Position(b))
            | (
                Locator::EventTypeIndex { position: a, .. },
                Locator::EventTypeIndex { position: b, .. },
            ) => Ok(a.cmp(b)),
            (Locator::PreparePosition(a), Locator::PreparePosition(b)) => Ok(a.cmp(b)),
            (
                Locator::Stream {
                    stream: a,
                    sequence: x,
                },
                Locator::Stream {
                    stream: b,
                    sequence: y,
                },
            ) => {
                if a != b {
                    return Err(TagError::DifferentStreams {
                        left: a.clone(),
                        right: b.clone(),
                    });
                }
                Ok(x.cmp(y))
            }
            (
                Locator::Stream { .. } | Locator::MultiStream(_),
                Locator::Stream { .. } | Locator::MultiStream(_),
            ) => self.compare_streams(other),
            (Locator::ByStream(a), Locator::ByStream(b)) => {
                if a.catalog_stream != b.catalog_stream {
                    return Err(TagError::IncompatibleCatalog {
                        left: a.catalog_stream.clone(),
                        right: b.catalog_stream.clone(),
                    });
                }
                Ok((a.catalog_position, a.data_position)
                    .cmp(&(b.catalog_position, b.data_position)))
            }
            _ => Err(TagError::UnsupportedComparison {
                left: self.mode(),
                right: other.mode(),
            }),
        }
    }

    fn stream_map(&self) -> Cow<'_, BTreeMap<String, i64>> {
        match &self.locator {
            Locator::Stream { stream, sequence } => {
                Cow::Owned(BTreeMap::from([(stream.clone(), *sequence)]))
            }
            Locator::MultiStream(streams) => Cow::Borrowed(streams),
            _ => Cow::Owned(BTreeMap::new()),
        }
    }

    // Partial order: a stream missing on one side counts as NO_STREAM.
    fn compare_streams(&self, other: &Self) -> Result<Ordering, TagError> {
        let left = self.stream_map();
        let right = other.stream_map();
        let ahead = |a: &BTreeMap<String, i64>, b: &BTreeMap<String, i64>| {
            a.iter()
                .any(|(stream, seq)| *seq > b.get(stream).copied().unwrap_or(NO_STREAM))
        };
        match (ahead(&left, &right), ahead(&right, &left)) {
            (true, true) => Err(TagError::IncomparableTags {
                left: self.to_string(),
                right: other.to_string(),
            }),
            (true, false) => Ok(Ordering::Greater),
            (false, true) => Ok(Ordering::Less),
            (false, false) => Ok(Ordering::Equal),
        }
    }
}

fn raise_entry(
    entries: &BTreeMap<String, i64>,
    key: &str,
    sequence: i64,
) -> Result<BTreeMap<String, i64>, TagError> {
    let Some(old) = entries.get(key) else {
        return Err(TagError::StreamNotFound(key.to_owned()));
    };
    let mut updated = entries.clone();
    updated.insert(key.to_owned(), (*old).max(sequence));
    Ok(updated)
}

/// Equal when the tags compare equal. Tags that cannot be compared are never
/// equal; event-type-index hints are ignored.
impl PartialEq for CheckpointTag {
    fn eq(&self, other: &Self) -> bool {
        matches!(self.compare(other), Ok(Ordering::Equal))
    }
}

impl Eq for CheckpointTag {}

impl fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.phase != 0 {
            write!(f, "[phase {}] ", self.phase)?;
        }
        let join = |entries: &BTreeMap<String, i64>| {
            entries
                .iter()
                .map(|(k, v)| format!("{k}: {v}"))
                .collect::<Vec<_>>()
                .join("; ")
        };
        match &self.locator {
            Locator::Phase { completed: true } => f.write_str("phase completed"),
            Locator::Phase { completed: false } => f.write_str("phase start"),
            Locator::Position(position) => write!(f, "{position}"),
            Locator::PreparePosition(prepare) => write!(f, "P:{prepare}"),
            Locator::Stream { stream, sequence } => write!(f, "{stream}: {sequence}"),
            Locator::MultiStream(streams) => f.write_str(&join(streams)),
            Locator::EventTypeIndex {
                position,
                event_types,
            } if event_types.is_empty() => write!(f, "{position}"),
            Locator::EventTypeIndex {
                position,
                event_types,
            } => write!(f, "{position}; {}", join(event_types)),
            Locator::ByStream(by) => {
                write!(f, "{}: {}", by.catalog_stream, by.catalog_position)?;
                if let Some(data) = &by.data_stream {
                    write!(f, "; {data}: {}", by.data_position)?;
                }
                Ok(())
            }
        }
    }
}
