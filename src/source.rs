//! What a projection reads and how its state is partitioned.
//!
//! A [`SourceDefinition`] is supplied by the state handler. It selects the
//! [`PositionTagger`] the reader uses, the [`PartitionSelector`] that
//! decides which partition an event updates, and the filter deciding which
//! events reach the handler.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::event::ResolvedEvent;
use crate::position::{
    CatalogStreamPositionTagger, EventByTypeIndexPositionTagger, MultiStreamPositionTagger,
    PositionTagger, StreamPositionTagger, TransactionFilePositionTagger,
};

/// Prefix of category streams.
pub const CATEGORY_STREAM_PREFIX: &str = "$ce-";

/// Describes the input of a projection.
///
/// # Examples
///
/// ```
/// use eventfold_projections::{PartitionSelector, SourceDefinition};
///
/// let source = SourceDefinition::from_category("order")
///     .with_events(["OrderPlaced", "OrderPaid"])
///     .partitioned_by_stream();
/// assert_eq!(source.partition_selector(), PartitionSelector::ByStream);
/// assert!(source.position_tagger(0).is_ok());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDefinition {
    /// Read the whole transaction log.
    pub all_streams: bool,
    /// Named streams to read.
    pub streams: Vec<String>,
    /// Categories to read, through their category streams.
    pub categories: Vec<String>,
    /// Deliver every non-system event type.
    pub all_events: bool,
    /// Event types to deliver when `all_events` is false.
    pub events: Vec<String>,
    /// Catalog stream listing the data streams to read.
    pub catalog_stream: Option<String>,
    /// Keep one state partition per source stream.
    pub by_streams: bool,
    /// Let the handler choose the partition of each event.
    pub by_custom_partitions: bool,
    /// Keep a shared state next to the per-partition states.
    pub is_bi_state: bool,
    /// Write partition results to result streams.
    pub produces_results: bool,
    /// Deliver events read through links.
    pub include_links: bool,
}

/// Decides which state partition an event updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSelector {
    /// Every event updates the root partition.
    Root,
    /// The event's original stream names its partition.
    ByStream,
    /// The state handler names the partition.
    ByHandler,
}

impl SourceDefinition {
    /// Read every stream.
    pub fn from_all() -> Self {
        Self {
            all_streams: true,
            all_events: true,
            ..Self::default()
        }
    }

    /// Read a single stream.
    pub fn from_stream(stream: impl Into<String>) -> Self {
        Self::from_streams([stream])
    }

    /// Read several named streams.
    pub fn from_streams(streams: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            streams: streams.into_iter().map(Into::into).collect(),
            all_events: true,
            ..Self::default()
        }
    }

    /// Read every stream of one category.
    pub fn from_category(category: impl Into<String>) -> Self {
        Self {
            categories: vec![category.into()],
            all_events: true,
            ..Self::default()
        }
    }

    /// Read the data streams listed in `catalog_stream`.
    pub fn from_catalog(catalog_stream: impl Into<String>) -> Self {
        Self {
            catalog_stream: Some(catalog_stream.into()),
            all_events: true,
            ..Self::default()
        }
    }

    /// Deliver only the given event types.
    pub fn with_events(mut self, events: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.all_events = false;
        self.events = events.into_iter().map(Into::into).collect();
        self
    }

    /// Keep one state partition per source stream.
    pub fn partitioned_by_stream(mut self) -> Self {
        self.by_streams = true;
        self
    }

    /// Let the state handler choose partitions.
    pub fn partitioned_by_handler(mut self) -> Self {
        self.by_custom_partitions = true;
        self
    }

    /// Write partition results to result streams.
    pub fn with_results(mut self) -> Self {
        self.produces_results = true;
        self
    }

    /// Keep a shared state next to the partition states.
    pub fn with_shared_state(mut self) -> Self {
        self.is_bi_state = true;
        self
    }

    /// Deliver events read through links.
    pub fn including_links(mut self) -> Self {
        self.include_links = true;
        self
    }

    /// Whether state is kept in partitions other than the root.
    pub fn is_partitioned(&self) -> bool {
        self.by_streams || self.by_custom_partitions
    }

    /// Tagger for the reading strategy this definition selects.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSource`] if the definition names no
    /// input, or combines a catalog with other inputs.
    pub fn position_tagger(&self, phase: i32) -> Result<Arc<dyn PositionTagger>, ConfigError> {
        let named: Vec<String> = self
            .streams
            .iter()
            .cloned()
            .chain(
                self.categories
                    .iter()
                    .map(|c| format!("{CATEGORY_STREAM_PREFIX}{c}")),
            )
            .collect();

        if let Some(catalog) = &self.catalog_stream {
            if self.all_streams || !named.is_empty() {
                return Err(ConfigError::InvalidSource(
                    "a catalog source cannot be combined with other streams".into(),
                ));
            }
            return Ok(Arc::new(CatalogStreamPositionTagger::new(phase, catalog.clone())));
        }
        if self.all_streams {
            if !self.all_events && !self.events.is_empty() {
                return Ok(Arc::new(EventByTypeIndexPositionTagger::new(
                    phase,
                    self.events.iter().cloned(),
                )));
            }
            return Ok(Arc::new(TransactionFilePositionTagger::new(phase)));
        }
        match named.as_slice() {
            [] => Err(ConfigError::InvalidSource(
                "the source selects no streams".into(),
            )),
            [single] => Ok(Arc::new(StreamPositionTagger::new(phase, single.clone()))),
            _ => MultiStreamPositionTagger::new(phase, named)
                .map(|tagger| Arc::new(tagger) as Arc<dyn PositionTagger>)
                .map_err(|e| ConfigError::InvalidSource(e.to_string())),
        }
    }

    /// Partition selection strategy.
    pub fn partition_selector(&self) -> PartitionSelector {
        if self.by_custom_partitions {
            PartitionSelector::ByHandler
        } else if self.by_streams {
            PartitionSelector::ByStream
        } else {
            PartitionSelector::Root
        }
    }

    /// Whether `event` should reach the state handler.
    ///
    /// System event types (starting with `$`) pass only when named
    /// explicitly; links pass only with `include_links`.
    pub fn passes(&self, event: &ResolvedEvent) -> bool {
        if event.is_link() && !self.include_links && !self.reads_through_links() {
            return false;
        }
        if self.events.iter().any(|e| *e == event.event_type) {
            return true;
        }
        self.all_events && !event.event_type.starts_with('$')
    }

    // Category and event-type index reads deliver link targets as ordinary
    // events.
    fn reads_through_links(&self) -> bool {
        !self.categories.is_empty()
            || (self.all_streams && !self.all_events && !self.events.is_empty())
            || self.catalog_stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{TagMode, TfPos};

    fn event(stream: &str, event_type: &str) -> ResolvedEvent {
        ResolvedEvent::new(stream, 0, TfPos::new(10, 5), event_type, "{}")
    }

    #[test]
    fn tagger_selection() {
        let cases = [
            (SourceDefinition::from_all(), TagMode::Position),
            (
                SourceDefinition::from_all().with_events(["A"]),
                TagMode::EventTypeIndex,
            ),
            (SourceDefinition::from_stream("s"), TagMode::Stream),
            (
                SourceDefinition::from_streams(["s1", "s2"]),
                TagMode::MultiStream,
            ),
            (SourceDefinition::from_category("order"), TagMode::Stream),
            (SourceDefinition::from_catalog("cat"), TagMode::ByStream),
        ];
        for (source, mode) in cases {
            let tagger = source.position_tagger(0).expect("valid source");
            assert_eq!(tagger.make_zero_checkpoint_tag().mode(), mode, "{source:?}");
        }
    }

    #[test]
    fn category_reads_category_stream() {
        let tagger = SourceDefinition::from_category("order")
            .position_tagger(0)
            .expect("valid source");
        assert_eq!(
            tagger.make_zero_checkpoint_tag().stream_position("$ce-order"),
            Some(-1)
        );
    }

    #[test]
    fn empty_source_is_rejected() {
        assert!(matches!(
            SourceDefinition::default().position_tagger(0),
            Err(ConfigError::InvalidSource(_))
        ));
    }

    #[test]
    fn partition_selector() {
        assert_eq!(
            SourceDefinition::from_all().partition_selector(),
            PartitionSelector::Root
        );
        assert_eq!(
            SourceDefinition::from_all()
                .partitioned_by_stream()
                .partition_selector(),
            PartitionSelector::ByStream
        );
        assert_eq!(
            SourceDefinition::from_all()
                .partitioned_by_handler()
                .partition_selector(),
            PartitionSelector::ByHandler
        );
    }

    #[test]
    fn filter_by_event_type() {
        let source = SourceDefinition::from_all().with_events(["Placed"]);
        assert!(source.passes(&event("order-1", "Placed")));
        assert!(!source.passes(&event("order-1", "Paid")));
    }

    #[test]
    fn system_events_need_explicit_listing() {
        let all = SourceDefinition::from_all();
        assert!(all.passes(&event("order-1", "Placed")));
        assert!(!all.passes(&event("order-1", "$metadata")));
        let listed = SourceDefinition::from_all().with_events(["$metadata"]);
        assert!(listed.passes(&event("order-1", "$metadata")));
    }

    #[test]
    fn links_are_filtered_unless_included() {
        let linked = event("order-1", "Placed").via_link("mirror", 3);
        assert!(!SourceDefinition::from_all().passes(&linked));
        assert!(
            SourceDefinition::from_all()
                .including_links()
                .passes(&linked)
        );
        assert!(SourceDefinition::from_category("order").passes(&linked));
    }
}
