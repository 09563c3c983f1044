//! Per-partition state and the cache the processing phase keeps it in.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::tag::CheckpointTag;

/// Name of the root partition.
pub const ROOT_PARTITION: &str = "";

/// Unlocked partitions kept in the cache by default.
pub const DEFAULT_MAX_CACHED_PARTITIONS: usize = 1000;

/// Serialized state and result of one partition, with the tag of the event
/// that produced them.
///
/// A partition state is replaced, never mutated, when the handler produces a
/// different state.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionState {
    state: Option<String>,
    result: Option<String>,
    caused_by: CheckpointTag,
}

#[derive(Serialize, Deserialize)]
struct StoredPartitionState {
    state: Option<String>,
    result: Option<String>,
}

impl PartitionState {
    /// Create a partition state produced by the event at `caused_by`.
    pub fn new(state: Option<String>, result: Option<String>, caused_by: CheckpointTag) -> Self {
        Self {
            state,
            result,
            caused_by,
        }
    }

    /// Serialized handler state.
    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    /// Serialized result.
    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    /// Tag of the event that produced this state.
    pub fn caused_by(&self) -> &CheckpointTag {
        &self.caused_by
    }

    /// Number of bytes the state and result occupy.
    pub fn size(&self) -> usize {
        self.state.as_ref().map_or(0, String::len) + self.result.as_ref().map_or(0, String::len)
    }

    /// Whether `other` holds the same state and result.
    pub fn same_content(&self, other: &PartitionState) -> bool {
        self.state == other.state && self.result == other.result
    }

    /// Encode state and result as `{"state": ..., "result": ...}`.
    pub fn serialize(&self) -> String {
        serde_json::json!({ "state": self.state, "result": self.result }).to_string()
    }

    /// Decode a state written by [`serialize`](Self::serialize).
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if `json` is not a serialized state.
    pub fn deserialize(json: &str, caused_by: CheckpointTag) -> serde_json::Result<Self> {
        let stored: StoredPartitionState = serde_json::from_str(json)?;
        Ok(Self::new(stored.state, stored.result, caused_by))
    }
}

#[derive(Debug)]
struct CacheEntry {
    state: PartitionState,
    locked_at: Option<CheckpointTag>,
}

/// Partition states known to the processing phase.
///
/// A *locked* entry is known not to change before its lock tag is revisited,
/// so it may be reused without reloading. Entries are unlocked once a
/// checkpoint past their lock completes; unlocked entries beyond the cache
/// capacity are evicted. The root partition is never evicted.
#[derive(Debug)]
pub struct PartitionStateCache {
    entries: HashMap<String, CacheEntry>,
    max_unlocked: usize,
}

impl Default for PartitionStateCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_CACHED_PARTITIONS)
    }
}

impl PartitionStateCache {
    /// Create a cache keeping at most `max_unlocked` unlocked partitions.
    pub fn with_capacity(max_unlocked: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_unlocked,
        }
    }

    /// Drop every entry.
    pub fn initialize(&mut self) {
        self.entries.clear();
    }

    /// Cache `state` for `partition`, locked at `at`.
    pub fn cache_and_lock(&mut self, partition: &str, state: PartitionState, at: CheckpointTag) {
        self.entries.insert(
            partition.to_owned(),
            CacheEntry {
                state,
                locked_at: Some(at),
            },
        );
    }

    /// Cache `state` for `partition` without locking it.
    pub fn cache(&mut self, partition: &str, state: PartitionState) {
        self.entries.insert(
            partition.to_owned(),
            CacheEntry {
                state,
                locked_at: None,
            },
        );
    }

    /// Look up `partition` and, if present, lock it at `lock_at`.
    pub fn try_get_and_lock(
        &mut self,
        partition: &str,
        lock_at: &CheckpointTag,
    ) -> Option<&PartitionState> {
        let entry = self.entries.get_mut(partition)?;
        entry.locked_at = Some(lock_at.clone());
        Some(&entry.state)
    }

    /// State of `partition` if it is cached and locked.
    pub fn get_locked(&self, partition: &str) -> Option<&PartitionState> {
        self.entries
            .get(partition)
            .filter(|entry| entry.locked_at.is_some())
            .map(|entry| &entry.state)
    }

    /// State of `partition` if it is cached.
    pub fn try_get(&self, partition: &str) -> Option<&PartitionState> {
        self.entries.get(partition).map(|entry| &entry.state)
    }

    /// Unlock every partition locked at or before `checkpoint` and evict
    /// unlocked partitions beyond the cache capacity.
    pub fn unlock(&mut self, checkpoint: &CheckpointTag) {
        for (partition, entry) in &mut self.entries {
            if partition == ROOT_PARTITION {
                continue;
            }
            if let Some(locked_at) = &entry.locked_at
                && matches!(locked_at.try_le(checkpoint), Ok(true))
            {
                entry.locked_at = None;
            }
        }
        let unlocked: Vec<String> = self
            .entries
            .iter()
            .filter(|(p, e)| p.as_str() != ROOT_PARTITION && e.locked_at.is_none())
            .map(|(p, _)| p.clone())
            .collect();
        let excess = unlocked.len().saturating_sub(self.max_unlocked);
        for partition in unlocked.into_iter().take(excess) {
            self.entries.remove(&partition);
        }
    }

    /// Number of cached partitions, including the root.
    pub fn cached_item_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::TfPos;

    fn tag(commit: i64) -> CheckpointTag {
        CheckpointTag::from_position(0, TfPos::new(commit, commit - 1)).expect("valid tag")
    }

    fn state(value: &str, at: i64) -> PartitionState {
        PartitionState::new(Some(value.into()), None, tag(at))
    }

    #[test]
    fn serialize_round_trip_keeps_state_and_result() {
        let original = PartitionState::new(Some(r#"{"n":1}"#.into()), Some("1".into()), tag(5));
        let decoded =
            PartitionState::deserialize(&original.serialize(), tag(5)).expect("deserializes");
        assert_eq!(decoded, original);
        assert_eq!(decoded.size(), 8);
    }

    #[test]
    fn locked_entries_survive_until_checkpoint() {
        let mut cache = PartitionStateCache::with_capacity(0);
        cache.cache_and_lock(ROOT_PARTITION, state("root", 1), tag(1));
        cache.cache_and_lock("a", state("a", 10), tag(10));
        cache.cache_and_lock("b", state("b", 30), tag(30));

        cache.unlock(&tag(20));
        assert!(cache.try_get("a").is_none(), "unlocked beyond capacity");
        assert!(cache.get_locked("b").is_some());
        assert!(cache.get_locked(ROOT_PARTITION).is_some());
        assert_eq!(cache.cached_item_count(), 2);
    }

    #[test]
    fn unlocked_entries_within_capacity_stay_cached() {
        let mut cache = PartitionStateCache::with_capacity(10);
        cache.cache_and_lock("a", state("a", 10), tag(10));
        cache.unlock(&tag(20));
        assert!(cache.get_locked("a").is_none());
        assert!(cache.try_get("a").is_some());
        assert!(cache.try_get_and_lock("a", &tag(25)).is_some());
        assert!(cache.get_locked("a").is_some());
    }

    #[test]
    fn initialize_clears() {
        let mut cache = PartitionStateCache::default();
        cache.cache("a", state("a", 1));
        cache.initialize();
        assert_eq!(cache.cached_item_count(), 0);
    }
}
