use std::collections::VecDeque;

use crate::error::ProjectionError;
use crate::tag::CheckpointTag;

/// FIFO of pending work that rejects items positioned before the last
/// queued item.
///
/// Items that carry no tag (progress updates) are always accepted. Items
/// enqueued with `allow_current` may share the tag of the item before them;
/// others must be strictly after it.
#[derive(Debug)]
pub struct WorkQueue<T> {
    items: VecDeque<T>,
    last_tag: Option<CheckpointTag>,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
            last_tag: None,
        }
    }
}

impl<T> WorkQueue<T> {
    /// Drop every item and restart ordering after `from`.
    pub fn initialize(&mut self, from: Option<CheckpointTag>) {
        self.items.clear();
        self.last_tag = from;
    }

    /// Append `item` positioned at `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::InvalidOrder`] if `tag` is before the last
    /// queued tag (or equal to it without `allow_current`), or a tag error
    /// if the tags cannot be compared.
    pub fn enqueue(
        &mut self,
        item: T,
        tag: Option<&CheckpointTag>,
        allow_current: bool,
    ) -> Result<(), ProjectionError> {
        if let Some(tag) = tag {
            if let Some(last) = &self.last_tag {
                let in_order = if allow_current {
                    tag.try_ge(last)?
                } else {
                    tag.try_gt(last)?
                };
                if !in_order {
                    return Err(ProjectionError::InvalidOrder {
                        last: last.to_string(),
                        current: tag.to_string(),
                    });
                }
            }
            self.last_tag = Some(tag.clone());
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Remove the oldest item.
    pub fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Put back an item taken with [`pop_front`](Self::pop_front) that could
    /// not be completed yet.
    pub fn push_front(&mut self, item: T) {
        self.items.push_front(item);
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Tag of the last item accepted.
    pub fn last_tag(&self) -> Option<&CheckpointTag> {
        self.last_tag.as_ref()
    }
}
