//! Seen-message set used to stop re-flooding in meshes with cycles.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::protocol::MessageId;

/// Default number of message ids remembered before the oldest are evicted.
pub const DEFAULT_SEEN_CAPACITY: usize = 65_536;

/// Message ids already delivered or forwarded, keyed strictly by id.
///
/// Bounded: once `capacity` ids are held, inserting evicts the oldest. Lookups never refresh
/// an entry, so eviction is in insertion order. A capacity of 0 disables eviction.
#[derive(Debug)]
pub struct SeenSet {
    ids: LruCache<MessageId, ()>,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        let ids = match NonZeroUsize::new(capacity) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self { ids }
    }

    /// Mark `id` seen. Returns `true` if it was not seen before.
    pub fn insert(&mut self, id: &MessageId) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        self.ids.put(id.clone(), ());
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_CAPACITY)
    }
}
