//! Cost-bounded in-memory image store.

use std::sync::Arc;

use image::DynamicImage;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::key::CacheKey;

struct MemoryEntry {
    image: Arc<DynamicImage>,
    cost: u64,
}

struct Inner {
    entries: LruCache<CacheKey, MemoryEntry>,
    total_cost: u64,
}

/// The memory tier: an approximate-LRU map with two simultaneous bounds,
/// total cost and entry count. A bound of zero means unbounded.
///
/// Eviction runs inside the insert that overflowed a bound, so reads
/// never observe the overshoot.
pub(crate) struct MemoryStore {
    inner: Mutex<Inner>,
    max_cost: u64,
    max_count: usize,
}

impl MemoryStore {
    pub(crate) fn new(max_cost: u64, max_count: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_cost: 0,
            }),
            max_cost,
            max_count,
        }
    }

    /// Inserts an entry and evicts least-recently-used entries until both
    /// bounds hold again.
    pub(crate) fn insert(&self, key: CacheKey, image: Arc<DynamicImage>, cost: u64) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.put(key, MemoryEntry { image, cost }) {
            inner.total_cost -= old.cost;
        }
        inner.total_cost += cost;

        while self.over_bounds(&inner) {
            let Some((evicted_key, evicted)) = inner.entries.pop_lru() else {
                break;
            };
            inner.total_cost -= evicted.cost;
            debug!(key = %evicted_key, cost = evicted.cost, "evicted from memory cache");
        }
    }

    fn over_bounds(&self, inner: &Inner) -> bool {
        let over_cost = self.max_cost > 0 && inner.total_cost > self.max_cost;
        let over_count = self.max_count > 0 && inner.entries.len() > self.max_count;
        (over_cost || over_count) && !inner.entries.is_empty()
    }

    /// Looks up an entry and promotes it in the recency order.
    pub(crate) fn get(&self, key: &CacheKey) -> Option<Arc<DynamicImage>> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get(key) {
            trace!(key = %key, "memory cache hit");
            Some(entry.image.clone())
        } else {
            trace!(key = %key, "memory cache miss");
            None
        }
    }

    /// Looks up an entry without touching the recency order.
    pub(crate) fn peek(&self, key: &CacheKey) -> Option<Arc<DynamicImage>> {
        self.inner.lock().entries.peek(key).map(|e| e.image.clone())
    }

    pub(crate) fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains(key)
    }

    pub(crate) fn remove(&self, key: &CacheKey) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.pop(key) {
            inner.total_cost -= entry.cost;
        }
    }

    pub(crate) fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_cost = 0;
    }

    pub(crate) fn count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub(crate) fn total_cost(&self) -> u64 {
        self.inner.lock().total_cost
    }
}
