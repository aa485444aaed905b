//! Memory tier (C2): a bounded, cost-weighted store of decoded images.

use moka::sync::Cache;

use crate::codec::DecodedImage;
use crate::key::Key;

/// Bounded associative store from [`Key`] to [`DecodedImage`], evicting
/// by total cost and/or entry count.
///
/// Backed by `moka::sync::Cache`, whose weigher implements the
/// cost-based ceiling and whose built-in TinyLFU-derived eviction policy
/// stands in for spec §4.2's "implementation-defined policy biased
/// toward older/least-valuable entries" --- moka evicts the least
/// recently/frequently used entry first, which satisfies that bias
/// without this crate hand-rolling an LRU.
#[derive(Clone)]
pub struct MemoryCache {
    entries: Cache<Key, DecodedImage>,
    count_limit: u64,
}

impl MemoryCache {
    /// `max_cost` and `max_count` of `0` mean unlimited, per spec §6.
    pub fn new(max_cost: u64, max_count: u64) -> Self {
        let mut builder = Cache::builder();
        if max_cost > 0 {
            builder = builder.weigher(|_key: &Key, image: &DecodedImage| {
                image.cache_cost().min(u32::MAX as u64) as u32
            });
            builder = builder.max_capacity(max_cost);
        } else if max_count > 0 {
            builder = builder.max_capacity(max_count);
        }

        Self { entries: builder.build(), count_limit: max_count }
    }

    /// Non-blocking read; never triggers eviction or I/O.
    pub fn get(&self, key: &str) -> Option<DecodedImage> {
        self.entries.get(key)
    }

    /// Inserts `image` under `key`, costed per [`DecodedImage::cache_cost`].
    /// May evict other entries to stay within the configured ceilings.
    pub fn put(&self, key: Key, image: DecodedImage) {
        self.entries.insert(key, image);
        self.enforce_count_limit();
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Flushes the entire contents. Wired to the process memory-pressure
    /// signal (see [`crate::manager::MemoryPressureSource`]).
    pub fn remove_all(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }

    /// Approximate entry count (moka's internal counters are eventually
    /// consistent; `run_pending_tasks` forces a sync point for tests).
    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn enforce_count_limit(&self) {
        if self.count_limit == 0 {
            return;
        }
        self.entries.run_pending_tasks();
        while self.entries.entry_count() > self.count_limit {
            let Some(victim) = self.entries.iter().map(|(k, _)| k).next() else { break };
            self.entries.remove(victim.as_str());
            self.entries.run_pending_tasks();
        }
    }
}
