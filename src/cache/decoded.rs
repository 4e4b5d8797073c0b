//! Decoded snapshot cache
//!
//! Keeps recently decoded snapshot trees in memory so reads do not re-parse
//! the stored artifact. Eviction is strictly first-in-first-out by insertion;
//! reads do not refresh an entry's position.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::item::Item;

/// Default number of decoded trees kept
pub const DEFAULT_CAPACITY: usize = 1000;

type Key = (String, i64);

#[derive(Default)]
struct Entries {
    trees: HashMap<Key, Arc<Item>>,
    /// Keys in insertion order, oldest first
    order: VecDeque<Key>,
}

/// Bounded FIFO map from (account, generation) to decoded tree
pub struct DecodedCache {
    capacity: usize,
    entries: Mutex<Entries>,
    /// Cache hit counter
    hits: AtomicU64,
    /// Cache miss counter
    misses: AtomicU64,
}

impl DecodedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(Entries::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        // Entries stay consistent across a panic; keep serving them
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, account: &str, generation: i64) -> Option<Arc<Item>> {
        let entries = self.lock();
        match entries.trees.get(&(account.to_string(), generation)) {
            Some(tree) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(account = account, generation = generation, "Decoded cache HIT");
                Some(Arc::clone(tree))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(account = account, generation = generation, "Decoded cache MISS");
                None
            }
        }
    }

    /// Insert a tree, evicting the earliest-inserted entries past capacity.
    ///
    /// Replacing an existing key keeps its original queue position.
    pub fn insert(&self, account: &str, generation: i64, tree: Arc<Item>) {
        let mut entries = self.lock();
        let key = (account.to_string(), generation);
        if entries.trees.insert(key.clone(), tree).is_none() {
            entries.order.push_back(key);
        }

        while entries.order.len() > self.capacity {
            if let Some(oldest) = entries.order.pop_front() {
                entries.trees.remove(&oldest);
                debug!(account = %oldest.0, generation = oldest.1, "Evicted decoded snapshot");
            }
        }
    }

    /// Returns (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl Default for DecodedCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Arc<Item> {
        Arc::new(Item::root())
    }

    #[test]
    fn test_hit_miss() {
        let cache = DecodedCache::new(10);
        assert!(cache.get("a", 1).is_none());
        cache.insert("a", 1, tree());
        assert!(cache.get("a", 1).is_some());
        assert!(cache.get("b", 1).is_none());
        assert_eq!(cache.stats(), (1, 2));
    }

    #[test]
    fn test_never_exceeds_default_bound() {
        let cache = DecodedCache::default();
        for g in 0..1001 {
            cache.insert("acct", g, tree());
        }
        assert_eq!(cache.lock().trees.len(), DEFAULT_CAPACITY);
        // The first insertion is gone, the second survives
        assert!(cache.get("acct", 0).is_none());
        assert!(cache.get("acct", 1).is_some());
        assert!(cache.get("acct", 1000).is_some());
    }

    #[test]
    fn test_eviction_ignores_reads() {
        let cache = DecodedCache::new(2);
        cache.insert("acct", 1, tree());
        cache.insert("acct", 2, tree());

        // An LRU would now evict 2; FIFO still evicts 1
        assert!(cache.get("acct", 1).is_some());
        cache.insert("acct", 3, tree());

        assert!(cache.get("acct", 1).is_none());
        assert!(cache.get("acct", 2).is_some());
        assert!(cache.get("acct", 3).is_some());
    }

    #[test]
    fn test_reinsert_keeps_position() {
        let cache = DecodedCache::new(2);
        cache.insert("acct", 1, tree());
        cache.insert("acct", 2, tree());
        cache.insert("acct", 1, tree());
        assert_eq!(cache.lock().trees.len(), 2);

        cache.insert("acct", 3, tree());
        assert!(cache.get("acct", 1).is_none());
        assert!(cache.get("acct", 2).is_some());
    }
}
