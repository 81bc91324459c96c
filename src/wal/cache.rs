//! The bounded entry-payload cache.
//!
//! Keyed by log index. LRU eviction by default; LFU is available for
//! workloads that re-read a stable hot set. Cached entries share their
//! payload buffers (`Bytes`), so a hit hands out borrowed memory without
//! copying.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::raft::Entry;

/// Eviction policy for the payload cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Evict the least recently used entry.
    Lru,
    /// Evict the least frequently used entry.
    Lfu,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        EvictionPolicy::Lru
    }
}

enum CacheInner {
    Lru(LruCache<u64, Entry>),
    Lfu(LfuCache),
}

/// A small least-frequently-used map: each hit bumps a use counter, and
/// insertion past capacity evicts the entry with the lowest counter.
struct LfuCache {
    capacity: usize,
    map: HashMap<u64, (Entry, u64)>,
}

impl LfuCache {
    fn get(&mut self, index: u64) -> Option<Entry> {
        match self.map.get_mut(&index) {
            Some((entry, uses)) => {
                *uses += 1;
                Some(entry.clone())
            }
            None => None,
        }
    }

    fn put(&mut self, index: u64, entry: Entry) {
        if self.map.len() >= self.capacity && !self.map.contains_key(&index) {
            if let Some(coldest) = self.map.iter().min_by_key(|(_, (_, uses))| *uses).map(|(k, _)| *k) {
                self.map.remove(&coldest);
            }
        }
        self.map.insert(index, (entry, 1));
    }
}

/// The bounded payload cache shared by the store's read paths.
pub(crate) struct PayloadCache {
    inner: Mutex<CacheInner>,
}

impl PayloadCache {
    pub(crate) fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        let capacity = capacity.max(1);
        let inner = match policy {
            EvictionPolicy::Lru => CacheInner::Lru(LruCache::new(NonZeroUsize::new(capacity).unwrap())),
            EvictionPolicy::Lfu => CacheInner::Lfu(LfuCache {
                capacity,
                map: HashMap::new(),
            }),
        };
        Self { inner: Mutex::new(inner) }
    }

    pub(crate) fn get(&self, index: u64) -> Option<Entry> {
        let mut inner = self.inner.lock().unwrap();
        match &mut *inner {
            CacheInner::Lru(lru) => lru.get(&index).cloned(),
            CacheInner::Lfu(lfu) => lfu.get(index),
        }
    }

    pub(crate) fn put(&self, entry: Entry) {
        let mut inner = self.inner.lock().unwrap();
        match &mut *inner {
            CacheInner::Lru(lru) => {
                lru.put(entry.log_id.index, entry);
            }
            CacheInner::Lfu(lfu) => lfu.put(entry.log_id.index, entry),
        }
    }

    /// Drop the cached entries in `[from, to]`, after a truncation.
    pub(crate) fn remove_range(&self, from: u64, to: u64) {
        let mut inner = self.inner.lock().unwrap();
        match &mut *inner {
            CacheInner::Lru(lru) => {
                for index in from..=to {
                    lru.pop(&index);
                }
            }
            CacheInner::Lfu(lfu) => {
                lfu.map.retain(|index, _| *index < from || *index > to);
            }
        }
    }

    pub(crate) fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        match &mut *inner {
            CacheInner::Lru(lru) => lru.clear(),
            CacheInner::Lfu(lfu) => lfu.map.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::raft_types::LogId;

    fn entry(index: u64) -> Entry {
        Entry::new_normal(LogId::new(1, index), None, Bytes::from(vec![index as u8; 4]))
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let cache = PayloadCache::new(2, EvictionPolicy::Lru);
        cache.put(entry(1));
        cache.put(entry(2));
        assert!(cache.get(1).is_some()); // 1 becomes most recent
        cache.put(entry(3)); // evicts 2
        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn test_lfu_evicts_least_frequently_used() {
        let cache = PayloadCache::new(2, EvictionPolicy::Lfu);
        cache.put(entry(1));
        cache.put(entry(2));
        cache.get(1);
        cache.get(1);
        cache.put(entry(3)); // 2 has the lowest use count
        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn test_remove_range() {
        let cache = PayloadCache::new(8, EvictionPolicy::Lru);
        for i in 1..=6 {
            cache.put(entry(i));
        }
        cache.remove_range(3, 5);
        assert!(cache.get(2).is_some());
        assert!(cache.get(3).is_none());
        assert!(cache.get(5).is_none());
        assert!(cache.get(6).is_some());
    }

    #[test]
    fn test_zero_copy_payload_sharing() {
        let cache = PayloadCache::new(4, EvictionPolicy::Lru);
        let original = entry(1);
        cache.put(original.clone());
        let hit = cache.get(1).unwrap();
        match (&hit.payload, &original.payload) {
            (crate::raft::EntryPayload::Normal(a), crate::raft::EntryPayload::Normal(b)) => {
                // Same backing buffer, not a copy.
                assert_eq!(a.data.as_ptr(), b.data.as_ptr());
            }
            _ => panic!("expected normal payloads"),
        }
    }
}
