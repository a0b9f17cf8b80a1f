use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::core::now_millis;

/// L1: process-local LRU cache holding decoded values for hot keys.
///
/// Every mutation bumps a generation counter so a reader that fetched from L2
/// can detect that a concurrent write or invalidation happened before it
/// populates L1.
#[derive(Clone)]
pub struct L1Cache {
    inner: Arc<RwLock<LruState>>,
}

struct LruState {
    data: HashMap<String, L1Entry>,
    /// Access stamp to key, oldest first
    lru_order: BTreeMap<u64, String>,
    next_stamp: u64,
    max_entries: usize,
    generation: u64,
    stats: L1Stats,
}

#[derive(Clone)]
struct L1Entry {
    value: Vec<u8>,
    expires_at_ms: Option<u64>,
    last_accessed_ms: u64,
    /// Position in `lru_order`
    stamp: u64,
}

/// L1 statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct L1Stats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub capacity: usize,
    pub total_bytes: usize,
}

impl L1Stats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl LruState {
    fn stamp(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }

    /// Move `key` to the most recently used end
    fn touch(&mut self, key: &str) {
        let stamp = self.stamp();
        let Some(entry) = self.data.get_mut(key) else {
            return;
        };
        let previous = std::mem::replace(&mut entry.stamp, stamp);
        if let Some(owned) = self.lru_order.remove(&previous) {
            self.lru_order.insert(stamp, owned);
        }
    }

    fn remove(&mut self, key: &str) -> Option<L1Entry> {
        let removed = self.data.remove(key)?;
        self.lru_order.remove(&removed.stamp);
        self.stats.total_bytes = self.stats.total_bytes.saturating_sub(removed.value.len());
        self.stats.entries = self.data.len();
        Some(removed)
    }

    fn insert(&mut self, key: String, value: Vec<u8>, expires_at_ms: Option<u64>) {
        if let Some(old) = self.data.get(&key) {
            self.stats.total_bytes = self.stats.total_bytes.saturating_sub(old.value.len());
            let stamp = old.stamp;
            self.lru_order.remove(&stamp);
        }

        // Evict if at capacity
        while !self.data.contains_key(&key) && self.data.len() >= self.max_entries {
            let Some((_, evict_key)) = self.lru_order.pop_first() else {
                break;
            };
            if let Some(evicted) = self.data.remove(&evict_key) {
                self.stats.evictions += 1;
                self.stats.total_bytes = self.stats.total_bytes.saturating_sub(evicted.value.len());
                debug!("L1 EVICT: {}", evict_key);
            }
        }

        self.stats.total_bytes += value.len();
        let stamp = self.stamp();
        self.lru_order.insert(stamp, key.clone());
        self.data.insert(
            key,
            L1Entry {
                value,
                expires_at_ms,
                last_accessed_ms: now_millis(),
                stamp,
            },
        );
        self.stats.entries = self.data.len();
    }
}

impl L1Cache {
    /// Create a new L1 cache bounded by entry count
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            inner: Arc::new(RwLock::new(LruState {
                data: HashMap::new(),
                lru_order: BTreeMap::new(),
                next_stamp: 0,
                max_entries,
                generation: 0,
                stats: L1Stats {
                    capacity: max_entries,
                    ..Default::default()
                },
            })),
        }
    }

    /// Get value from L1
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut l1 = self.inner.write();
        let now = now_millis();

        let expired = match l1.data.get(key) {
            None => {
                l1.stats.misses += 1;
                return None;
            }
            Some(entry) => entry.expires_at_ms.is_some_and(|at| at <= now),
        };

        if expired {
            l1.remove(key);
            l1.stats.expirations += 1;
            l1.stats.misses += 1;
            debug!("L1 EXPIRED: {}", key);
            return None;
        }

        let value = l1.data.get_mut(key).map(|entry| {
            entry.last_accessed_ms = now;
            entry.value.clone()
        });
        l1.touch(key);
        l1.stats.hits += 1;
        value
    }

    /// Put value into L1
    pub fn put(&self, key: String, value: Vec<u8>, expires_at_ms: Option<u64>) {
        let mut l1 = self.inner.write();
        l1.generation += 1;
        debug!("L1 PUT: {} ({} bytes)", key, value.len());
        l1.insert(key, value, expires_at_ms);
    }

    /// Populate from L2 unless L1 was mutated since `generation` was read
    pub fn populate(
        &self,
        key: String,
        value: Vec<u8>,
        expires_at_ms: Option<u64>,
        generation: u64,
    ) -> bool {
        let mut l1 = self.inner.write();
        if l1.generation != generation {
            debug!("L1 populate skipped for {} (concurrent mutation)", key);
            return false;
        }
        l1.insert(key, value, expires_at_ms);
        true
    }

    /// Current mutation generation
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Delete value from L1
    pub fn delete(&self, key: &str) -> bool {
        let mut l1 = self.inner.write();
        l1.generation += 1;
        l1.remove(key).is_some()
    }

    /// Remove every key starting with `prefix`
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let mut l1 = self.inner.write();
        l1.generation += 1;
        let keys: Vec<String> = l1
            .data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            l1.remove(key);
        }
        keys.len()
    }

    /// Invalidate (clear) entire cache
    pub fn clear(&self) {
        let mut l1 = self.inner.write();
        l1.generation += 1;
        let count = l1.data.len();
        l1.data.clear();
        l1.lru_order.clear();
        l1.stats.entries = 0;
        l1.stats.total_bytes = 0;
        debug!("L1 CLEAR ({} entries)", count);
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut l1 = self.inner.write();
        let now = now_millis();
        let expired: Vec<String> = l1
            .data
            .iter()
            .filter(|(_, e)| e.expires_at_ms.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            l1.remove(key);
        }
        l1.stats.expirations += expired.len() as u64;
        expired.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().data.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> L1Stats {
        self.inner.read().stats.clone()
    }
}

impl Default for L1Cache {
    fn default() -> Self {
        // Default L1 cache: 10,000 entries
        Self::new(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_put_get() {
        let cache = L1Cache::new(100);

        cache.put("key1".to_string(), vec![1, 2, 3], None);

        let value = cache.get("key1").unwrap();
        assert_eq!(value, vec![1, 2, 3]);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.total_bytes, 3);
    }

    #[test]
    fn test_cache_miss() {
        let cache = L1Cache::new(100);

        assert!(cache.get("nonexistent").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_cache_lru_eviction() {
        let cache = L1Cache::new(3);

        cache.put("key1".to_string(), vec![1], None);
        cache.put("key2".to_string(), vec![2], None);
        cache.put("key3".to_string(), vec![3], None);

        // Add one more - should evict key1 (oldest)
        cache.put("key4".to_string(), vec![4], None);

        assert!(cache.get("key1").is_none(), "key1 should be evicted");
        assert!(cache.get("key2").is_some());
        assert!(cache.get("key3").is_some());
        assert!(cache.get("key4").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_cache_lru_order() {
        let cache = L1Cache::new(3);

        cache.put("key1".to_string(), vec![1], None);
        cache.put("key2".to_string(), vec![2], None);
        cache.put("key3".to_string(), vec![3], None);

        // Access key1 (moves to back)
        cache.get("key1");

        cache.put("key4".to_string(), vec![4], None);

        assert!(cache.get("key1").is_some(), "key1 was accessed");
        assert!(cache.get("key2").is_none(), "key2 should be evicted");
    }

    #[test]
    fn test_lru_order_follows_repeated_access() {
        let cache = L1Cache::new(4);
        for key in ["a", "b", "c", "d"] {
            cache.put(key.to_string(), vec![0], None);
        }

        // Touch in an order unrelated to insertion; "c" is now the oldest
        for key in ["b", "a", "d", "a", "b"] {
            assert!(cache.get(key).is_some());
        }
        cache.put("a".to_string(), vec![1], None);

        cache.put("e".to_string(), vec![5], None);
        assert!(!cache.contains("c"));
        cache.put("f".to_string(), vec![6], None);
        assert!(!cache.contains("d"));
        cache.put("g".to_string(), vec![7], None);
        assert!(!cache.contains("b"));

        assert!(cache.contains("a"));
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.stats().evictions, 3);
        assert_eq!(cache.inner.read().lru_order.len(), 4);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = L1Cache::new(2);
        cache.put("a".to_string(), vec![1], None);
        cache.put("b".to_string(), vec![2], None);
        cache.put("a".to_string(), vec![9, 9], None);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(vec![9, 9]));
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.stats().total_bytes, 3);
    }

    #[test]
    fn test_cache_ttl_expiration() {
        let cache = L1Cache::new(100);

        cache.put("expired".to_string(), vec![1, 2, 3], Some(now_millis() - 10));
        assert!(cache.get("expired").is_none());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_purge_expired() {
        let cache = L1Cache::new(100);
        cache.put("old".to_string(), vec![1], Some(now_millis() - 1));
        cache.put("fresh".to_string(), vec![2], Some(now_millis() + 60_000));
        cache.put("forever".to_string(), vec![3], None);

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_delete_prefix_and_clear() {
        let cache = L1Cache::new(100);
        cache.put("user:1".to_string(), vec![1], None);
        cache.put("user:2".to_string(), vec![2], None);
        cache.put("quiz:1".to_string(), vec![3], None);

        assert_eq!(cache.delete_prefix("user:"), 2);
        assert!(cache.contains("quiz:1"));

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_populate_skipped_after_mutation() {
        let cache = L1Cache::new(100);
        let generation = cache.generation();

        // A write lands between the L2 read and the populate
        cache.put("k".to_string(), b"new".to_vec(), None);

        assert!(!cache.populate("k".to_string(), b"stale".to_vec(), None, generation));
        assert_eq!(cache.get("k"), Some(b"new".to_vec()));

        let generation = cache.generation();
        assert!(cache.populate("j".to_string(), b"v".to_vec(), None, generation));
    }
}
