//! Sharded Map Implementation
//!
//! String-keyed concurrent hashmap split into `N` independently locked shards.
//!
//! # Design
//!
//! - Each shard has its own RwLock, minimizing contention
//! - Power-of-2 shard count enables fast modulo via bitwise AND
//! - Locks are never held across an await point
//! - Each shard keeps a running weight of its values, updated only while
//!   its write lock is held, so the total never drifts or underflows

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::entry::fx_hash;

/// Weight of one value
pub type Weigher<V> = fn(&V) -> u64;

/// Single shard containing a hashmap and the summed weight of its values
pub struct Shard<V> {
    map: RwLock<HashMap<String, V>>,
    weight: AtomicU64,
}

impl<V> Default for Shard<V> {
    fn default() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            weight: AtomicU64::new(0),
        }
    }
}

impl<V: Clone> Shard<V> {
    fn get(&self, key: &str) -> Option<V> {
        self.map.read().get(key).cloned()
    }

    fn insert(&self, key: String, value: V, weigh: Weigher<V>) -> Option<V> {
        let added = weigh(&value);
        let mut guard = self.map.write();
        let old = guard.insert(key, value);
        self.weight.fetch_add(added, Ordering::Relaxed);
        if let Some(old) = &old {
            self.weight.fetch_sub(weigh(old), Ordering::Relaxed);
        }
        old
    }

    fn remove_if<F>(&self, key: &str, predicate: F, weigh: Weigher<V>) -> Option<V>
    where
        F: FnOnce(&V) -> bool,
    {
        let mut guard = self.map.write();
        let removed = match guard.get(key) {
            Some(value) if predicate(value) => guard.remove(key),
            _ => None,
        };
        if let Some(value) = &removed {
            self.weight.fetch_sub(weigh(value), Ordering::Relaxed);
        }
        removed
    }

    fn drain_where<F>(&self, predicate: &F, weigh: Weigher<V>) -> Vec<(String, V)>
    where
        F: Fn(&V) -> bool,
    {
        let mut guard = self.map.write();
        let doomed: Vec<String> = guard
            .iter()
            .filter(|(_, v)| predicate(v))
            .map(|(k, _)| k.clone())
            .collect();
        let drained: Vec<(String, V)> = doomed
            .into_iter()
            .filter_map(|k| guard.remove(&k).map(|v| (k, v)))
            .collect();
        let freed: u64 = drained.iter().map(|(_, v)| weigh(v)).sum();
        self.weight.fetch_sub(freed, Ordering::Relaxed);
        drained
    }

    fn entries(&self) -> Vec<(String, V)> {
        self.map
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.map.read().len()
    }

    fn clear(&self) {
        let mut guard = self.map.write();
        guard.clear();
        self.weight.store(0, Ordering::Relaxed);
    }
}

/// Sharded map with a compile-time shard count
pub struct ShardedMap<V, const N: usize> {
    shards: Box<[Shard<V>]>,
    weigh: Weigher<V>,
}

impl<V: Clone, const N: usize> Default for ShardedMap<V, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone, const N: usize> ShardedMap<V, N> {
    /// Create a map where every value weighs 1
    pub fn new() -> Self {
        Self::with_weigher(|_| 1)
    }

    /// Create a map that sums `weigh` over its values
    pub fn with_weigher(weigh: Weigher<V>) -> Self {
        let shards: Vec<Shard<V>> = (0..N).map(|_| Shard::default()).collect();
        Self {
            shards: shards.into_boxed_slice(),
            weigh,
        }
    }

    /// Shard index for a key
    #[inline]
    fn shard_for(&self, key: &str) -> &Shard<V> {
        &self.shards[(fx_hash(key.as_bytes()) as usize) & (N - 1)]
    }

    /// Get a value
    pub fn get(&self, key: &str) -> Option<V> {
        self.shard_for(key).get(key)
    }

    /// Check if a key exists
    pub fn contains_key(&self, key: &str) -> bool {
        self.shard_for(key).map.read().contains_key(key)
    }

    /// Insert a value, returning the replaced value
    pub fn insert(&self, key: String, value: V) -> Option<V> {
        self.shard_for(&key).insert(key, value, self.weigh)
    }

    /// Remove a value
    pub fn remove(&self, key: &str) -> Option<V> {
        self.shard_for(key).remove_if(key, |_| true, self.weigh)
    }

    /// Remove a value only if it still satisfies `predicate`
    pub fn remove_if<F>(&self, key: &str, predicate: F) -> Option<V>
    where
        F: FnOnce(&V) -> bool,
    {
        self.shard_for(key).remove_if(key, predicate, self.weigh)
    }

    /// Remove every value matching `predicate`, one shard at a time
    pub fn drain_where<F>(&self, predicate: F) -> Vec<(String, V)>
    where
        F: Fn(&V) -> bool,
    {
        self.shards
            .iter()
            .flat_map(|s| s.drain_where(&predicate, self.weigh))
            .collect()
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<(String, V)> {
        self.shards.iter().flat_map(|s| s.entries()).collect()
    }

    /// Total number of entries
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all shards
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.clear();
        }
    }

    /// Summed weight of every value
    pub fn total_weight(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.weight.load(Ordering::Relaxed))
            .sum()
    }

    /// Shard count
    #[inline]
    pub const fn shard_count(&self) -> usize {
        N
    }

    #[cfg(test)]
    fn shard_lengths(&self) -> Vec<usize> {
        self.shards.iter().map(|s| s.len()).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let map: ShardedMap<i32, 16> = ShardedMap::new();
        assert!(map.is_empty());
        assert_eq!(map.shard_count(), 16);

        assert!(map.insert("key1".into(), 42).is_none());
        assert_eq!(map.insert("key1".into(), 43), Some(42));
        assert_eq!(map.get("key1"), Some(43));
        assert!(map.contains_key("key1"));

        assert_eq!(map.remove("key1"), Some(43));
        assert!(!map.contains_key("key1"));
        assert_eq!(map.remove("key1"), None);
    }

    #[test]
    fn test_remove_if_respects_predicate() {
        let map: ShardedMap<i32, 16> = ShardedMap::new();
        map.insert("k".into(), 1);

        assert_eq!(map.remove_if("k", |v| *v == 2), None);
        assert_eq!(map.get("k"), Some(1));
        assert_eq!(map.remove_if("k", |v| *v == 1), Some(1));
        assert!(map.is_empty());
    }

    #[test]
    fn test_drain_where() {
        let map: ShardedMap<i32, 16> = ShardedMap::new();
        for i in 0..100 {
            map.insert(format!("key{}", i), i);
        }

        let drained = map.drain_where(|v| v % 2 == 0);
        assert_eq!(drained.len(), 50);
        assert_eq!(map.len(), 50);
        assert!(drained.iter().all(|(_, v)| v % 2 == 0));
    }

    #[test]
    fn test_weight_tracks_values() {
        let map: ShardedMap<u64, 16> = ShardedMap::with_weigher(|v| *v);
        for i in 1..=10 {
            map.insert(format!("key{}", i), i);
        }
        assert_eq!(map.total_weight(), 55);

        map.insert("key10".into(), 1);
        assert_eq!(map.total_weight(), 46);
        map.remove("key1");
        map.remove_if("key2", |v| *v > 100);
        assert_eq!(map.total_weight(), 45);

        map.drain_where(|v| *v >= 5);
        assert_eq!(map.total_weight(), 2 + 3 + 4 + 1);
        map.clear();
        assert_eq!(map.total_weight(), 0);

        let counted: ShardedMap<&str, 4> = ShardedMap::new();
        counted.insert("a".into(), "x");
        counted.insert("b".into(), "y");
        assert_eq!(counted.total_weight(), 2);
    }

    #[test]
    fn test_distribution() {
        let map: ShardedMap<i32, 16> = ShardedMap::new();
        for i in 0..1000 {
            map.insert(format!("venues:{{capacity:{}}}", i), i);
        }

        let lengths = map.shard_lengths();
        let max_count = lengths.iter().max().copied().unwrap_or_default();
        assert!(max_count < 200, "Uneven distribution: max shard has {}", max_count);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let map: Arc<ShardedMap<i32, 16>> = Arc::new(ShardedMap::new());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..1000 {
                        let key = format!("key-{}-{}", t, i);
                        map.insert(key.clone(), i);
                        map.get(&key);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(map.len(), 8000);
    }
}
