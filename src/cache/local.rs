//! Local Tier - In-Process Hot Cache
//!
//! Sharded map bounded by bytes and entry count.
//!
//! # Design
//!
//! - ShardedMap with 64 shards for minimal lock contention
//! - LRU eviction driven by a global access clock
//! - Capacity-based eviction with configurable high/low watermarks
//! - Expired entries are invisible immediately and purged lazily
//! - Byte size is the map's weight, accounted under each shard's lock

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::entry::CacheEntry;
use super::shard::ShardedMap;
use super::{DEFAULT_LOCAL_CAPACITY, LOCAL_SHARD_COUNT};

/// Local tier configuration
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct LocalTierConfig {
    /// Maximum capacity in bytes
    pub capacity_bytes: u64,
    /// Maximum number of entries
    pub max_entries: usize,
    /// High watermark fraction (trigger eviction)
    pub high_watermark: f64,
    /// Low watermark fraction (stop eviction)
    pub low_watermark: f64,
    /// Maximum entries evicted per pass
    pub eviction_batch_size: usize,
}

impl Default for LocalTierConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: DEFAULT_LOCAL_CAPACITY,
            max_entries: 100_000,
            high_watermark: 0.90, // Start eviction at 90%
            low_watermark: 0.80,  // Stop eviction at 80%
            eviction_batch_size: 1000,
        }
    }
}

/// Stored entry plus its last access tick
struct Slot {
    entry: Arc<CacheEntry>,
    last_access: AtomicU64,
}

/// Local tier statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LocalTierStats {
    pub entries: usize,
    pub size_bytes: u64,
    pub capacity_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// Local tier - in-process hot cache
pub struct LocalTier {
    storage: ShardedMap<Arc<Slot>, LOCAL_SHARD_COUNT>,
    config: LocalTierConfig,
    /// Monotonic access clock for LRU ordering
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl LocalTier {
    /// Create a new local tier with default configuration
    pub fn new() -> Self {
        Self::with_config(LocalTierConfig::default())
    }

    /// Create a new local tier with custom configuration
    pub fn with_config(config: LocalTierConfig) -> Self {
        Self {
            storage: ShardedMap::with_weigher(|slot: &Arc<Slot>| slot.entry.size_bytes()),
            config,
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    #[inline]
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Get a live entry as of `now_ms`
    pub fn get(&self, key: &str, now_ms: u64) -> Option<Arc<CacheEntry>> {
        let Some(slot) = self.storage.get(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if slot.entry.is_expired_at(now_ms) {
            self.remove_slot_if(key, |s| s.entry.is_expired_at(now_ms));
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        slot.last_access.store(self.tick(), Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(Arc::clone(&slot.entry))
    }

    /// Insert or replace an entry. Returns false if it can never fit.
    pub fn put(&self, entry: CacheEntry) -> bool {
        let size = entry.size_bytes();
        if size > self.config.capacity_bytes {
            return false;
        }

        if self.should_evict(size) {
            self.evict();
        }

        let key = entry.key().to_string();
        let slot = Arc::new(Slot {
            entry: Arc::new(entry),
            last_access: AtomicU64::new(self.tick()),
        });

        self.storage.insert(key, slot);
        true
    }

    /// Current entry for `key`, live or not, without touching LRU order or
    /// hit counters
    pub fn peek(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.storage.get(key).map(|slot| Arc::clone(&slot.entry))
    }

    /// Remove an entry
    pub fn remove(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.remove_slot_if(key, |_| true)
    }

    fn remove_slot_if<F>(&self, key: &str, predicate: F) -> Option<Arc<CacheEntry>>
    where
        F: FnOnce(&Arc<Slot>) -> bool,
    {
        let slot = self.storage.remove_if(key, predicate)?;
        Some(Arc::clone(&slot.entry))
    }

    /// Check if the key is physically present (expired or not)
    pub fn contains(&self, key: &str) -> bool {
        self.storage.contains_key(key)
    }

    /// Remove an entry only if it still satisfies `predicate`
    pub fn remove_if<F>(&self, key: &str, predicate: F) -> Option<Arc<CacheEntry>>
    where
        F: FnOnce(&CacheEntry) -> bool,
    {
        self.remove_slot_if(key, |s| predicate(&s.entry))
    }

    /// Remove every entry matching `predicate`
    pub fn remove_matching<F>(&self, predicate: F) -> Vec<Arc<CacheEntry>>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        self.storage
            .drain_where(|s| predicate(&s.entry))
            .into_iter()
            .map(|(_, slot)| Arc::clone(&slot.entry))
            .collect()
    }

    /// Physically remove every entry expired as of `now_ms`
    pub fn purge_expired(&self, now_ms: u64) -> Vec<Arc<CacheEntry>> {
        let removed = self.remove_matching(|e| e.is_expired_at(now_ms));
        self.expirations
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        removed
    }

    fn should_evict(&self, incoming: u64) -> bool {
        let projected = (self.size() + incoming) as f64;
        let capacity = self.config.capacity_bytes as f64;
        projected / capacity >= self.config.high_watermark
            || self.len() >= self.config.max_entries
    }

    fn should_continue_eviction(&self) -> bool {
        let current = self.size() as f64;
        let capacity = self.config.capacity_bytes as f64;
        let max_entries = (self.config.max_entries as f64 * self.config.low_watermark) as usize;
        current / capacity > self.config.low_watermark || self.len() > max_entries
    }

    /// Evict least-recently-used entries until the low watermark is reached
    fn evict(&self) {
        let mut candidates: Vec<(String, u64)> = self
            .storage
            .entries()
            .into_iter()
            .map(|(key, slot)| (key, slot.last_access.load(Ordering::Relaxed)))
            .collect();

        // Oldest access first
        candidates.sort_by_key(|(_, tick)| *tick);

        let mut evicted = 0;
        for (key, tick) in candidates {
            if !self.should_continue_eviction() || evicted >= self.config.eviction_batch_size {
                break;
            }
            // Skip entries touched since the snapshot
            if self
                .remove_slot_if(&key, |s| s.last_access.load(Ordering::Relaxed) == tick)
                .is_some()
            {
                evicted += 1;
            }
        }

        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        if evicted > 0 {
            tracing::debug!("Evicted {} entries from local tier", evicted);
        }
    }

    /// Current size in bytes
    pub fn size(&self) -> u64 {
        self.storage.total_weight()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Check if the tier is empty
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Clear the tier
    pub fn clear(&self) {
        self.storage.clear();
    }

    /// Get statistics
    pub fn stats(&self) -> LocalTierStats {
        LocalTierStats {
            entries: self.len(),
            size_bytes: self.size(),
            capacity_bytes: self.config.capacity_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

impl Default for LocalTier {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::now_millis;
    use bytes::Bytes;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn make_entry(key: &str, data: &[u8]) -> CacheEntry {
        CacheEntry::new(
            key,
            Bytes::copy_from_slice(data),
            Duration::from_secs(60),
            BTreeMap::new(),
        )
    }

    #[test]
    fn test_put_get() {
        let tier = LocalTier::new();
        assert!(tier.put(make_entry("k1", b"hello")));

        let entry = tier.get("k1", now_millis()).unwrap();
        assert_eq!(entry.value().as_ref(), b"hello");
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.stats().hits, 1);
    }

    #[test]
    fn test_miss() {
        let tier = LocalTier::new();
        assert!(tier.get("missing", now_millis()).is_none());
        assert_eq!(tier.stats().misses, 1);
    }

    #[test]
    fn test_replace_updates_size() {
        let tier = LocalTier::new();
        tier.put(make_entry("k", &[0u8; 100]));
        let first = tier.size();
        tier.put(make_entry("k", &[0u8; 40]));
        assert_eq!(tier.size(), first - 60);
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_expired_entry_is_invisible() {
        let tier = LocalTier::new();
        let entry = CacheEntry::with_timestamps("k", Bytes::from_static(b"v"), BTreeMap::new(), 1_000, 2_000);
        tier.put(entry);

        assert!(tier.get("k", 1_500).is_some());
        assert!(tier.get("k", 2_000).is_none());
        assert!(!tier.contains("k"));
        assert_eq!(tier.size(), 0);
    }

    #[test]
    fn test_purge_expired() {
        let tier = LocalTier::new();
        tier.put(CacheEntry::with_timestamps("old", Bytes::new(), BTreeMap::new(), 0, 10));
        tier.put(make_entry("fresh", b"x"));

        let removed = tier.purge_expired(now_millis());
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].key(), "old");
        assert!(tier.contains("fresh"));
        assert_eq!(tier.stats().expirations, 1);
    }

    #[test]
    fn test_remove_if_and_matching() {
        let tier = LocalTier::new();
        tier.put(make_entry("a", b"1"));
        tier.put(make_entry("b", b"22"));
        tier.put(make_entry("c", b"333"));

        assert!(tier.remove_if("a", |e| e.value().len() > 1).is_none());
        assert!(tier.remove_if("a", |e| e.value().len() == 1).is_some());

        let removed = tier.remove_matching(|e| e.value().len() >= 2);
        assert_eq!(removed.len(), 2);
        assert!(tier.is_empty());
        assert_eq!(tier.size(), 0);
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let tier = LocalTier::with_config(LocalTierConfig {
            capacity_bytes: 10,
            ..Default::default()
        });
        assert!(!tier.put(make_entry("k", &[0u8; 64])));
        assert!(tier.is_empty());
    }

    #[test]
    fn test_lru_eviction_keeps_recently_used() {
        let tier = LocalTier::with_config(LocalTierConfig {
            capacity_bytes: 1_000,
            max_entries: 1_000,
            high_watermark: 0.9,
            low_watermark: 0.5,
            eviction_batch_size: 100,
        });

        for i in 0..8 {
            tier.put(make_entry(&format!("k{}", i), &[0u8; 98]));
        }
        // Touch k0 so it becomes most recently used
        assert!(tier.get("k0", now_millis()).is_some());

        // Pushes projected size over the high watermark
        tier.put(make_entry("k8", &[0u8; 98]));

        assert!(tier.contains("k0"));
        assert!(tier.contains("k8"));
        assert!(!tier.contains("k1"));
        assert!(tier.size() <= 1_000);
        assert!(tier.stats().evictions > 0);
    }

    #[test]
    fn test_entry_count_limit() {
        let tier = LocalTier::with_config(LocalTierConfig {
            max_entries: 10,
            ..Default::default()
        });
        for i in 0..50 {
            tier.put(make_entry(&format!("k{}", i), b"v"));
        }
        assert!(tier.len() <= 10);
    }

    #[test]
    fn test_peek_leaves_counters_alone() {
        let tier = LocalTier::new();
        tier.put(CacheEntry::with_timestamps("old", Bytes::new(), BTreeMap::new(), 0, 10));

        assert_eq!(tier.peek("old").unwrap().key(), "old");
        assert!(tier.peek("missing").is_none());
        let stats = tier.stats();
        assert_eq!((stats.hits, stats.misses, stats.expirations), (0, 0, 0));
    }

    #[test]
    fn test_size_stays_exact_under_concurrent_churn() {
        use std::thread;

        let tier = Arc::new(LocalTier::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tier = Arc::clone(&tier);
                thread::spawn(move || {
                    for i in 0..500 {
                        // Threads share keys so puts, replaces, and removes interleave
                        let key = format!("k{}", (t + i) % 32);
                        tier.put(make_entry(&key, &vec![0u8; 1 + (i % 7)]));
                        if i % 3 == 0 {
                            tier.remove(&format!("k{}", (t * 5 + i) % 32));
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let accounted: u64 = (0..32)
            .filter_map(|i| tier.peek(&format!("k{}", i)))
            .map(|e| e.size_bytes())
            .sum();
        assert_eq!(tier.size(), accounted);
        assert!(tier.stats().evictions == 0);
    }

    #[test]
    fn test_clear() {
        let tier = LocalTier::new();
        for i in 0..10 {
            tier.put(make_entry(&format!("k{}", i), b"v"));
        }
        tier.clear();
        assert!(tier.is_empty());
        assert_eq!(tier.size(), 0);
    }
}
