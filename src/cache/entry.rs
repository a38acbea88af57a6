//! Cache Entry Types
//!
//! Entries are immutable once built. Updating a key replaces the whole entry.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;

/// Milliseconds since the Unix epoch
#[inline]
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Fast non-cryptographic hash (FxHash algorithm)
#[inline]
pub(crate) fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

/// A cached value with its tags and lifetime
#[derive(Clone, PartialEq, Eq)]
pub struct CacheEntry {
    key: String,
    value: Bytes,
    /// Tag name -> tag generation observed when the entry was written
    tags: BTreeMap<String, u64>,
    created_at_ms: u64,
    expires_at_ms: u64,
}

impl CacheEntry {
    /// Create an entry that lives for `ttl` from now
    pub fn new(
        key: impl Into<String>,
        value: Bytes,
        ttl: Duration,
        tags: BTreeMap<String, u64>,
    ) -> Self {
        let created = now_millis();
        // expires_at must be strictly after created_at
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        Self::with_timestamps(key, value, tags, created, created.saturating_add(ttl_ms))
    }

    /// Create with explicit timestamps (tier transfers and decoding)
    pub fn with_timestamps(
        key: impl Into<String>,
        value: Bytes,
        tags: BTreeMap<String, u64>,
        created_at_ms: u64,
        expires_at_ms: u64,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            tags,
            created_at_ms,
            expires_at_ms: expires_at_ms.max(created_at_ms.saturating_add(1)),
        }
    }

    /// Cache key
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Cached value (zero-copy)
    #[inline]
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Tag names
    pub fn tag_names(&self) -> impl Iterator<Item = &str> {
        self.tags.keys().map(String::as_str)
    }

    /// Tag generations recorded at write time
    #[inline]
    pub fn tag_generations(&self) -> &BTreeMap<String, u64> {
        &self.tags
    }

    /// Creation time (epoch millis)
    #[inline]
    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    /// Expiry time (epoch millis)
    #[inline]
    pub fn expires_at_ms(&self) -> u64 {
        self.expires_at_ms
    }

    /// Accounted size: key, value, and tag names
    pub fn size_bytes(&self) -> u64 {
        let tags: usize = self.tags.keys().map(|t| t.len() + 8).sum();
        (self.key.len() + self.value.len() + tags) as u64
    }

    /// Logically absent once `now >= expires_at`
    #[inline]
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    /// Check against the wall clock
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    /// Time left before expiry
    pub fn remaining_ttl_at(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.expires_at_ms.saturating_sub(now_ms))
    }

    /// Original TTL
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.expires_at_ms - self.created_at_ms)
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("size", &self.value.len())
            .field("tags", &self.tags)
            .field("expires_at_ms", &self.expires_at_ms)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> BTreeMap<String, u64> {
        names.iter().map(|n| (n.to_string(), 0)).collect()
    }

    #[test]
    fn test_entry_creation() {
        let entry = CacheEntry::new(
            "venues:{location:galle}",
            Bytes::from_static(b"[]"),
            Duration::from_secs(60),
            tags(&["venues"]),
        );
        assert_eq!(entry.key(), "venues:{location:galle}");
        assert_eq!(entry.value().as_ref(), b"[]");
        assert_eq!(entry.tag_names().collect::<Vec<_>>(), vec!["venues"]);
        assert!(!entry.is_expired());
        assert_eq!(entry.ttl(), Duration::from_secs(60));
    }

    #[test]
    fn test_expires_strictly_after_created() {
        let entry = CacheEntry::new("k", Bytes::new(), Duration::ZERO, BTreeMap::new());
        assert!(entry.expires_at_ms() > entry.created_at_ms());

        let entry = CacheEntry::with_timestamps("k", Bytes::new(), BTreeMap::new(), 100, 50);
        assert_eq!(entry.expires_at_ms(), 101);
    }

    #[test]
    fn test_expiry_boundary() {
        let entry = CacheEntry::with_timestamps("k", Bytes::new(), BTreeMap::new(), 1_000, 2_000);
        assert!(!entry.is_expired_at(1_999));
        assert!(entry.is_expired_at(2_000));
        assert!(entry.is_expired_at(5_000));
        assert_eq!(entry.remaining_ttl_at(1_500), Duration::from_millis(500));
        assert_eq!(entry.remaining_ttl_at(3_000), Duration::ZERO);
    }

    #[test]
    fn test_size_accounts_key_value_and_tags() {
        let entry = CacheEntry::new(
            "abc",
            Bytes::from_static(b"12345"),
            Duration::from_secs(1),
            tags(&["t1"]),
        );
        assert_eq!(entry.size_bytes(), 3 + 5 + 2 + 8);
    }

    #[test]
    fn test_fx_hash_is_stable() {
        assert_eq!(fx_hash(b"venues"), fx_hash(b"venues"));
        assert_ne!(fx_hash(b"venues"), fx_hash(b"vendors"));
    }

    #[test]
    fn test_entry_debug() {
        let entry = CacheEntry::new("k", Bytes::from_static(b"v"), Duration::from_secs(1), BTreeMap::new());
        let debug = format!("{:?}", entry);
        assert!(debug.contains("CacheEntry"));
        assert!(debug.contains("size"));
    }
}
