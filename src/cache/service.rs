//! Cache Service - Unified Two-Tier Cache
//!
//! Orchestrates the local and remote tiers with read promotion, tag-aware
//! invalidation, and singleflight-protected population.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::codec::{decode_entry, encode_entry};
use super::entry::{now_millis, CacheEntry};
use super::local::{LocalTier, LocalTierConfig, LocalTierStats};
use super::remote::RemoteTier;
use super::tags::TagIndex;
use super::{CacheLayer, DEFAULT_TTL_SECS};
use crate::error::{Error, FetchError, Result};
use crate::singleflight::Singleflight;
use crate::stats::{component, StatsCollector};

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL used when a caller passes zero
    pub default_ttl_secs: u64,
    /// Deadline for a single backing fetch
    pub fetch_timeout_ms: u64,
    /// Remote payloads at least this large are LZ4-compressed
    pub compress_min_bytes: usize,
    /// Local tier configuration
    pub local: LocalTierConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: DEFAULT_TTL_SECS,
            fetch_timeout_ms: 5_000,
            compress_min_bytes: 1024,
            local: LocalTierConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Effective TTL for a requested value (zero means default)
    pub fn effective_ttl(&self, ttl_secs: u64) -> Duration {
        if ttl_secs == 0 {
            Duration::from_secs(self.default_ttl_secs)
        } else {
            Duration::from_secs(ttl_secs)
        }
    }

    /// Backing fetch deadline
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Cache lookup result
#[derive(Debug, Clone)]
pub struct CacheLookup {
    /// The cached entry
    pub entry: Arc<CacheEntry>,
    /// Which layer answered
    pub layer: CacheLayer,
}

/// Where a `get_or_fetch` value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    /// Served from a cache layer
    Cache(CacheLayer),
    /// This caller fetched from the backing store
    Backing,
    /// Joined a fetch started by a concurrent caller
    Coalesced,
}

impl FetchSource {
    /// True for cache hits
    pub fn is_hit(&self) -> bool {
        matches!(self, FetchSource::Cache(_))
    }
}

/// Value returned by `get_or_fetch`
#[derive(Debug, Clone)]
pub struct Fetched {
    pub value: Bytes,
    pub source: FetchSource,
    /// Time left before the value expires from the cache
    pub ttl: Duration,
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub local: LocalTierStats,
    pub remote_backend: Option<&'static str>,
    pub remote_available: bool,
    pub remote_hits: u64,
    pub remote_misses: u64,
    pub remote_errors: u64,
    /// Lookups that missed every layer
    pub misses: u64,
    pub tags: usize,
    pub in_flight: usize,
}

/// Unified cache service
pub struct CacheService {
    local: LocalTier,
    remote: Option<Arc<dyn RemoteTier>>,
    tags: TagIndex,
    flights: Singleflight<Fetched>,
    config: CacheConfig,
    stats: Arc<StatsCollector>,
    remote_available: AtomicBool,
    remote_hits: AtomicU64,
    remote_misses: AtomicU64,
    remote_errors: AtomicU64,
    misses: AtomicU64,
}

impl CacheService {
    /// Create a cache service. Without a remote tier it runs local-only.
    pub fn new(
        config: CacheConfig,
        remote: Option<Arc<dyn RemoteTier>>,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            local: LocalTier::with_config(config.local.clone()),
            remote_available: AtomicBool::new(remote.is_some()),
            remote,
            tags: TagIndex::new(),
            flights: Singleflight::new(),
            config,
            stats,
            remote_hits: AtomicU64::new(0),
            remote_misses: AtomicU64::new(0),
            remote_errors: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Local-only cache with default configuration (for testing)
    pub fn local_only() -> Self {
        Self::new(
            CacheConfig::default(),
            None,
            Arc::new(StatsCollector::without_exporter()),
        )
    }

    /// Configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn note_remote_result<T>(&self, op: &str, result: &Result<T>) {
        match result {
            Ok(_) => {
                if !self.remote_available.swap(true, Ordering::SeqCst) {
                    info!("Remote cache tier reachable again");
                }
            }
            Err(e) => {
                self.remote_errors.fetch_add(1, Ordering::Relaxed);
                if self.remote_available.swap(false, Ordering::SeqCst) {
                    warn!("Remote cache tier unavailable ({}), degrading to local tier: {}", op, e);
                } else {
                    debug!("Remote cache {} failed: {}", op, e);
                }
            }
        }
    }

    fn local_hit(&self, key: &str, now: u64) -> Option<Arc<CacheEntry>> {
        let entry = self.local.get(key, now)?;
        if self.tags.is_current(entry.tag_generations()) {
            return Some(entry);
        }
        // Invalidated by tag; drop this exact entry
        self.local.remove_if(key, |e| std::ptr::eq(e, entry.as_ref()));
        None
    }

    /// Look up a key in the local tier, then the remote tier.
    ///
    /// A remote hit is promoted into the local tier. Expired entries and
    /// entries whose tags were invalidated after they were written are absent.
    #[instrument(skip(self), level = "debug")]
    pub async fn lookup(&self, key: &str) -> Option<CacheLookup> {
        let started = Instant::now();
        let result = self.lookup_inner(key).await;
        self.stats.record_latency(component::CACHE, started.elapsed());
        result
    }

    async fn lookup_inner(&self, key: &str) -> Option<CacheLookup> {
        let now = now_millis();

        if let Some(entry) = self.local_hit(key, now) {
            self.stats.record_hit(CacheLayer::Local);
            return Some(CacheLookup {
                entry,
                layer: CacheLayer::Local,
            });
        }
        self.stats.record_miss(CacheLayer::Local);

        let Some(remote) = &self.remote else {
            self.record_full_miss(key);
            return None;
        };

        let result = remote.get(key).await;
        self.note_remote_result("get", &result);

        let entry = match result {
            Ok(Some(payload)) => match decode_entry(key, payload) {
                Ok(entry) if entry.is_expired_at(now) => None,
                Ok(entry) if !self.tags.is_current(entry.tag_generations()) => None,
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Dropping unreadable remote entry: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(_) => None,
        };

        match entry {
            Some(entry) => {
                self.remote_hits.fetch_add(1, Ordering::Relaxed);
                self.stats.record_hit(CacheLayer::Remote);

                // Promote; skipped if a tag was invalidated meanwhile
                if self.tags.register(key, entry.tag_generations()) {
                    self.local.put(entry.clone());
                }
                Some(CacheLookup {
                    entry: Arc::new(entry),
                    layer: CacheLayer::Remote,
                })
            }
            None => {
                self.remote_misses.fetch_add(1, Ordering::Relaxed);
                self.stats.record_miss(CacheLayer::Remote);
                self.record_full_miss(key);
                None
            }
        }
    }

    fn record_full_miss(&self, key: &str) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.stats.record_full_miss();
        // Lazily prune the key from the tag index
        self.tags.forget(key);
    }

    /// Get a value
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        self.lookup(key).await.map(|hit| hit.entry.value().clone())
    }

    /// Store a value in both tiers. A `ttl_secs` of zero uses the default TTL.
    ///
    /// Returns false if nothing was stored; a failed set is never an error.
    #[instrument(skip(self, value, tags), fields(size = value.len()))]
    pub async fn set<S: AsRef<str>>(&self, key: &str, value: Bytes, ttl_secs: u64, tags: &[S]) -> bool {
        let generations = self.tags.generations_for(tags);
        self.store(key, value, self.config.effective_ttl(ttl_secs), generations)
            .await
    }

    /// Store with tag generations captured by the caller
    async fn store(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        generations: BTreeMap<String, u64>,
    ) -> bool {
        let entry = CacheEntry::new(key, value, ttl, generations);

        if !self.tags.register(key, entry.tag_generations()) {
            debug!("Skipping cache write for {}: tag invalidated during fetch", key);
            return false;
        }

        // An overwrite may drop tags the previous entry carried
        if let Some(previous) = self.local.peek(key) {
            let current = entry.tag_generations();
            self.tags
                .unregister(key, previous.tag_names().filter(|t| !current.contains_key(*t)));
        }

        let stored_local = self.local.put(entry.clone());
        if !stored_local {
            warn!("Entry {} ({} bytes) exceeds local tier capacity", key, entry.size_bytes());
        }

        let stored_remote = match &self.remote {
            Some(remote) => {
                let payload = encode_entry(&entry, self.config.compress_min_bytes);
                let result = remote.set(key, payload, ttl).await;
                self.note_remote_result("set", &result);
                result.is_ok()
            }
            None => false,
        };

        stored_local || stored_remote
    }

    /// Remove a key from both tiers and from every tag
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> bool {
        let removed_local = self.local.remove(key).is_some();
        self.tags.forget(key);

        let removed_remote = match &self.remote {
            Some(remote) => {
                let result = remote.delete(key).await;
                self.note_remote_result("delete", &result);
                result.unwrap_or(false)
            }
            None => false,
        };

        removed_local || removed_remote
    }

    /// Invalidate every key tagged `tag`. Returns the number of keys removed.
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        self.invalidate_tags(&[tag]).await
    }

    /// Invalidate every key carrying any of `tags`.
    ///
    /// Each tag's generation is bumped before anything is deleted, so readers
    /// observe the whole set as gone at once. Physical deletion follows.
    #[instrument(skip(self, tags))]
    pub async fn invalidate_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        let mut keys = HashSet::new();
        for tag in tags {
            keys.extend(self.tags.invalidate(tag.as_ref()));
        }
        let keys: Vec<String> = keys.into_iter().collect();

        for key in &keys {
            // Leave entries rewritten under the new generation alone
            self.local
                .remove_if(key, |e| !self.tags.is_current(e.tag_generations()));
            self.tags.forget(key);
        }

        if let Some(remote) = &self.remote {
            let result = remote.delete_many(&keys).await;
            self.note_remote_result("delete", &result);
        }

        info!(
            tags = ?tags.iter().map(|t| t.as_ref()).collect::<Vec<&str>>(),
            keys = keys.len(),
            "Invalidated cache tags"
        );
        keys.len()
    }

    /// Return the cached value for `key`, or fetch, store, and return it.
    ///
    /// Concurrent misses for the same key share one fetch. The fetch runs under
    /// the configured timeout; a timeout or failure is returned to every
    /// waiter and nothing is cached. Tag generations are captured before the
    /// fetch starts, so a result fetched across an invalidation is not stored.
    pub async fn get_or_fetch<F, Fut>(
        self: &Arc<Self>,
        key: &str,
        ttl_secs: u64,
        tags: Vec<String>,
        fetch: F,
    ) -> Result<Fetched>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        if let Some(hit) = self.lookup(key).await {
            return Ok(Fetched {
                value: hit.entry.value().clone(),
                source: FetchSource::Cache(hit.layer),
                ttl: hit.entry.remaining_ttl_at(now_millis()),
            });
        }

        let generations = self.tags.generations_for(&tags);
        let ttl = self.config.effective_ttl(ttl_secs);
        let timeout = self.config.fetch_timeout();
        let this = Arc::clone(self);
        let owned_key = key.to_string();

        let flight = self
            .flights
            .run_tracked(key, move || async move {
                // A previous flight may have populated the key after our lookup
                let now = now_millis();
                if let Some(entry) = this.local_hit(&owned_key, now) {
                    return Ok(Fetched {
                        value: entry.value().clone(),
                        source: FetchSource::Cache(CacheLayer::Local),
                        ttl: entry.remaining_ttl_at(now),
                    });
                }

                let started = Instant::now();
                let outcome = tokio::time::timeout(timeout, fetch()).await;
                this.stats.record_latency(component::BACKING, started.elapsed());

                match outcome {
                    Err(_) => {
                        warn!("Backing fetch for {} timed out after {:?}", owned_key, timeout);
                        Err(FetchError::Timeout {
                            key: owned_key,
                            timeout_ms: timeout.as_millis() as u64,
                        })
                    }
                    Ok(Err(e)) => Err(FetchError::from(e)),
                    Ok(Ok(value)) => {
                        this.store(&owned_key, value.clone(), ttl, generations).await;
                        Ok(Fetched {
                            value,
                            source: FetchSource::Backing,
                            ttl,
                        })
                    }
                }
            })
            .await;

        let mut fetched = flight.result.map_err(Error::from)?;
        if !flight.leader && fetched.source == FetchSource::Backing {
            fetched.source = FetchSource::Coalesced;
        }
        Ok(fetched)
    }

    /// Physically remove expired and invalidated local entries and prune
    /// their keys from the tag index. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let mut removed = self.local.purge_expired(now_millis());
        removed.extend(
            self.local
                .remove_matching(|e| !self.tags.is_current(e.tag_generations())),
        );
        for entry in &removed {
            self.tags.forget(entry.key());
        }
        if !removed.is_empty() {
            debug!("Purged {} local cache entries", removed.len());
        }
        removed.len()
    }

    /// Last observed remote tier reachability (false when there is none)
    pub fn remote_available(&self) -> bool {
        self.remote.is_some() && self.remote_available.load(Ordering::SeqCst)
    }

    /// Bytes held by the local tier
    pub fn memory_usage(&self) -> u64 {
        self.local.size()
    }

    /// Drop every local entry and return how many there were. The remote
    /// tier is left untouched.
    pub fn clear_local(&self) -> usize {
        let entries = self.local.len();
        self.local.clear();
        info!(entries, "Cleared local cache tier");
        entries
    }

    /// Get statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            local: self.local.stats(),
            remote_backend: self.remote.as_ref().map(|r| r.name()),
            remote_available: self.remote_available(),
            remote_hits: self.remote_hits.load(Ordering::Relaxed),
            remote_misses: self.remote_misses.load(Ordering::Relaxed),
            remote_errors: self.remote_errors.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            tags: self.tags.tag_count(),
            in_flight: self.flights.in_flight(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
