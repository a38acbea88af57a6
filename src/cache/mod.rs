//! Tiered Cache with Tag-Based Invalidation
//!
//! Two-tier cache fronting the catalog backing store: a sharded in-process
//! local tier and a shared remote tier, with read promotion from remote to
//! local and tag-based bulk invalidation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          Cache Service                                    │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Local Tier (RAM)            │ Remote Tier (shared)     │ Tag Index        │
//! │  ┌────────────────────────┐  │ ┌──────────────────────┐ │ ┌──────────────┐ │
//! │  │ ShardedMap (64-way)    │  │ │ Redis / in-memory    │ │ │ tag -> keys  │ │
//! │  │ LRU + watermarks       │  │ │ LZ4 envelope         │ │ │ generations  │ │
//! │  └────────────────────────┘  │ └──────────────────────┘ │ └──────────────┘ │
//! │              │                          │                        │         │
//! │              └──────────── promotion ───┘                        │         │
//! │                                                                  │         │
//! │       Singleflight (one backing fetch per key)  ◄────────────────┘         │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Consistency
//!
//! Every entry records the generation of each of its tags at write time.
//! Invalidating a tag bumps its generation under a single lock, so readers see
//! either the whole pre-invalidation set or none of it, on both tiers. Keys are
//! then deleted physically on a best-effort basis.
//!
//! # Failure Model
//!
//! The remote tier is an accelerator. When it is unreachable the service
//! degrades to local-only operation and logs the condition.

mod codec;
mod entry;
mod local;
mod remote;
mod service;
mod shard;
mod tags;

pub use codec::{decode_entry, encode_entry, PayloadCodec};
pub use entry::{now_millis, CacheEntry};
pub(crate) use entry::fx_hash;
pub use local::{LocalTier, LocalTierConfig, LocalTierStats};
pub use remote::{InMemoryRemoteTier, RedisRemoteTier, RemoteTier};
pub use service::{CacheConfig, CacheLookup, CacheService, CacheStats, FetchSource, Fetched};
pub use shard::ShardedMap;
pub use tags::TagIndex;

/// Number of shards in the local tier
pub const LOCAL_SHARD_COUNT: usize = 64;

/// Default local tier capacity (256MB)
pub const DEFAULT_LOCAL_CAPACITY: u64 = 256 * 1024 * 1024;

/// Default entry TTL when a caller passes zero (5 minutes)
pub const DEFAULT_TTL_SECS: u64 = 300;

/// Cache layer, used for hit/miss accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheLayer {
    /// In-process tier
    Local,
    /// Shared remote tier
    Remote,
}

impl CacheLayer {
    /// Stable lowercase name used in stats and metric labels
    pub fn name(&self) -> &'static str {
        match self {
            CacheLayer::Local => "local",
            CacheLayer::Remote => "remote",
        }
    }

    /// All layers in lookup order
    pub fn all() -> [CacheLayer; 2] {
        [CacheLayer::Local, CacheLayer::Remote]
    }
}

impl std::fmt::Display for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_count_is_power_of_two() {
        // Power of 2 enables fast modulo via bitwise AND
        assert!(LOCAL_SHARD_COUNT.is_power_of_two());
    }

    #[test]
    fn test_layer_names() {
        assert_eq!(CacheLayer::Local.to_string(), "local");
        assert_eq!(CacheLayer::Remote.to_string(), "remote");
        assert_eq!(CacheLayer::all()[0], CacheLayer::Local);
    }
}
