//! Catalog Edge - request-serving optimization layer for a read-heavy catalog API
//!
//! Sits between clients and the catalog backend and makes repeated reads cheap:
//!
//! ```text
//! client ─▶ rate limiter ─▶ normalizer ─▶ tiered cache ──hit──▶ response optimizer ─▶ client
//!                                              │ miss
//!                                              ▼
//!                              singleflight ─▶ query optimizer ─▶ backing store
//!                                                                   │
//!                                                     load balancer ┘ (upstream instances)
//! ```
//!
//! # Modules
//!
//! - [`cache`] - local sharded LRU tier, optional Redis tier, tag invalidation
//! - [`singleflight`] - request coalescing for concurrent misses
//! - [`query`] - filter normalization, cache keys, query construction
//! - [`ratelimit`] - fixed-window per-client admission control
//! - [`balancer`] - upstream selection and health tracking
//! - [`backing`] - backing store port and its adapters
//! - [`response`] - content negotiation, compression, and cache headers
//! - [`stats`] - counters, latency, health events, Prometheus exposition
//! - [`service`] - the assembled request pipeline
//! - [`server`] - HTTP routes
//! - [`config`] - CLI and YAML configuration
//! - [`error`] - Error types

pub mod backing;
pub mod balancer;
pub mod cache;
pub mod config;
pub mod error;
pub mod query;
pub mod ratelimit;
pub mod response;
pub mod server;
pub mod service;
pub mod singleflight;
pub mod stats;

// Re-export commonly used types
pub use backing::{BackingStore, InMemoryCatalog, UpstreamStore};
pub use balancer::{LoadBalancer, Strategy};
pub use cache::{CacheService, FetchSource};
pub use config::{Args, EdgeConfig};
pub use error::{Error, Result};
pub use query::Collection;
pub use ratelimit::RateLimiter;
pub use service::{Components, EdgeService};
pub use stats::StatsCollector;
