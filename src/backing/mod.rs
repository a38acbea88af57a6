//! Backing Store Port
//!
//! The read pipeline only needs `fetch(query) -> records`. Two adapters
//! implement it:
//!
//! - [`InMemoryCatalog`] - seeded demo records evaluated in process
//! - [`UpstreamStore`] - forwards the query to an upstream instance chosen by
//!   the load balancer, re-selecting on failure

mod memory;
mod upstream;

use async_trait::async_trait;
use serde_json::Value;

pub use memory::InMemoryCatalog;
pub use upstream::{UpstreamConfig, UpstreamStore};

use crate::error::Result;
use crate::query::OptimizedQuery;

/// Source of catalog records. Reads are idempotent and side-effect free.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Records matching `query`, already filtered, paged, and projected
    async fn fetch(&self, query: &OptimizedQuery) -> Result<Vec<Value>>;

    /// Adapter name for logs
    fn name(&self) -> &'static str;
}
