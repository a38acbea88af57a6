//! Catalog Query Handling
//!
//! Turns client filters into deterministic cache keys and into backing-store
//! queries with a minimal field projection.
//!
//! ```text
//! ?location=Galle&capacity_min=50
//!        │
//!        ▼
//! parse_query_string ──▶ filter map ──┬──▶ Normalizer ──▶ "venues:{capacity:{min:50},location:galle}"
//!                                     │
//!                                     └──▶ CatalogFilter ──▶ QueryOptimizer ──▶ OptimizedQuery
//! ```

mod normalize;
mod optimizer;

use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use normalize::{fingerprint, normalize, parse_query_string, Normalizer, NormalizerConfig};
pub use optimizer::{
    build_predicate, CatalogFilter, OptimizedQuery, OptimizerConfig, Predicate, QueryOptimizer,
    Range, SortKey,
};

use crate::error::Error;

/// Catalog collections served by the read pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Venues,
    Vendors,
    Packages,
}

impl Collection {
    /// Collection name, also used as cache namespace and invalidation tag
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Venues => "venues",
            Collection::Vendors => "vendors",
            Collection::Packages => "packages",
        }
    }

    pub fn all() -> [Collection; 3] {
        [Collection::Venues, Collection::Vendors, Collection::Packages]
    }

    /// Fields returned when the caller does not ask for specific ones
    pub fn default_projection(&self) -> &'static [&'static str] {
        match self {
            Collection::Venues => &["id", "name", "location", "capacity", "price", "rating"],
            Collection::Vendors => &["id", "name", "category", "location", "price", "rating"],
            Collection::Packages => &["id", "name", "vendorId", "price", "features"],
        }
    }

    /// Every field a record of this collection may carry
    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            Collection::Venues => &[
                "id", "name", "slug", "location", "capacity", "price", "rating", "amenities",
                "description", "images",
            ],
            Collection::Vendors => &[
                "id", "name", "slug", "category", "location", "price", "rating", "features",
                "description", "images",
            ],
            Collection::Packages => &[
                "id", "name", "slug", "vendorId", "category", "location", "price", "features",
                "capacity", "description",
            ],
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Collection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "venues" => Ok(Collection::Venues),
            "vendors" => Ok(Collection::Vendors),
            "packages" => Ok(Collection::Packages),
            other => Err(Error::InvalidRequest(format!("unknown collection '{}'", other))),
        }
    }
}
