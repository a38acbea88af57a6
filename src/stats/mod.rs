//! Operational Statistics
//!
//! Hit/miss, latency, and health counters for the dashboard, plus an
//! optional Prometheus exposition of the same counters.

mod collector;
mod exporter;

pub use collector::{
    HealthEvent, LatencySnapshot, LayerSnapshot, StatsCollector, StatsSnapshot,
    HEALTH_EVENT_CAPACITY,
};
pub use exporter::PrometheusExporter;

/// Component names used for latency accounting
pub mod component {
    /// Cache lookup (both tiers)
    pub const CACHE: &str = "cache";
    /// Backing store fetch
    pub const BACKING: &str = "backing";
    /// Upstream health probe
    pub const PROBE: &str = "probe";
    /// Response negotiation and compression
    pub const RESPONSE: &str = "response";
    /// Whole request
    pub const REQUEST: &str = "request";
}
