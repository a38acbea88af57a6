//! Prometheus Exposition
//!
//! Mirrors the collector's counters into a private registry rendered at
//! `/metrics`.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::error::{Error, Result};

/// Latency buckets in milliseconds
const LATENCY_BUCKETS_MS: &[f64] = &[
    0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0,
];

/// Prometheus registry with the edge metrics
pub struct PrometheusExporter {
    registry: Registry,
    pub(crate) hits: IntCounterVec,
    pub(crate) misses: IntCounterVec,
    pub(crate) latency: HistogramVec,
    pub(crate) transitions: IntCounterVec,
    pub(crate) requests: IntCounter,
    pub(crate) rate_limited: IntCounter,
}

impl PrometheusExporter {
    /// Build and register every metric
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let hits = IntCounterVec::new(
            Opts::new("catalog_edge_cache_hits_total", "Cache hits by layer"),
            &["layer"],
        )?;
        let misses = IntCounterVec::new(
            Opts::new("catalog_edge_cache_misses_total", "Cache misses by layer"),
            &["layer"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new(
                "catalog_edge_component_latency_ms",
                "Component latency in milliseconds",
            )
            .buckets(LATENCY_BUCKETS_MS.to_vec()),
            &["component"],
        )?;
        let transitions = IntCounterVec::new(
            Opts::new(
                "catalog_edge_health_transitions_total",
                "Upstream health state transitions",
            ),
            &["from", "to"],
        )?;
        let requests = IntCounter::new("catalog_edge_requests_total", "Requests served")?;
        let rate_limited = IntCounter::new(
            "catalog_edge_rate_limited_total",
            "Requests rejected by the rate limiter",
        )?;

        registry.register(Box::new(hits.clone()))?;
        registry.register(Box::new(misses.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(transitions.clone()))?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(rate_limited.clone()))?;

        Ok(Self {
            registry,
            hits,
            misses,
            latency,
            transitions,
            requests,
            rate_limited,
        })
    }

    /// Render the registry in the text exposition format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding failed: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("metrics output is not utf-8: {}", e)))
    }
}
