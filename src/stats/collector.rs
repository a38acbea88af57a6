//! Stats Collector
//!
//! Passive counters fed by the other components. Recording never fails and
//! never blocks beyond a short critical section.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::exporter::PrometheusExporter;
use crate::balancer::HealthState;
use crate::cache::CacheLayer;

/// Number of health transitions retained
pub const HEALTH_EVENT_CAPACITY: usize = 64;

/// Hit/miss counters for one cache layer
#[derive(Debug, Default)]
struct LayerCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Latency accumulator for one component
#[derive(Debug, Default)]
struct LatencyCounter {
    sum_micros: AtomicU64,
    count: AtomicU64,
}

/// Recorded health transition
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthEvent {
    pub instance_id: String,
    pub from: HealthState,
    pub to: HealthState,
    pub at: DateTime<Utc>,
}

/// Per-layer view
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Per-component latency view
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySnapshot {
    pub count: u64,
    pub latency_sum_ms: f64,
    pub average_ms: f64,
}

/// Read-only view of the current reporting window
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub window_start: DateTime<Utc>,
    /// Lookups answered by any layer
    pub hits: u64,
    /// Lookups that missed every layer
    pub misses: u64,
    pub hit_rate: f64,
    pub total_requests: u64,
    pub rate_limited: u64,
    pub layers: BTreeMap<String, LayerSnapshot>,
    pub latency: BTreeMap<String, LatencySnapshot>,
    pub health_events: Vec<HealthEvent>,
}

fn ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Process-wide stats collector
pub struct StatsCollector {
    local: LayerCounters,
    remote: LayerCounters,
    /// Lookups that missed every layer
    full_misses: AtomicU64,
    latencies: RwLock<BTreeMap<String, Arc<LatencyCounter>>>,
    requests: AtomicU64,
    rate_limited: AtomicU64,
    health_events: Mutex<VecDeque<HealthEvent>>,
    window_start: Mutex<DateTime<Utc>>,
    exporter: Option<PrometheusExporter>,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    /// Create a collector with Prometheus exposition enabled
    pub fn new() -> Self {
        let exporter = match PrometheusExporter::new() {
            Ok(exporter) => Some(exporter),
            Err(e) => {
                tracing::warn!("Prometheus exporter disabled: {}", e);
                None
            }
        };
        Self::with_exporter(exporter)
    }

    /// Create a collector without Prometheus exposition
    pub fn without_exporter() -> Self {
        Self::with_exporter(None)
    }

    fn with_exporter(exporter: Option<PrometheusExporter>) -> Self {
        Self {
            local: LayerCounters::default(),
            remote: LayerCounters::default(),
            full_misses: AtomicU64::new(0),
            latencies: RwLock::new(BTreeMap::new()),
            requests: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            health_events: Mutex::new(VecDeque::with_capacity(HEALTH_EVENT_CAPACITY)),
            window_start: Mutex::new(Utc::now()),
            exporter,
        }
    }

    fn layer(&self, layer: CacheLayer) -> &LayerCounters {
        match layer {
            CacheLayer::Local => &self.local,
            CacheLayer::Remote => &self.remote,
        }
    }

    /// Record a hit in `layer`
    pub fn record_hit(&self, layer: CacheLayer) {
        self.layer(layer).hits.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.hits.with_label_values(&[layer.name()]).inc();
        }
    }

    /// Record a miss in `layer`
    pub fn record_miss(&self, layer: CacheLayer) {
        self.layer(layer).misses.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.misses.with_label_values(&[layer.name()]).inc();
        }
    }

    /// Record a lookup that missed every layer
    pub fn record_full_miss(&self) {
        self.full_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a latency sample for `component`
    pub fn record_latency(&self, component: &str, elapsed: Duration) {
        let counter = {
            let latencies = self.latencies.read();
            latencies.get(component).cloned()
        };
        let counter = match counter {
            Some(counter) => counter,
            None => Arc::clone(
                self.latencies
                    .write()
                    .entry(component.to_string())
                    .or_default(),
            ),
        };

        counter
            .sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        counter.count.fetch_add(1, Ordering::Relaxed);

        if let Some(exporter) = &self.exporter {
            exporter
                .latency
                .with_label_values(&[component])
                .observe(elapsed.as_secs_f64() * 1000.0);
        }
    }

    /// Record an upstream health transition
    pub fn record_health_change(&self, instance_id: &str, from: HealthState, to: HealthState) {
        {
            let mut events = self.health_events.lock();
            if events.len() == HEALTH_EVENT_CAPACITY {
                events.pop_front();
            }
            events.push_back(HealthEvent {
                instance_id: instance_id.to_string(),
                from,
                to,
                at: Utc::now(),
            });
        }
        if let Some(exporter) = &self.exporter {
            exporter
                .transitions
                .with_label_values(&[from.name(), to.name()])
                .inc();
        }
    }

    /// Record an admitted request
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.requests.inc();
        }
    }

    /// Record a rate-limited request
    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.rate_limited.inc();
        }
    }

    /// Snapshot of the current window
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        self.build_snapshot(load)
    }

    /// Close the current window: return its snapshot and reset the counters.
    ///
    /// The health-event log is kept across windows.
    pub fn rollover(&self) -> StatsSnapshot {
        let take = |c: &AtomicU64| c.swap(0, Ordering::Relaxed);
        let snapshot = self.build_snapshot(take);
        *self.window_start.lock() = Utc::now();
        snapshot
    }

    /// Spawn the periodic window rollover, logging each closed window. The
    /// first window closes one `period` after the spawn. It runs until
    /// `cancel` fires.
    pub fn spawn_rollover(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let closed = self.rollover();
                        info!(
                            window_start = %closed.window_start,
                            requests = closed.total_requests,
                            rate_limited = closed.rate_limited,
                            hits = closed.hits,
                            misses = closed.misses,
                            hit_rate = closed.hit_rate,
                            "Stats window closed"
                        );
                    }
                }
            }
        })
    }

    fn build_snapshot<F>(&self, read: F) -> StatsSnapshot
    where
        F: Fn(&AtomicU64) -> u64,
    {
        let mut layers = BTreeMap::new();
        let mut hits = 0;
        for layer in CacheLayer::all() {
            let counters = self.layer(layer);
            let layer_hits = read(&counters.hits);
            let layer_misses = read(&counters.misses);
            hits += layer_hits;
            layers.insert(
                layer.name().to_string(),
                LayerSnapshot {
                    hits: layer_hits,
                    misses: layer_misses,
                    hit_rate: ratio(layer_hits, layer_misses),
                },
            );
        }
        let misses = read(&self.full_misses);

        let latency = self
            .latencies
            .read()
            .iter()
            .map(|(component, counter)| {
                let count = read(&counter.count);
                let sum_ms = read(&counter.sum_micros) as f64 / 1000.0;
                let average_ms = if count == 0 { 0.0 } else { sum_ms / count as f64 };
                (
                    component.clone(),
                    LatencySnapshot {
                        count,
                        latency_sum_ms: sum_ms,
                        average_ms,
                    },
                )
            })
            .collect();

        StatsSnapshot {
            window_start: *self.window_start.lock(),
            hits,
            misses,
            hit_rate: ratio(hits, misses),
            total_requests: read(&self.requests),
            rate_limited: read(&self.rate_limited),
            layers,
            latency,
            health_events: self.health_events.lock().iter().cloned().collect(),
        }
    }

    /// Text exposition, if the exporter is enabled
    pub fn render_prometheus(&self) -> Option<String> {
        let exporter = self.exporter.as_ref()?;
        match exporter.render() {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!("Failed to render metrics: {}", e);
                None
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
