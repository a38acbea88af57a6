//! Edge Service
//!
//! The one service object built at startup and handed to every request
//! handler. It owns the cache, limiter, balancer, stats, and backing store,
//! runs the read pipeline, and supervises the background tasks.
//!
//! ```text
//! admit ─▶ normalize ─▶ cache lookup ─▶ singleflight ─▶ optimize ─▶ backing fetch
//!                                                                       │
//!             respond ◀── negotiate/annotate ◀── populate (tags, TTL) ◀─┘
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::backing::{BackingStore, InMemoryCatalog, UpstreamStore};
use crate::balancer::{
    spawn_health_monitor, BalancerSnapshot, HealthProber, HttpProber, LoadBalancer,
};
use crate::cache::{CacheService, FetchSource, RedisRemoteTier, RemoteTier};
use crate::config::EdgeConfig;
use crate::error::{Error, Result};
use crate::query::{parse_query_string, CatalogFilter, Collection, Normalizer, QueryOptimizer};
use crate::ratelimit::{RateDecision, RateLimiter};
use crate::response::{CacheStatus, PreparedResponse, RequestHeaders, ResponseOptimizer};
use crate::stats::{component, HealthEvent, LatencySnapshot, StatsCollector};

/// Filter used by the demo cycle
const DEMO_QUERY: &str = "location=Galle";

/// Collaborators the service is assembled from
pub struct Components {
    pub stats: Arc<StatsCollector>,
    pub remote: Option<Arc<dyn RemoteTier>>,
    pub balancer: Arc<LoadBalancer>,
    pub backing: Arc<dyn BackingStore>,
    /// Health probing is disabled when None
    pub prober: Option<Arc<dyn HealthProber>>,
}

impl Components {
    /// Everything in process: no remote tier, no upstreams, the seeded
    /// catalog as backing store
    pub fn in_memory(config: &EdgeConfig) -> Self {
        let stats = Arc::new(StatsCollector::new());
        let balancer = Arc::new(LoadBalancer::new(config.balancer.clone(), Arc::clone(&stats)));
        Self {
            stats,
            remote: None,
            balancer,
            backing: Arc::new(InMemoryCatalog::seeded()),
            prober: None,
        }
    }

    /// Production wiring: Redis when configured (local-only if unreachable),
    /// the upstream store when upstreams are configured
    pub async fn from_config(config: &EdgeConfig) -> Result<Self> {
        let stats = Arc::new(StatsCollector::new());

        let remote = match &config.redis_url {
            Some(url) => {
                let timeout = Duration::from_millis(config.redis_timeout_ms);
                match RedisRemoteTier::connect(url, config.redis_prefix.clone(), timeout).await {
                    Ok(tier) => {
                        info!("Connected to remote cache tier");
                        Some(Arc::new(tier) as Arc<dyn RemoteTier>)
                    }
                    Err(e) => {
                        warn!("{}; running with the local cache tier only", e);
                        None
                    }
                }
            }
            None => None,
        };

        let balancer = Arc::new(LoadBalancer::with_instances(
            config.balancer.clone(),
            config.upstreams.iter().cloned(),
            Arc::clone(&stats),
        ));

        let (backing, prober) = if balancer.is_empty() {
            info!("No upstreams configured, serving the in-memory catalog");
            (Arc::new(InMemoryCatalog::seeded()) as Arc<dyn BackingStore>, None)
        } else {
            let store = UpstreamStore::new(Arc::clone(&balancer), config.upstream.clone())?;
            let prober: Arc<dyn HealthProber> = Arc::new(HttpProber::new(&config.probe)?);
            (Arc::new(store) as Arc<dyn BackingStore>, Some(prober))
        };

        Ok(Self {
            stats,
            remote,
            balancer,
            backing,
            prober,
        })
    }
}

/// Result of one catalog read
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    /// Normalized cache key
    pub key: String,
    pub source: FetchSource,
    pub response: PreparedResponse,
}

/// Per-layer figures for the stats report
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerReport {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<usize>,
}

/// `GET stats` body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub window_start: DateTime<Utc>,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub total_requests: u64,
    pub rate_limited: u64,
    pub memory_usage: u64,
    pub layer_stats: BTreeMap<String, LayerReport>,
    pub latency: BTreeMap<String, LatencySnapshot>,
    pub health_events: Vec<HealthEvent>,
}

/// Security posture summary
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityReport {
    pub status: &'static str,
    pub checks: BTreeMap<&'static str, bool>,
    pub recommendations: Vec<String>,
}

/// `GET health` body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub load_balancer: BalancerSnapshot,
    pub remote_cache_available: bool,
    pub security: SecurityReport,
}

/// `GET demo` body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoReport {
    pub key: String,
    pub first_source: String,
    pub second_source: String,
    pub first_ms: f64,
    pub second_ms: f64,
}

fn source_name(source: FetchSource) -> String {
    match source {
        FetchSource::Cache(layer) => format!("cache:{}", layer),
        FetchSource::Backing => "backing".to_string(),
        FetchSource::Coalesced => "coalesced".to_string(),
    }
}

/// The edge service
pub struct EdgeService {
    config: EdgeConfig,
    cache: Arc<CacheService>,
    limiter: Arc<RateLimiter>,
    balancer: Arc<LoadBalancer>,
    stats: Arc<StatsCollector>,
    backing: Arc<dyn BackingStore>,
    prober: Option<Arc<dyn HealthProber>>,
    normalizer: Normalizer,
    optimizer: QueryOptimizer,
    response: ResponseOptimizer,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EdgeService {
    /// Assemble the service
    pub fn new(config: EdgeConfig, components: Components) -> Self {
        let cache = Arc::new(CacheService::new(
            config.cache.clone(),
            components.remote,
            Arc::clone(&components.stats),
        ));
        Self {
            limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            normalizer: Normalizer::new(&config.normalizer),
            optimizer: QueryOptimizer::new(config.optimizer.clone()),
            response: ResponseOptimizer::new(config.response.clone()),
            cache,
            balancer: components.balancer,
            stats: components.stats,
            backing: components.backing,
            prober: components.prober,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        }
    }

    pub fn config(&self) -> &EdgeConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheService> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    /// Token cancelled on shutdown
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // =========================================================================
    // Request Path
    // =========================================================================

    /// Admission control for one request from `identity`
    pub fn admit(&self, identity: &str) -> Result<RateDecision> {
        self.stats.record_request();
        let decision = self.limiter.allow(identity);
        if !decision.allowed {
            self.stats.record_rate_limited();
            warn!(identity, retry_after = decision.retry_after_secs, "Rate limit exceeded");
        }
        decision.check(identity)
    }

    /// Serve a catalog read. Admission is the caller's job.
    #[instrument(skip(self, request))]
    pub async fn read(
        &self,
        collection: Collection,
        query_string: &str,
        request: RequestHeaders<'_>,
    ) -> Result<ReadOutcome> {
        let filter_map = parse_query_string(query_string)?;
        self.read_filter(collection, &filter_map, request).await
    }

    /// Serve a catalog read for an already parsed filter
    pub async fn read_filter(
        &self,
        collection: Collection,
        filter_map: &Map<String, Value>,
        request: RequestHeaders<'_>,
    ) -> Result<ReadOutcome> {
        let key = self.normalizer.normalize(collection.name(), filter_map);
        let filter = CatalogFilter::from_map(filter_map)?;
        let query = self.optimizer.build_query(collection, &filter)?;

        let backing = Arc::clone(&self.backing);
        let fetched = self
            .cache
            .get_or_fetch(&key, 0, vec![collection.name().to_string()], move || async move {
                let items = backing.fetch(&query).await?;
                let body = json!({
                    "collection": collection.name(),
                    "count": items.len(),
                    "items": items,
                });
                Ok::<_, Error>(Bytes::from(serde_json::to_vec(&body)?))
            })
            .await?;

        let started = Instant::now();
        let status = if fetched.source.is_hit() {
            CacheStatus::Hit
        } else {
            CacheStatus::Miss
        };
        let response = self
            .response
            .prepare(request, fetched.value, fetched.ttl.as_secs(), status);
        self.stats.record_latency(component::RESPONSE, started.elapsed());

        Ok(ReadOutcome {
            key,
            source: fetched.source,
            response,
        })
    }

    /// Populate-then-hit cycle on a representative filter
    pub async fn run_demo(&self) -> Result<DemoReport> {
        let started = Instant::now();
        let first = self
            .read(Collection::Venues, DEMO_QUERY, RequestHeaders::default())
            .await?;
        let first_ms = started.elapsed().as_secs_f64() * 1000.0;

        let started = Instant::now();
        let second = self
            .read(Collection::Venues, DEMO_QUERY, RequestHeaders::default())
            .await?;
        let second_ms = started.elapsed().as_secs_f64() * 1000.0;

        Ok(DemoReport {
            key: first.key,
            first_source: source_name(first.source),
            second_source: source_name(second.source),
            first_ms,
            second_ms,
        })
    }

    // =========================================================================
    // Reports
    // =========================================================================

    /// Dashboard statistics
    pub fn stats_report(&self) -> StatsReport {
        let snapshot = self.stats.snapshot();
        let cache = self.cache.stats();

        let layer_stats = snapshot
            .layers
            .iter()
            .map(|(name, layer)| {
                let (size, entries) = match name.as_str() {
                    "local" => (Some(cache.local.size_bytes), Some(cache.local.entries)),
                    _ => (None, None),
                };
                (
                    name.clone(),
                    LayerReport {
                        hits: layer.hits,
                        misses: layer.misses,
                        hit_rate: layer.hit_rate,
                        size,
                        entries,
                    },
                )
            })
            .collect();

        StatsReport {
            window_start: snapshot.window_start,
            hits: snapshot.hits,
            misses: snapshot.misses,
            hit_rate: snapshot.hit_rate,
            total_requests: snapshot.total_requests,
            rate_limited: snapshot.rate_limited,
            memory_usage: self.cache.memory_usage(),
            layer_stats,
            latency: snapshot.latency,
            health_events: snapshot.health_events,
        }
    }

    /// Upstream and posture summary
    pub fn health_report(&self) -> HealthReport {
        let load_balancer = self.balancer.snapshot();
        let has_capacity = load_balancer.total_instances == 0 || load_balancer.healthy_instances > 0;
        let remote_available = self.cache.remote_available();

        let mut checks = BTreeMap::new();
        checks.insert("rateLimiting", self.limiter.config().enabled);
        checks.insert("remoteCache", remote_available);
        checks.insert("healthProbing", self.prober.is_some() || self.balancer.is_empty());
        checks.insert("upstreamCapacity", has_capacity);

        let recommendations = checks
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(name, _)| {
                match *name {
                    "rateLimiting" => "Enable rate limiting to protect the catalog from bursts",
                    "remoteCache" => "Configure a reachable shared cache tier (REDIS_URL)",
                    "healthProbing" => "Enable health probing for upstream instances",
                    _ => "Restore at least one healthy upstream instance",
                }
                .to_string()
            })
            .collect::<Vec<_>>();

        HealthReport {
            status: if has_capacity { "ok" } else { "degraded" },
            load_balancer,
            remote_cache_available: remote_available,
            security: SecurityReport {
                status: if recommendations.is_empty() { "secure" } else { "warning" },
                checks,
                recommendations,
            },
        }
    }

    /// Whether the service can answer reads right now
    pub fn is_ready(&self) -> bool {
        !self.cancel.is_cancelled()
            && (self.balancer.is_empty() || self.balancer.snapshot().healthy_instances > 0)
    }

    // =========================================================================
    // Background Tasks
    // =========================================================================

    /// Start the rate-window sweep, the health monitor, the cache purge, and
    /// the stats rollover. They stop on [`shutdown`](Self::shutdown).
    pub fn start_background_tasks(&self) {
        let mut tasks = self.tasks.lock();

        tasks.push(Arc::clone(&self.limiter).spawn_sweeper(self.cancel.clone()));

        if let Some(prober) = &self.prober {
            if !self.balancer.is_empty() {
                tasks.push(spawn_health_monitor(
                    Arc::clone(&self.balancer),
                    Arc::clone(prober),
                    self.config.probe.clone(),
                    self.cancel.clone(),
                ));
            }
        }

        tasks.push(spawn_cache_purge(
            Arc::clone(&self.cache),
            Duration::from_secs(self.config.purge_interval_secs.max(1)),
            self.cancel.clone(),
        ));

        tasks.push(Arc::clone(&self.stats).spawn_rollover(
            Duration::from_secs(self.config.stats_window_secs.max(1)),
            self.cancel.clone(),
        ));

        info!(tasks = tasks.len(), "Background tasks started");
    }

    /// Cancel background tasks and wait for them to finish
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Edge service stopped");
    }
}

fn spawn_cache_purge(
    cache: Arc<CacheService>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    cache.purge_expired();
                }
            }
        }
    })
}

// =============================================================================
// Tests
// =============================================================================
