//! Configuration
//!
//! Every component owns a config struct with defaults. `EdgeConfig` gathers
//! them and can be loaded from YAML; command-line flags and environment
//! variables override file values.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::backing::UpstreamConfig;
use crate::balancer::{BalancerConfig, InstanceSpec, ProbeConfig};
use crate::cache::CacheConfig;
use crate::error::{Error, Result};
use crate::query::{NormalizerConfig, OptimizerConfig};
use crate::ratelimit::RateLimitConfig;
use crate::response::ResponseConfig;

/// Upper bound for rate and stats windows (one week)
const MAX_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Catalog Edge - caching, rate limiting, and load balancing for the catalog API
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// YAML configuration file
    #[arg(long, env = "EDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(long, env = "LISTEN_ADDR")]
    pub listen_addr: Option<String>,

    /// Redis URL for the shared cache tier (local-only when unset)
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Upstream catalog instances, comma separated `id=address[@weight]`
    #[arg(long, env = "UPSTREAMS", value_delimiter = ',')]
    pub upstreams: Vec<String>,

    /// Balancing strategy (round_robin, weighted_round_robin, least_latency)
    #[arg(long, env = "LB_STRATEGY")]
    pub strategy: Option<String>,

    /// Default cache TTL in seconds
    #[arg(long, env = "DEFAULT_TTL_SECONDS")]
    pub default_ttl: Option<u64>,

    /// Requests admitted per client per window
    #[arg(long, env = "RATE_LIMIT")]
    pub rate_limit: Option<u32>,

    /// Rate limit window in seconds
    #[arg(long, env = "RATE_WINDOW_SECONDS")]
    pub rate_window: Option<u64>,

    /// Length of a stats reporting window in seconds
    #[arg(long, env = "STATS_WINDOW_SECONDS")]
    pub stats_window: Option<u64>,

    /// Health probe interval in milliseconds
    #[arg(long, env = "PROBE_INTERVAL_MS")]
    pub probe_interval: Option<u64>,

    /// Health probe timeout in milliseconds
    #[arg(long, env = "PROBE_TIMEOUT_MS")]
    pub probe_timeout: Option<u64>,

    /// Backing fetch timeout in milliseconds
    #[arg(long, env = "FETCH_TIMEOUT_MS")]
    pub fetch_timeout: Option<u64>,

    /// Consecutive passing probes before an instance is healthy again
    #[arg(long, env = "HEALTHY_THRESHOLD")]
    pub healthy_threshold: Option<u32>,

    /// Local cache tier capacity in bytes
    #[arg(long, env = "LOCAL_CACHE_CAPACITY_BYTES")]
    pub local_capacity_bytes: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Args {
    /// Load the config file (if any), apply overrides, and validate
    pub fn to_config(&self) -> Result<EdgeConfig> {
        let mut config = match &self.config {
            Some(path) => EdgeConfig::load(path)?,
            None => EdgeConfig::default(),
        };
        self.apply(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, config: &mut EdgeConfig) -> Result<()> {
        if let Some(addr) = &self.listen_addr {
            config.listen_addr = addr.clone();
        }
        if let Some(url) = &self.redis_url {
            config.redis_url = Some(url.clone());
        }
        if !self.upstreams.is_empty() {
            config.upstreams = self
                .upstreams
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect::<Result<Vec<InstanceSpec>>>()?;
        }
        if let Some(strategy) = &self.strategy {
            config.balancer.strategy = strategy.parse()?;
        }
        if let Some(ttl) = self.default_ttl {
            config.cache.default_ttl_secs = ttl;
        }
        if let Some(limit) = self.rate_limit {
            config.rate_limit.limit = limit;
        }
        if let Some(window) = self.rate_window {
            config.rate_limit.window_secs = window;
        }
        if let Some(window) = self.stats_window {
            config.stats_window_secs = window;
        }
        if let Some(interval) = self.probe_interval {
            config.probe.interval_ms = interval;
        }
        if let Some(timeout) = self.probe_timeout {
            config.probe.timeout_ms = timeout;
        }
        if let Some(timeout) = self.fetch_timeout {
            config.cache.fetch_timeout_ms = timeout;
        }
        if let Some(threshold) = self.healthy_threshold {
            config.balancer.healthy_threshold = threshold;
        }
        if let Some(capacity) = self.local_capacity_bytes {
            config.cache.local.capacity_bytes = capacity;
        }
        Ok(())
    }
}

// =============================================================================
// Edge Configuration
// =============================================================================

/// Full service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub listen_addr: String,
    /// Shared cache tier; local-only when unset
    pub redis_url: Option<String>,
    /// Prefix for every remote key
    pub redis_prefix: String,
    /// Deadline for connecting to and each command against the remote tier
    pub redis_timeout_ms: u64,
    /// Upstream catalog instances; the seeded in-memory catalog is used when
    /// empty
    pub upstreams: Vec<InstanceSpec>,
    /// Interval of the local-tier expiry purge
    pub purge_interval_secs: u64,
    /// Stats counters reset at the end of each window
    pub stats_window_secs: u64,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub balancer: BalancerConfig,
    pub probe: ProbeConfig,
    pub upstream: UpstreamConfig,
    pub response: ResponseConfig,
    pub normalizer: NormalizerConfig,
    pub optimizer: OptimizerConfig,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            redis_url: None,
            redis_prefix: "catalog-edge:".to_string(),
            redis_timeout_ms: 250,
            upstreams: Vec::new(),
            purge_interval_secs: 30,
            stats_window_secs: 3600,
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            balancer: BalancerConfig::default(),
            probe: ProbeConfig::default(),
            upstream: UpstreamConfig::default(),
            response: ResponseConfig::default(),
            normalizer: NormalizerConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl EdgeConfig {
    /// Parse a YAML document
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Read and parse a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    /// Parsed listen address
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen address '{}': {}", self.listen_addr, e)))
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;

        if self.rate_limit.enabled {
            if self.rate_limit.limit == 0 {
                return Err(Error::Config("rate limit must be greater than zero".into()));
            }
            if self.rate_limit.window_secs == 0 {
                return Err(Error::Config("rate limit window must be greater than zero".into()));
            }
            if self.rate_limit.window_secs > MAX_WINDOW_SECS {
                return Err(Error::Config(format!(
                    "rate limit window must be at most {} seconds",
                    MAX_WINDOW_SECS
                )));
            }
        }
        if self.balancer.healthy_threshold == 0 {
            return Err(Error::Config("healthy threshold must be greater than zero".into()));
        }
        if self.probe.interval_ms == 0 || self.probe.timeout_ms == 0 {
            return Err(Error::Config("probe interval and timeout must be greater than zero".into()));
        }
        if self.cache.fetch_timeout_ms == 0 {
            return Err(Error::Config("fetch timeout must be greater than zero".into()));
        }
        if self.purge_interval_secs == 0 {
            return Err(Error::Config("purge interval must be greater than zero".into()));
        }
        if self.stats_window_secs == 0 || self.stats_window_secs > MAX_WINDOW_SECS {
            return Err(Error::Config(format!(
                "stats window must be between 1 and {} seconds",
                MAX_WINDOW_SECS
            )));
        }

        let local = &self.cache.local;
        if !(0.0 < local.low_watermark
            && local.low_watermark < local.high_watermark
            && local.high_watermark <= 1.0)
        {
            return Err(Error::Config(format!(
                "local cache watermarks must satisfy 0 < low < high <= 1 (got {} / {})",
                local.low_watermark, local.high_watermark
            )));
        }
        if self.optimizer.max_page_size == 0 {
            return Err(Error::Config("max page size must be greater than zero".into()));
        }

        let mut ids = HashSet::new();
        for upstream in &self.upstreams {
            if !ids.insert(upstream.id.as_str()) {
                return Err(Error::Config(format!("duplicate upstream id '{}'", upstream.id)));
            }
            if upstream.weight == 0 {
                return Err(Error::Config(format!("upstream '{}' has zero weight", upstream.id)));
            }
            if !(upstream.address.starts_with("http://") || upstream.address.starts_with("https://")) {
                return Err(Error::Config(format!(
                    "upstream '{}' address must be an http(s) URL",
                    upstream.id
                )));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
