//! Rate Limiter - Fixed-window admission control per client identity
//!
//! One window per identity in a sharded concurrent map. Check-and-increment
//! happens under the shard's write lock, so concurrent calls for the same
//! identity can neither lose updates nor double-admit.
//!
//! Windows inactive for longer than twice their size are evicted by a
//! background sweep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Rate limit configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Requests admitted per window
    pub limit: u32,
    pub window_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: 100,
            window_secs: 60,
            sweep_interval_secs: 30,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the window resets; zero when allowed
    pub retry_after_secs: u64,
}

impl RateDecision {
    /// `Err(RateLimitExceeded)` when denied
    pub fn check(self, identity: &str) -> Result<Self> {
        if self.allowed {
            Ok(self)
        } else {
            Err(Error::RateLimitExceeded {
                identity: identity.to_string(),
                remaining: self.remaining,
                retry_after_secs: self.retry_after_secs,
            })
        }
    }
}

/// Request window for one identity
#[derive(Debug)]
struct RateWindow {
    count: u32,
    window_start: Instant,
    window: Duration,
    last_seen: Instant,
}

/// Per-identity rate limiter
pub struct RateLimiter {
    windows: DashMap<String, RateWindow>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admit one request from `identity` under the configured limit
    pub fn allow(&self, identity: &str) -> RateDecision {
        if !self.config.enabled {
            return RateDecision {
                allowed: true,
                limit: self.config.limit,
                remaining: self.config.limit,
                retry_after_secs: 0,
            };
        }
        self.allow_at(identity, self.config.limit, self.config.window(), Instant::now())
    }

    /// Admit one request from `identity` under an explicit limit
    pub fn allow_with(&self, identity: &str, limit: u32, window: Duration) -> RateDecision {
        self.allow_at(identity, limit, window, Instant::now())
    }

    /// Admit one request at `now`
    pub fn allow_at(&self, identity: &str, limit: u32, window: Duration, now: Instant) -> RateDecision {
        let mut entry = self
            .windows
            .entry(identity.to_string())
            .or_insert_with(|| RateWindow {
                count: 0,
                window_start: now,
                window,
                last_seen: now,
            });
        let w = entry.value_mut();

        if now.saturating_duration_since(w.window_start) >= window {
            w.count = 0;
            w.window_start = now;
        }
        w.window = window;
        w.last_seen = now;
        w.count = w.count.saturating_add(1);

        let allowed = w.count <= limit;
        let retry_after_secs = if allowed {
            0
        } else {
            let reset_in = window.saturating_sub(now.saturating_duration_since(w.window_start));
            // Round up so clients never retry inside the window
            (reset_in.as_millis() as u64).div_ceil(1000).max(1)
        };

        RateDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(w.count),
            retry_after_secs,
        }
    }

    /// Evict windows idle for more than twice their size. Returns the number
    /// evicted.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.last_seen) <= w.window.saturating_mul(2));
        let evicted = before.saturating_sub(self.windows.len());
        if evicted > 0 {
            debug!(evicted, "Swept idle rate windows");
        }
        evicted
    }

    /// Number of tracked identities
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Spawn the periodic sweep. It runs until `cancel` fires.
    pub fn spawn_sweeper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "Rate window sweeper started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }
            info!("Rate window sweeper stopped");
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
