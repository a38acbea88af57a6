//! Health Probing
//!
//! Periodic probe loop feeding the balancer's hysteresis. Runs off the
//! request path and stops when its cancellation token fires.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::instance::Instance;
use super::LoadBalancer;
use crate::error::{Error, Result};
use crate::stats::component;

/// Probe loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Time between probe rounds
    pub interval_ms: u64,
    /// Deadline for a single probe; a timed-out probe is a failure
    pub timeout_ms: u64,
    /// Path requested on each instance
    pub path: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            timeout_ms: 1_000,
            path: "/health".to_string(),
        }
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Checks whether one instance is serving
#[async_trait]
pub trait HealthProber: Send + Sync {
    /// Ok if the instance passed
    async fn probe(&self, instance: &Instance) -> Result<()>;
}

/// Probes `GET <address><path>` and expects a 2xx
pub struct HttpProber {
    client: Client,
    path: String,
}

impl HttpProber {
    /// Create a prober
    pub fn new(config: &ProbeConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            path: config.path.clone(),
        })
    }
}

#[async_trait]
impl HealthProber for HttpProber {
    async fn probe(&self, instance: &Instance) -> Result<()> {
        let url = format!("{}{}", instance.address, self.path);
        let response = self.client.get(&url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::InstanceUnhealthy {
                instance_id: format!("{} ({})", instance.id, response.status()),
            })
        }
    }
}

/// Probe every registered instance concurrently and apply the results
#[instrument(skip_all)]
pub async fn probe_all(lb: &LoadBalancer, prober: &dyn HealthProber, timeout: Duration) {
    // Probe a snapshot so the registry lock is not held across I/O
    let instances = lb.instances();
    let probes = instances.iter().map(|instance| async move {
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, prober.probe(instance)).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("probe timed out after {:?}", timeout)),
        };
        (instance.id.as_str(), started.elapsed(), result)
    });

    for (id, elapsed, result) in join_all(probes).await {
        lb.stats.record_latency(component::PROBE, elapsed);
        lb.record_probe(id, result);
    }
    debug!("Probed {} upstream instances", instances.len());
}

/// Spawn the probe loop. It runs until `cancel` fires.
pub fn spawn_health_monitor(
    lb: Arc<LoadBalancer>,
    prober: Arc<dyn HealthProber>,
    config: ProbeConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = config.interval_ms, "Health monitor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    probe_all(&lb, prober.as_ref(), config.timeout()).await;
                }
            }
        }
        info!("Health monitor stopped");
    })
}

// =============================================================================
// Tests
// =============================================================================
