//! Upstream Load Balancer
//!
//! Tracks upstream catalog instances, classifies their health with
//! hysteresis, and picks one per outbound request.
//!
//! # Design
//!
//! - Instance registry behind a short-held lock, never held across I/O
//! - Health changes come from the probe loop and from request outcomes
//! - Selection is restricted to healthy instances; with none healthy the
//!   failure policy decides between degraded service and refusal

mod instance;
mod probe;
mod strategy;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use instance::{HealthState, Instance, InstanceSpec};
pub use probe::{probe_all, spawn_health_monitor, HealthProber, HttpProber, ProbeConfig};
pub use strategy::Strategy;

use strategy::Selector;

use crate::error::{Error, Result};
use crate::stats::StatsCollector;

/// Behaviour when no instance is healthy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Serve from the least-recently-failed suspect, then the most recently
    /// healthy unhealthy instance
    #[default]
    FailOpen,
    /// Refuse with `NoUpstreamAvailable`
    FailClosed,
}

/// Load balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub strategy: Strategy,
    pub failure_policy: FailurePolicy,
    /// Consecutive passes needed to become healthy again
    pub healthy_threshold: u32,
    /// State of newly registered instances
    pub initial_state: HealthState,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::RoundRobin,
            failure_policy: FailurePolicy::FailOpen,
            healthy_threshold: 3,
            initial_state: HealthState::Healthy,
        }
    }
}

/// Result of a request sent to an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success(Duration),
    Timeout,
    Failure,
}

/// Aggregate view for the health endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancerSnapshot {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub suspect_instances: usize,
    pub unhealthy_instances: usize,
    /// Mean of the last observed latencies, in milliseconds
    pub average_response_time: f64,
    pub strategy: String,
    pub failure_policy: FailurePolicy,
    pub instances: Vec<Instance>,
}

/// Upstream load balancer
pub struct LoadBalancer {
    instances: RwLock<Vec<Instance>>,
    selector: Selector,
    config: BalancerConfig,
    stats: Arc<StatsCollector>,
}

impl LoadBalancer {
    /// Create an empty balancer
    pub fn new(config: BalancerConfig, stats: Arc<StatsCollector>) -> Self {
        Self {
            instances: RwLock::new(Vec::new()),
            selector: Selector::new(config.strategy),
            config,
            stats,
        }
    }

    /// Create a balancer with the given instances registered
    pub fn with_instances(
        config: BalancerConfig,
        specs: impl IntoIterator<Item = InstanceSpec>,
        stats: Arc<StatsCollector>,
    ) -> Self {
        let lb = Self::new(config, stats);
        for spec in specs {
            lb.register(spec);
        }
        lb
    }

    /// Selection strategy
    pub fn strategy(&self) -> Strategy {
        self.selector.strategy()
    }

    /// Register an instance in the configured initial state.
    ///
    /// Re-registering an id updates its address and weight but keeps its
    /// health. Returns true if the id was new.
    pub fn register(&self, spec: InstanceSpec) -> bool {
        self.register_with_state(spec, self.config.initial_state)
    }

    /// Register an instance in an explicit state
    pub fn register_with_state(&self, spec: InstanceSpec, state: HealthState) -> bool {
        let mut instances = self.instances.write();
        if let Some(existing) = instances.iter_mut().find(|i| i.id == spec.id) {
            existing.address = spec.address;
            existing.weight = spec.weight.max(1);
            return false;
        }
        info!(id = %spec.id, address = %spec.address, weight = spec.weight, "Registered upstream instance");
        instances.push(Instance::new(spec, state));
        true
    }

    /// Remove an instance
    pub fn deregister(&self, id: &str) -> bool {
        let mut instances = self.instances.write();
        let before = instances.len();
        instances.retain(|i| i.id != id);
        let removed = instances.len() < before;
        if removed {
            info!(id, "Deregistered upstream instance");
        }
        removed
    }

    /// Pick an instance for the next request
    pub fn pick(&self) -> Result<Instance> {
        self.pick_excluding(&[])
    }

    /// Pick an instance, skipping ids already tried for this request
    pub fn pick_excluding(&self, excluded: &[String]) -> Result<Instance> {
        let mut instances = self.instances.write();
        let allowed = |id: &str| !excluded.iter().any(|e| e == id);

        let healthy: Vec<usize> = instances
            .iter()
            .enumerate()
            .filter(|&(_, i)| i.is_healthy() && allowed(i.id.as_str()))
            .map(|(idx, _)| idx)
            .collect();

        if let Some(idx) = self.selector.select(&mut instances, &healthy) {
            return Ok(instances[idx].clone());
        }

        if self.config.failure_policy == FailurePolicy::FailClosed {
            return Err(Error::NoUpstreamAvailable(
                "no healthy upstream instances".into(),
            ));
        }

        // Least recently failed suspect (never failed sorts first)
        let suspect = instances
            .iter()
            .filter(|i| i.health == HealthState::Suspect && allowed(i.id.as_str()))
            .min_by_key(|i| i.last_failure_at);
        if let Some(instance) = suspect {
            warn!(id = %instance.id, "No healthy upstream, failing open to suspect instance");
            return Ok(instance.clone());
        }

        // Most recently healthy of the rest
        let fallback = instances
            .iter()
            .filter(|i| allowed(i.id.as_str()))
            .max_by_key(|i| i.last_healthy_at);
        match fallback {
            Some(instance) => {
                warn!(id = %instance.id, "No healthy upstream, failing open to unhealthy instance");
                Ok(instance.clone())
            }
            None => Err(Error::NoUpstreamAvailable(if instances.is_empty() {
                "no upstream instances registered".into()
            } else {
                "every upstream instance was tried".into()
            })),
        }
    }

    /// Feed back the result of a request sent to `id`
    pub fn record_outcome(&self, id: &str, outcome: Outcome) {
        match outcome {
            Outcome::Success(latency) => {
                let mut instances = self.instances.write();
                if let Some(instance) = instances.iter_mut().find(|i| i.id == id) {
                    instance.last_latency_ms = Some(latency.as_secs_f64() * 1000.0);
                    if instance.is_healthy() {
                        instance.last_healthy_at = Some(Instant::now());
                    }
                }
            }
            Outcome::Timeout | Outcome::Failure => {
                self.apply(id, |i, now| i.record_failure(now));
            }
        }
    }

    /// Apply a probe result
    pub(crate) fn record_probe(&self, id: &str, result: std::result::Result<Duration, String>) {
        let threshold = self.config.healthy_threshold;
        match result {
            Ok(latency) => self.apply(id, |i, now| i.record_pass(Some(latency), threshold, now)),
            Err(reason) => {
                tracing::debug!(id, %reason, "Health probe failed");
                self.apply(id, |i, now| i.record_failure(now))
            }
        }
    }

    fn apply<F>(&self, id: &str, f: F)
    where
        F: FnOnce(&mut Instance, Instant) -> Option<(HealthState, HealthState)>,
    {
        let transition = {
            let mut instances = self.instances.write();
            instances
                .iter_mut()
                .find(|i| i.id == id)
                .and_then(|i| f(i, Instant::now()))
        };

        if let Some((from, to)) = transition {
            if to == HealthState::Healthy {
                info!(id, %from, %to, "Upstream health changed");
            } else {
                warn!(id, %from, %to, "Upstream health changed");
            }
            self.stats.record_health_change(id, from, to);
        }
    }

    /// Look up one instance
    pub fn instance(&self, id: &str) -> Option<Instance> {
        self.instances.read().iter().find(|i| i.id == id).cloned()
    }

    /// All instances
    pub fn instances(&self) -> Vec<Instance> {
        self.instances.read().clone()
    }

    /// Number of registered instances
    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    /// True if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    /// Aggregate view for the health endpoint
    pub fn snapshot(&self) -> BalancerSnapshot {
        let instances = self.instances();
        let count = |state| instances.iter().filter(|i| i.health == state).count();
        let latencies: Vec<f64> = instances.iter().filter_map(|i| i.last_latency_ms).collect();
        let average_response_time = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };

        BalancerSnapshot {
            total_instances: instances.len(),
            healthy_instances: count(HealthState::Healthy),
            suspect_instances: count(HealthState::Suspect),
            unhealthy_instances: count(HealthState::Unhealthy),
            average_response_time,
            strategy: self.strategy().to_string(),
            failure_policy: self.config.failure_policy,
            instances,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn spec(id: &str) -> InstanceSpec {
        InstanceSpec {
            id: id.into(),
            address: format!("http://{}", id),
            weight: 1,
        }
    }

    fn balancer(config: BalancerConfig) -> LoadBalancer {
        LoadBalancer::new(config, Arc::new(StatsCollector::without_exporter()))
    }

    #[test]
    fn test_never_picks_unhealthy_while_healthy_exists() {
        let lb = balancer(BalancerConfig::default());
        lb.register_with_state(spec("a"), HealthState::Healthy);
        lb.register_with_state(spec("b"), HealthState::Unhealthy);

        for _ in 0..20 {
            assert_eq!(lb.pick().unwrap().id, "a");
        }
    }

    #[test]
    fn test_all_unhealthy_picks_most_recently_healthy() {
        let lb = balancer(BalancerConfig::default());
        lb.register(spec("a"));
        lb.register(spec("b"));

        // b goes down first, then a
        lb.record_outcome("b", Outcome::Failure);
        lb.record_outcome("b", Outcome::Failure);
        std::thread::sleep(Duration::from_millis(2));
        lb.record_outcome("a", Outcome::Timeout);
        lb.record_outcome("a", Outcome::Timeout);

        assert_eq!(lb.instance("a").unwrap().health, HealthState::Unhealthy);
        assert_eq!(lb.instance("b").unwrap().health, HealthState::Unhealthy);
        assert_eq!(lb.pick().unwrap().id, "a");
    }

    #[test]
    fn test_fail_open_prefers_least_recently_failed_suspect() {
        let lb = balancer(BalancerConfig::default());
        lb.register(spec("a"));
        lb.register(spec("b"));
        lb.register_with_state(spec("c"), HealthState::Unhealthy);

        lb.record_outcome("a", Outcome::Failure);
        std::thread::sleep(Duration::from_millis(2));
        lb.record_outcome("b", Outcome::Failure);

        assert_eq!(lb.pick().unwrap().id, "a");
    }

    #[test]
    fn test_fail_closed_refuses() {
        let lb = balancer(BalancerConfig {
            failure_policy: FailurePolicy::FailClosed,
            ..Default::default()
        });
        lb.register_with_state(spec("a"), HealthState::Suspect);
        assert_matches!(lb.pick(), Err(Error::NoUpstreamAvailable(_)));
    }

    #[test]
    fn test_empty_balancer_errors() {
        let lb = balancer(BalancerConfig::default());
        assert_matches!(lb.pick(), Err(Error::NoUpstreamAvailable(_)));
    }

    #[test]
    fn test_pick_excluding() {
        let lb = balancer(BalancerConfig::default());
        lb.register(spec("a"));
        lb.register(spec("b"));

        assert_eq!(lb.pick_excluding(&["a".into()]).unwrap().id, "b");
        assert_matches!(
            lb.pick_excluding(&["a".into(), "b".into()]),
            Err(Error::NoUpstreamAvailable(_))
        );
    }

    #[test]
    fn test_timeout_demotes_and_probes_restore() {
        let stats = Arc::new(StatsCollector::without_exporter());
        let lb = LoadBalancer::new(
            BalancerConfig {
                healthy_threshold: 2,
                ..Default::default()
            },
            Arc::clone(&stats),
        );
        lb.register(spec("a"));

        lb.record_outcome("a", Outcome::Timeout);
        assert_eq!(lb.instance("a").unwrap().health, HealthState::Suspect);

        lb.record_probe("a", Ok(Duration::from_millis(3)));
        assert_eq!(lb.instance("a").unwrap().health, HealthState::Suspect);
        lb.record_probe("a", Ok(Duration::from_millis(3)));
        assert_eq!(lb.instance("a").unwrap().health, HealthState::Healthy);

        let events = stats.snapshot().health_events;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].to, HealthState::Suspect);
        assert_eq!(events[1].to, HealthState::Healthy);
    }

    #[test]
    fn test_register_is_idempotent() {
        let lb = balancer(BalancerConfig::default());
        assert!(lb.register(spec("a")));
        lb.record_outcome("a", Outcome::Failure);
        assert!(!lb.register(InstanceSpec {
            weight: 4,
            ..spec("a")
        }));

        let a = lb.instance("a").unwrap();
        assert_eq!(a.weight, 4);
        assert_eq!(a.health, HealthState::Suspect);
        assert!(lb.deregister("a"));
        assert!(lb.is_empty());
    }

    #[test]
    fn test_snapshot() {
        let lb = balancer(BalancerConfig {
            strategy: Strategy::LeastLatency,
            ..Default::default()
        });
        lb.register(spec("a"));
        lb.register_with_state(spec("b"), HealthState::Unhealthy);
        lb.record_outcome("a", Outcome::Success(Duration::from_millis(10)));
        lb.record_probe("b", Ok(Duration::from_millis(30)));

        let snapshot = lb.snapshot();
        assert_eq!(snapshot.total_instances, 2);
        assert_eq!(snapshot.healthy_instances, 1);
        assert_eq!(snapshot.suspect_instances, 1);
        assert_eq!(snapshot.unhealthy_instances, 0);
        assert!((snapshot.average_response_time - 20.0).abs() < 1e-9);
        assert_eq!(snapshot.strategy, "least_latency");
    }
}
