//! Upstream Instances
//!
//! Instance records and the health hysteresis state machine.
//!
//! ```text
//!            pass                 N consecutive passes
//! unhealthy ──────▶ suspect ─────────────────────────▶ healthy
//!     ▲                │ ▲                                │
//!     └──── failure ───┘ └─────────── failure ────────────┘
//! ```

use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Health classification of an upstream instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Suspect,
    Unhealthy,
}

impl HealthState {
    /// Lowercase name used in logs and metric labels
    pub fn name(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Suspect => "suspect",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Static description of an upstream: `id=address[@weight]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub id: String,
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl FromStr for InstanceSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (id, rest) = s
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("upstream '{}' is not id=address[@weight]", s)))?;
        let id = id.trim();
        if id.is_empty() {
            return Err(Error::Config(format!("upstream '{}' has an empty id", s)));
        }

        let (address, weight) = match rest.rsplit_once('@') {
            Some((address, weight)) if weight.chars().all(|c| c.is_ascii_digit()) => {
                let weight: u32 = weight
                    .parse()
                    .map_err(|_| Error::Config(format!("upstream '{}' has an invalid weight", s)))?;
                (address, weight)
            }
            _ => (rest, default_weight()),
        };

        let address = address.trim().trim_end_matches('/');
        if address.is_empty() {
            return Err(Error::Config(format!("upstream '{}' has an empty address", s)));
        }
        if weight == 0 {
            return Err(Error::Config(format!("upstream '{}' has zero weight", s)));
        }

        Ok(Self {
            id: id.to_string(),
            address: address.to_string(),
            weight,
        })
    }
}

/// Upstream instance with its observed health
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub address: String,
    pub weight: u32,
    pub health: HealthState,
    pub last_latency_ms: Option<f64>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub consecutive_passes: u32,
    pub consecutive_failures: u32,
    #[serde(skip)]
    pub(crate) last_failure_at: Option<Instant>,
    #[serde(skip)]
    pub(crate) last_healthy_at: Option<Instant>,
    /// Smooth weighted round-robin accumulator
    #[serde(skip)]
    pub(crate) current_weight: i64,
}

impl Instance {
    /// Create an instance in the given initial state
    pub fn new(spec: InstanceSpec, initial: HealthState) -> Self {
        let now = Instant::now();
        Self {
            id: spec.id,
            address: spec.address,
            weight: spec.weight.max(1),
            health: initial,
            last_latency_ms: None,
            last_check_at: None,
            consecutive_passes: 0,
            consecutive_failures: 0,
            last_failure_at: None,
            last_healthy_at: (initial == HealthState::Healthy).then_some(now),
            current_weight: 0,
        }
    }

    /// Apply a passing check. Returns the transition, if any.
    pub(crate) fn record_pass(
        &mut self,
        latency: Option<Duration>,
        healthy_threshold: u32,
        now: Instant,
    ) -> Option<(HealthState, HealthState)> {
        if let Some(latency) = latency {
            self.last_latency_ms = Some(latency.as_secs_f64() * 1000.0);
        }
        self.last_check_at = Some(Utc::now());
        self.consecutive_failures = 0;
        self.consecutive_passes = self.consecutive_passes.saturating_add(1);

        let from = self.health;
        let to = match from {
            HealthState::Unhealthy => HealthState::Suspect,
            HealthState::Suspect if self.consecutive_passes >= healthy_threshold.max(1) => {
                HealthState::Healthy
            }
            other => other,
        };
        self.health = to;
        if to == HealthState::Healthy {
            self.last_healthy_at = Some(now);
        }
        (from != to).then_some((from, to))
    }

    /// Apply a failed check or request. Returns the transition, if any.
    pub(crate) fn record_failure(&mut self, now: Instant) -> Option<(HealthState, HealthState)> {
        self.last_check_at = Some(Utc::now());
        self.consecutive_passes = 0;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(now);

        let from = self.health;
        let to = match from {
            HealthState::Healthy => {
                self.last_healthy_at = Some(now);
                HealthState::Suspect
            }
            HealthState::Suspect | HealthState::Unhealthy => HealthState::Unhealthy,
        };
        self.health = to;
        (from != to).then_some((from, to))
    }

    /// Whether the instance is in the healthy set
    pub fn is_healthy(&self) -> bool {
        self.health == HealthState::Healthy
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn instance(initial: HealthState) -> Instance {
        Instance::new(
            InstanceSpec {
                id: "a".into(),
                address: "http://a".into(),
                weight: 1,
            },
            initial,
        )
    }

    #[test]
    fn test_parse_spec() {
        let spec: InstanceSpec = "api-1=http://10.0.0.1:8080@3".parse().unwrap();
        assert_eq!(spec.id, "api-1");
        assert_eq!(spec.address, "http://10.0.0.1:8080");
        assert_eq!(spec.weight, 3);

        let spec: InstanceSpec = "api-2=http://10.0.0.2:8080/".parse().unwrap();
        assert_eq!(spec.address, "http://10.0.0.2:8080");
        assert_eq!(spec.weight, 1);

        // '@' followed by something other than a number is part of the address
        let spec: InstanceSpec = "api-3=http://user@host".parse().unwrap();
        assert_eq!(spec.address, "http://user@host");
    }

    #[test]
    fn test_parse_spec_errors() {
        assert_matches!("no-equals".parse::<InstanceSpec>(), Err(Error::Config(_)));
        assert_matches!("=http://x".parse::<InstanceSpec>(), Err(Error::Config(_)));
        assert_matches!("a=".parse::<InstanceSpec>(), Err(Error::Config(_)));
        assert_matches!("a=http://x@0".parse::<InstanceSpec>(), Err(Error::Config(_)));
    }

    #[test]
    fn test_recovery_requires_consecutive_passes() {
        let mut inst = instance(HealthState::Unhealthy);
        let now = Instant::now();

        assert_eq!(
            inst.record_pass(None, 3, now),
            Some((HealthState::Unhealthy, HealthState::Suspect))
        );
        assert_eq!(inst.record_pass(None, 3, now), None);
        assert_eq!(inst.health, HealthState::Suspect);
        assert_eq!(
            inst.record_pass(Some(Duration::from_millis(12)), 3, now),
            Some((HealthState::Suspect, HealthState::Healthy))
        );
        assert_eq!(inst.last_latency_ms, Some(12.0));
    }

    #[test]
    fn test_failure_resets_pass_streak() {
        let mut inst = instance(HealthState::Unhealthy);
        let now = Instant::now();
        inst.record_pass(None, 3, now);
        inst.record_pass(None, 3, now);
        inst.record_failure(now);
        assert_eq!(inst.health, HealthState::Unhealthy);

        inst.record_pass(None, 3, now);
        inst.record_pass(None, 3, now);
        assert_eq!(inst.health, HealthState::Suspect);
    }

    #[test]
    fn test_failures_demote_one_stage_at_a_time() {
        let mut inst = instance(HealthState::Healthy);
        let now = Instant::now();

        assert_eq!(
            inst.record_failure(now),
            Some((HealthState::Healthy, HealthState::Suspect))
        );
        assert_eq!(
            inst.record_failure(now),
            Some((HealthState::Suspect, HealthState::Unhealthy))
        );
        assert_eq!(inst.record_failure(now), None);
        assert_eq!(inst.consecutive_failures, 3);
    }
}
