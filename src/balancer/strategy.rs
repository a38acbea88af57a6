//! Selection Strategies
//!
//! Each strategy picks one index out of a candidate set. Callers restrict the
//! candidates to healthy instances before asking.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use super::instance::Instance;
use crate::error::Error;

/// Instance selection strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Cycle through candidates in order
    #[default]
    RoundRobin,
    /// Smooth weighted round-robin
    WeightedRoundRobin,
    /// Lowest last observed latency
    LeastLatency,
}

impl Strategy {
    /// Stable name
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::WeightedRoundRobin => "weighted_round_robin",
            Strategy::LeastLatency => "least_latency",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" | "rr" => Ok(Strategy::RoundRobin),
            "weighted_round_robin" | "weighted" | "wrr" => Ok(Strategy::WeightedRoundRobin),
            "least_latency" | "latency" => Ok(Strategy::LeastLatency),
            other => Err(Error::Config(format!("unknown balancing strategy '{}'", other))),
        }
    }
}

/// Strategy plus the state it needs between picks
#[derive(Debug)]
pub(crate) struct Selector {
    strategy: Strategy,
    cursor: AtomicUsize,
}

impl Selector {
    pub(crate) fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub(crate) fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Pick one of `candidates` (indices into `instances`)
    pub(crate) fn select(&self, instances: &mut [Instance], candidates: &[usize]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        match self.strategy {
            Strategy::RoundRobin => {
                let n = self.cursor.fetch_add(1, Ordering::Relaxed);
                Some(candidates[n % candidates.len()])
            }
            Strategy::WeightedRoundRobin => {
                // nginx smooth weighted round-robin
                let total: i64 = candidates.iter().map(|&i| instances[i].weight as i64).sum();
                let mut best: Option<usize> = None;
                for &i in candidates {
                    instances[i].current_weight += instances[i].weight as i64;
                    let better = match best {
                        Some(b) => instances[i].current_weight > instances[b].current_weight,
                        None => true,
                    };
                    if better {
                        best = Some(i);
                    }
                }
                if let Some(b) = best {
                    instances[b].current_weight -= total;
                }
                best
            }
            Strategy::LeastLatency => {
                // Unmeasured instances score zero so they get measured first
                let score = |i: usize| instances[i].last_latency_ms.unwrap_or(0.0);
                let best = candidates.iter().map(|&i| score(i)).min_by(f64::total_cmp)?;
                let tied: Vec<usize> = candidates
                    .iter()
                    .copied()
                    .filter(|&i| score(i).total_cmp(&best).is_eq())
                    .collect();
                let n = self.cursor.fetch_add(1, Ordering::Relaxed);
                Some(tied[n % tied.len()])
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::instance::{HealthState, InstanceSpec};

    fn instances(weights: &[u32]) -> Vec<Instance> {
        weights
            .iter()
            .enumerate()
            .map(|(i, &w)| {
                Instance::new(
                    InstanceSpec {
                        id: format!("i{}", i),
                        address: format!("http://i{}", i),
                        weight: w,
                    },
                    HealthState::Healthy,
                )
            })
            .collect()
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!("round-robin".parse::<Strategy>().unwrap(), Strategy::RoundRobin);
        assert_eq!("WRR".parse::<Strategy>().unwrap(), Strategy::WeightedRoundRobin);
        assert_eq!("least_latency".parse::<Strategy>().unwrap(), Strategy::LeastLatency);
        assert!("random".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_round_robin_cycles() {
        let selector = Selector::new(Strategy::RoundRobin);
        let mut list = instances(&[1, 1, 1]);
        let picks: Vec<usize> = (0..6)
            .filter_map(|_| selector.select(&mut list, &[0, 1, 2]))
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_weighted_round_robin_is_smooth() {
        let selector = Selector::new(Strategy::WeightedRoundRobin);
        let mut list = instances(&[5, 1, 1]);
        let picks: Vec<usize> = (0..7)
            .filter_map(|_| selector.select(&mut list, &[0, 1, 2]))
            .collect();

        assert_eq!(picks.iter().filter(|&&p| p == 0).count(), 5);
        assert_eq!(picks.iter().filter(|&&p| p == 1).count(), 1);
        assert_eq!(picks.iter().filter(|&&p| p == 2).count(), 1);
        // Heavy instance is interleaved, not picked five times in a row
        assert_eq!(picks, vec![0, 0, 1, 0, 2, 0, 0]);
    }

    #[test]
    fn test_least_latency() {
        let selector = Selector::new(Strategy::LeastLatency);
        let mut list = instances(&[1, 1, 1]);
        list[0].last_latency_ms = Some(40.0);
        list[1].last_latency_ms = Some(5.0);
        list[2].last_latency_ms = Some(20.0);

        assert_eq!(selector.select(&mut list, &[0, 1, 2]), Some(1));
        assert_eq!(selector.select(&mut list, &[0, 2]), Some(2));
    }

    #[test]
    fn test_least_latency_rotates_ties() {
        let selector = Selector::new(Strategy::LeastLatency);
        let mut list = instances(&[1, 1, 1]);
        let picks: Vec<usize> = (0..6)
            .filter_map(|_| selector.select(&mut list, &[0, 1, 2]))
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);

        // Only the two fastest share the load
        list[0].last_latency_ms = Some(8.0);
        list[1].last_latency_ms = Some(3.0);
        list[2].last_latency_ms = Some(3.0);
        let picks: Vec<usize> = (0..4)
            .filter_map(|_| selector.select(&mut list, &[0, 1, 2]))
            .collect();
        assert_eq!(picks.iter().filter(|&&p| p == 1).count(), 2);
        assert_eq!(picks.iter().filter(|&&p| p == 2).count(), 2);
    }

    #[test]
    fn test_empty_candidates() {
        let selector = Selector::new(Strategy::RoundRobin);
        let mut list = instances(&[1]);
        assert_eq!(selector.select(&mut list, &[]), None);
    }
}
