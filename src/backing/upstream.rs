//! Upstream catalog adapter
//!
//! Sends the optimized query to an upstream catalog instance picked by the
//! load balancer. A failed or timed-out instance is reported back to the
//! balancer and another one is tried, up to once per registered instance.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::BackingStore;
use crate::balancer::{LoadBalancer, Outcome};
use crate::error::{Error, Result};
use crate::query::OptimizedQuery;

/// Upstream adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Path the query is POSTed to on each instance
    pub query_path: String,
    /// Per-attempt request timeout
    pub request_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            query_path: "/query".to_string(),
            request_timeout_ms: 2_000,
        }
    }
}

/// Backing store reached through the load balancer
pub struct UpstreamStore {
    client: Client,
    balancer: Arc<LoadBalancer>,
    config: UpstreamConfig,
}

/// Why one attempt failed, and what the balancer should hear about it
enum AttemptError {
    /// The instance misbehaved; try another
    Instance(Outcome, Error),
    /// The query itself was rejected; retrying elsewhere will not help
    Fatal(Error),
}

impl UpstreamStore {
    /// Create the adapter
    pub fn new(balancer: Arc<LoadBalancer>, config: UpstreamConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            balancer,
            config,
        })
    }

    async fn attempt(&self, address: &str, id: &str, query: &OptimizedQuery) -> std::result::Result<Vec<Value>, AttemptError> {
        let url = format!("{}{}", address, self.config.query_path);
        let response = self.client.post(&url).json(query).send().await.map_err(|e| {
            let outcome = if e.is_timeout() {
                Outcome::Timeout
            } else {
                Outcome::Failure
            };
            AttemptError::Instance(outcome, Error::Http(e))
        })?;

        let status = response.status();
        if status.is_client_error() {
            return Err(AttemptError::Fatal(Error::BackingFetch(format!(
                "upstream {} rejected query with {}",
                id, status
            ))));
        }
        if !status.is_success() {
            return Err(AttemptError::Instance(
                Outcome::Failure,
                Error::InstanceUnhealthy {
                    instance_id: format!("{} ({})", id, status),
                },
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AttemptError::Instance(Outcome::Failure, Error::Http(e)))?;
        records_from_body(body).map_err(|e| AttemptError::Instance(Outcome::Failure, e))
    }
}

/// Accept either a bare array or `{"items": [...]}`
fn records_from_body(body: Value) -> Result<Vec<Value>> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("items") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(Error::BackingFetch("upstream response has no items array".into())),
        },
        _ => Err(Error::BackingFetch("upstream response is not a record list".into())),
    }
}

#[async_trait]
impl BackingStore for UpstreamStore {
    #[instrument(skip_all, fields(collection = %query.collection))]
    async fn fetch(&self, query: &OptimizedQuery) -> Result<Vec<Value>> {
        let attempts = self.balancer.len().max(1);
        let mut tried: Vec<String> = Vec::with_capacity(attempts);
        let mut last_error: Option<Error> = None;

        for _ in 0..attempts {
            let instance = match self.balancer.pick_excluding(&tried) {
                Ok(instance) => instance,
                Err(e) => {
                    last_error.get_or_insert(e);
                    break;
                }
            };

            let started = Instant::now();
            match self.attempt(&instance.address, &instance.id, query).await {
                Ok(records) => {
                    self.balancer
                        .record_outcome(&instance.id, Outcome::Success(started.elapsed()));
                    debug!(id = %instance.id, records = records.len(), "Upstream fetch succeeded");
                    return Ok(records);
                }
                Err(AttemptError::Fatal(e)) => {
                    self.balancer
                        .record_outcome(&instance.id, Outcome::Success(started.elapsed()));
                    return Err(e);
                }
                Err(AttemptError::Instance(outcome, e)) => {
                    warn!(id = %instance.id, error = %e, "Upstream attempt failed, re-selecting");
                    self.balancer.record_outcome(&instance.id, outcome);
                    tried.push(instance.id);
                    last_error = Some(e);
                }
            }
        }

        Err(Error::NoUpstreamAvailable(match last_error {
            Some(e) => format!("{} attempt(s) failed, last error: {}", tried.len(), e),
            None => "no upstream instances registered".to_string(),
        }))
    }

    fn name(&self) -> &'static str {
        "upstream"
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{BalancerConfig, HealthState, InstanceSpec};
    use crate::query::{CatalogFilter, Collection, QueryOptimizer};
    use crate::stats::StatsCollector;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn query() -> OptimizedQuery {
        QueryOptimizer::default()
            .build_query(Collection::Venues, &CatalogFilter::default())
            .unwrap()
    }

    #[test]
    fn test_records_from_body() {
        assert_eq!(records_from_body(json!([{"id": 1}])).unwrap(), vec![json!({"id": 1})]);
        assert_eq!(
            records_from_body(json!({"items": [{"id": 2}], "count": 1})).unwrap(),
            vec![json!({"id": 2})]
        );
        assert_matches!(records_from_body(json!({"data": []})), Err(Error::BackingFetch(_)));
        assert_matches!(records_from_body(json!("x")), Err(Error::BackingFetch(_)));
    }

    #[tokio::test]
    async fn test_no_instances() {
        let lb = Arc::new(LoadBalancer::new(
            BalancerConfig::default(),
            Arc::new(StatsCollector::without_exporter()),
        ));
        let store = UpstreamStore::new(lb, UpstreamConfig::default()).unwrap();
        assert_matches!(store.fetch(&query()).await, Err(Error::NoUpstreamAvailable(_)));
    }

    #[tokio::test]
    async fn test_unreachable_instances_are_demoted_and_exhausted() {
        let lb = Arc::new(LoadBalancer::new(
            BalancerConfig::default(),
            Arc::new(StatsCollector::without_exporter()),
        ));
        for (id, port) in [("a", 1), ("b", 2)] {
            lb.register(InstanceSpec {
                id: id.into(),
                address: format!("http://127.0.0.1:{}", port),
                weight: 1,
            });
        }
        let store = UpstreamStore::new(
            Arc::clone(&lb),
            UpstreamConfig {
                request_timeout_ms: 500,
                ..Default::default()
            },
        )
        .unwrap();

        assert_matches!(store.fetch(&query()).await, Err(Error::NoUpstreamAvailable(_)));
        // Each instance was tried once and demoted one stage
        assert_eq!(lb.instance("a").unwrap().health, HealthState::Suspect);
        assert_eq!(lb.instance("b").unwrap().health, HealthState::Suspect);
    }
}
