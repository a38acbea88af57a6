//! Singleflight Coordinator
//!
//! Collapses concurrent calls for the same key into a single execution. The
//! first caller (the leader) spawns the work as a task; later callers await
//! the same shared result until it completes.
//!
//! # Guarantees
//!
//! - At most one execution per key is in flight at any time
//! - Every waiter receives the same value or the same error
//! - The key is released when the work finishes, fails, or panics, so a
//!   failure never poisons subsequent attempts
//! - Cancelling a waiter (including the leader) does not cancel the work

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::error::FetchError;

type SharedCall<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;
type CallTable<T> = Arc<Mutex<HashMap<String, (u64, SharedCall<T>)>>>;

/// Removes a call from the table once its task ends
struct CallGuard<T: Clone> {
    calls: CallTable<T>,
    key: String,
    id: u64,
}

impl<T: Clone> Drop for CallGuard<T> {
    fn drop(&mut self) {
        let mut calls = self.calls.lock();
        // A newer call may already own the key
        if calls.get(&self.key).map(|(id, _)| *id == self.id).unwrap_or(false) {
            calls.remove(&self.key);
        }
    }
}

/// Outcome of a coalesced call
#[derive(Debug, Clone)]
pub struct Flight<T> {
    /// Shared result
    pub result: Result<T, FetchError>,
    /// True if this caller started the execution
    pub leader: bool,
}

/// Per-key call coalescing
pub struct Singleflight<T: Clone> {
    calls: CallTable<T>,
    next_id: AtomicU64,
}

impl<T> Default for Singleflight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Singleflight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty coordinator
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Run `f` for `key`, or join the execution already in flight
    pub async fn run<F, Fut>(&self, key: &str, f: F) -> Result<T, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        self.run_tracked(key, f).await.result
    }

    /// Like [`run`](Self::run), also reporting whether this caller led
    pub async fn run_tracked<F, Fut>(&self, key: &str, f: F) -> Flight<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let (call, leader) = {
            let mut calls = self.calls.lock();
            match calls.get(key) {
                Some((_, call)) => (call.clone(), false),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let guard = CallGuard {
                        calls: Arc::clone(&self.calls),
                        key: key.to_string(),
                        id,
                    };
                    let work = f();
                    // Spawned while the table is locked so the guard cannot
                    // run before the entry exists
                    let handle = tokio::spawn(async move {
                        let _guard = guard;
                        work.await
                    });
                    let call = async move {
                        handle.await.unwrap_or_else(|e| {
                            Err(FetchError::Failed {
                                status: 500,
                                message: format!("fetch task aborted: {}", e),
                            })
                        })
                    }
                    .boxed()
                    .shared();
                    calls.insert(key.to_string(), (id, call.clone()));
                    (call, true)
                }
            }
        };

        Flight {
            result: call.await,
            leader,
        }
    }

    /// Number of keys with an execution in flight
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_calls_execute_once() {
        let flights: Arc<Singleflight<u64>> = Arc::new(Singleflight::new());
        let invocations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let flights = Arc::clone(&flights);
            let invocations = Arc::clone(&invocations);
            handles.push(tokio::spawn(async move {
                flights
                    .run_tracked("venues:{location:galle}", move || async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        let mut leaders = 0;
        for handle in handles {
            let flight = handle.await.unwrap();
            assert_eq!(flight.result, Ok(42));
            if flight.leader {
                leaders += 1;
            }
        }

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_error_shared_and_key_not_poisoned() {
        let flights: Singleflight<u64> = Singleflight::new();

        let err = flights
            .run("k", || async {
                Err(FetchError::Timeout {
                    key: "k".into(),
                    timeout_ms: 10,
                })
            })
            .await;
        assert!(matches!(err, Err(FetchError::Timeout { .. })));

        // Next attempt runs fresh
        let ok = flights.run("k", || async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let flights: Arc<Singleflight<String>> = Arc::new(Singleflight::new());
        let invocations = Arc::new(AtomicUsize::new(0));

        let a = {
            let invocations = Arc::clone(&invocations);
            flights.run("a", move || async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok("a".to_string())
            })
        };
        let b = {
            let invocations = Arc::clone(&invocations);
            flights.run("b", move || async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok("b".to_string())
            })
        };

        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap(), "a");
        assert_eq!(b.unwrap(), "b");
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_leader_does_not_cancel_work() {
        let flights: Arc<Singleflight<u64>> = Arc::new(Singleflight::new());

        let leader = {
            let flights = Arc::clone(&flights);
            tokio::spawn(async move {
                flights
                    .run("slow", || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(9)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let follower = flights.run("slow", || async { Ok(0) });
        leader.abort();

        assert_eq!(follower.await, Ok(9));
    }

    #[tokio::test]
    async fn test_panicking_work_releases_key() {
        let flights: Singleflight<u64> = Singleflight::new();

        let result = flights
            .run("boom", || async {
                if flights_should_panic() {
                    panic!("backing store exploded");
                }
                Ok(1)
            })
            .await;
        assert!(matches!(result, Err(FetchError::Failed { status: 500, .. })));
        assert_eq!(flights.in_flight(), 0);
    }

    fn flights_should_panic() -> bool {
        true
    }
}
