//! One-shot future per key: the deduplication primitive behind
//! `reconnect_sandbox`. The first caller owns the work; everyone who asks
//! while it is in flight subscribes to the same outcome.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use crate::error::ManagerError;

type SharedResult = std::result::Result<(), Arc<ManagerError>>;
type InflightMap = Arc<Mutex<HashMap<String, Shared<BoxFuture<'static, SharedResult>>>>>;

#[derive(Default)]
pub struct SingleFlight {
    inflight: InflightMap,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make()` for `key`, unless a run for that key is already in
    /// flight, in which case await that run instead. The entry is removed
    /// when the owned future completes, so later calls start fresh work.
    pub async fn run<F>(&self, key: &str, make: impl FnOnce() -> F) -> SharedResult
    where
        F: Future<Output = std::result::Result<(), ManagerError>> + Send + 'static,
    {
        let fut = {
            let mut inflight = self.inflight.lock().unwrap();
            if let Some(existing) = inflight.get(key) {
                existing.clone()
            } else {
                let map = self.inflight.clone();
                let owned_key = key.to_string();
                let work = make();
                let fut = async move {
                    let result = work.await.map_err(Arc::new);
                    // Remove before resolving so a caller arriving after
                    // completion never joins a finished run.
                    map.lock().unwrap().remove(&owned_key);
                    result
                }
                .boxed()
                .shared();
                inflight.insert(key.to_string(), fut.clone());
                fut
            }
        };
        fut.await
    }

    pub fn in_flight(&self, key: &str) -> bool {
        self.inflight.lock().unwrap().contains_key(key)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let flight = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..10 {
            let flight = flight.clone();
            let executions = executions.clone();
            tasks.spawn(async move {
                flight
                    .run("sb-1", move || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(())
                    })
                    .await
            });
        }

        while let Some(result) = tasks.join_next().await {
            assert!(result.unwrap().is_ok());
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert!(!flight.in_flight("sb-1"));
    }

    #[tokio::test]
    async fn all_subscribers_see_the_same_failure() {
        let flight = Arc::new(SingleFlight::new());

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let flight = flight.clone();
            tasks.spawn(async move {
                flight
                    .run("sb-2", || async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(ManagerError::SandboxStart("no capacity".into()))
                    })
                    .await
            });
        }

        while let Some(result) = tasks.join_next().await {
            let err = result.unwrap().unwrap_err();
            assert!(err.to_string().contains("no capacity"));
        }
    }

    #[tokio::test]
    async fn next_call_after_completion_runs_fresh_work() {
        let flight = SingleFlight::new();
        let executions = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let executions = executions.clone();
            flight
                .run("sb-3", move || async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }
        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_share() {
        let flight = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for key in ["a", "b", "c"] {
            let flight = flight.clone();
            let executions = executions.clone();
            tasks.spawn(async move {
                flight
                    .run(key, move || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(())
                    })
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            assert!(result.unwrap().is_ok());
        }
        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }
}
