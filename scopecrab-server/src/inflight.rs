//! At-most-once execution per key for concurrent callers
//!
//! The first caller for a key becomes the leader and runs the operation;
//! everyone arriving while it runs waits on a `watch` channel and receives a
//! clone of the leader's result. If the leader is dropped before it finishes,
//! waiters get [`Error::Fatal`] and the key is released.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::watch;

type Outcome<T> = Option<Result<T>>;

pub struct InFlight<T> {
    calls: Mutex<HashMap<String, watch::Receiver<Outcome<T>>>>,
}

enum Role<T> {
    Leader(watch::Sender<Outcome<T>>),
    Waiter(watch::Receiver<Outcome<T>>),
}

/// Releases the leader's key however the leader exits
struct Release<'a, T> {
    calls: &'a Mutex<HashMap<String, watch::Receiver<Outcome<T>>>>,
    key: &'a str,
}

impl<T> Drop for Release<'_, T> {
    fn drop(&mut self) {
        self.calls.lock().remove(self.key);
    }
}

impl<T: Clone> InFlight<T> {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Run `op` unless a run for `key` is already in progress
    ///
    /// Returns the result together with `true` if it came from another
    /// caller's run.
    pub async fn run<F, Fut>(&self, key: &str, op: F) -> (Result<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let role = {
            let mut calls = self.calls.lock();
            match calls.get(key) {
                Some(rx) => Role::Waiter(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    calls.insert(key.to_string(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Leader(tx) => {
                let _release = Release {
                    calls: &self.calls,
                    key,
                };
                let result = op().await;
                tx.send_replace(Some(result.clone()));
                (result, false)
            }
            Role::Waiter(mut rx) => {
                tracing::trace!(key, "waiting on in-flight call");
                let result = match rx.wait_for(Option::is_some).await {
                    Ok(outcome) => outcome.clone().unwrap_or_else(|| Err(abandoned(key))),
                    Err(_) => Err(abandoned(key)),
                };
                (result, true)
            }
        }
    }

    /// Number of keys with a run in progress
    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for InFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn abandoned(key: &str) -> Error {
    Error::Fatal(format!("in-flight call for {key} was abandoned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_single_caller_leads() {
        let inflight = InFlight::new();
        let (result, shared) = inflight.run("k", || async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
        assert!(!shared);
        assert!(inflight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_run() {
        let inflight = Arc::new(InFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let inflight = Arc::clone(&inflight);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                inflight
                    .run("website/2", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(Arc::new("loaded".to_string()))
                    })
                    .await
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(results.iter().filter(|(_, shared)| !shared).count(), 1);
        let first = results[0].0.as_ref().unwrap();
        for (result, _) in &results {
            assert!(Arc::ptr_eq(result.as_ref().unwrap(), first));
        }
        assert!(inflight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_fan_out() {
        let inflight: Arc<InFlight<u32>> = Arc::new(InFlight::new());
        let mut handles = Vec::new();
        for _ in 0..5 {
            let inflight = Arc::clone(&inflight);
            handles.push(tokio::spawn(async move {
                inflight
                    .run("k", || async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err(Error::NotValid("bad".into()))
                    })
                    .await
                    .0
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Err(Error::NotValid("bad".into())));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_keys_run_independently() {
        let inflight = Arc::new(InFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for key in ["default/0", "website/1", "website/2"] {
            let inflight = Arc::clone(&inflight);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                inflight
                    .run(key, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().0.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_leader_releases_waiters() {
        let inflight: Arc<InFlight<u32>> = Arc::new(InFlight::new());

        let leader = {
            let inflight = Arc::clone(&inflight);
            tokio::spawn(async move {
                inflight
                    .run("k", || async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        let waiter = {
            let inflight = Arc::clone(&inflight);
            tokio::spawn(async move { inflight.run("k", || async { Ok(2) }).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        leader.abort();
        let (result, shared) = waiter.await.unwrap();
        assert!(shared);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Fatal);

        // The key is free again
        let (result, shared) = inflight.run("k", || async { Ok(3) }).await;
        assert_eq!(result, Ok(3));
        assert!(!shared);
    }
}
