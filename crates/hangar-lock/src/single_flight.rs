//! A keyed single-flight primitive: "ensure `fn` for key `k` runs at most
//! once concurrently; all concurrent callers for `k` receive the same
//! outcome" (spec ยง5, ยง9 glossary).
//!
//! Used for (i) the Provider Supervisor's `ensure_ready()` and (ii) the
//! Batch Executor's batch-wide cold-start deduplication per provider id.
//! Both call sites share this one implementation rather than re-deriving
//! the rendezvous logic.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

/// Keyed single-flight group. `V` and `E` must be `Clone` because the
/// outcome of the one winning call is handed to every concurrent waiter.
pub struct SingleFlight<K, V, E> {
    inflight: Mutex<HashMap<K, Arc<OnceCell<Result<V, E>>>>>,
}

impl<K, V, E> Default for SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` for `key`, deduplicating concurrent callers.
    ///
    /// The first caller for a given (currently idle) key runs `f` to
    /// completion; every caller that arrives while it is running waits for
    /// that same outcome instead of starting its own attempt. Once the
    /// round finishes โ€” success or failure โ€” the key is cleared, so the
    /// *next* call starts a fresh round rather than memoizing forever.
    pub async fn run<F, Fut>(&self, key: K, f: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        // get_or_init runs `f` only for whichever task wins the race to
        // initialize this particular cell; every other concurrent caller
        // for the same key awaits that same future instead of re-running
        // it, and receives the identical Result โ€” success or failure.
        let result = cell.get_or_init(f).await.clone();

        // Clear the slot so a later, non-concurrent call gets a fresh
        // round. Only remove it if it's still the cell we used: a
        // concurrent caller for a *new* round may already have replaced it.
        {
            let mut inflight = self.inflight.lock().await;
            if let Some(current) = inflight.get(&key)
                && Arc::ptr_eq(current, &cell)
            {
                inflight.remove(&key);
            }
        }

        result
    }

    /// Number of keys with a round currently in flight. Exposed for tests
    /// and diagnostics only.
    pub async fn inflight_count(&self) -> usize {
        self.inflight.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let sf: Arc<SingleFlight<&'static str, u32, String>> = Arc::new(SingleFlight::new());
        let launches = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sf = sf.clone();
            let launches = launches.clone();
            handles.push(tokio::spawn(async move {
                sf.run("provider-a", || {
                    let launches = launches.clone();
                    async move {
                        launches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, String>(42u32)
                    }
                })
                .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(42));
        }
        assert_eq!(launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let sf: SingleFlight<&'static str, u32, String> = SingleFlight::new();
        let a = sf.run("a", || async { Ok::<_, String>(1) });
        let b = sf.run("b", || async { Ok::<_, String>(2) });
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a, Ok(1));
        assert_eq!(b, Ok(2));
    }

    #[tokio::test]
    async fn a_later_round_runs_again_after_the_first_completes() {
        let sf: SingleFlight<&'static str, u32, String> = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for expected in 1..=3u32 {
            let calls = calls.clone();
            let result = sf
                .run("k", || async move {
                    Ok::<_, String>(calls.fetch_add(1, Ordering::SeqCst) as u32 + 1)
                })
                .await;
            assert_eq!(result, Ok(expected));
        }
        assert_eq!(sf.inflight_count().await, 0);
    }

    #[tokio::test]
    async fn failures_propagate_to_all_waiters() {
        let sf: Arc<SingleFlight<&'static str, u32, String>> = Arc::new(SingleFlight::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let sf = sf.clone();
            handles.push(tokio::spawn(async move {
                sf.run("bad", || async { Err::<u32, _>("boom".to_string()) })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Err("boom".to_string()));
        }
    }
}
