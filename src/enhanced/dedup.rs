//! Request Deduplication
//!
//! Coalesces concurrent, logically identical requests onto one in-flight
//! execution. The key is the request signature, so parameter key order does
//! not matter. An entry lives exactly as long as its execution: it is removed
//! the moment the execution settles, success or failure, and the next call
//! for the same key executes again.
//!
//! The shared execution runs on its own task, so it completes (and clears its
//! entry) even if every waiter goes away. A background sweep aborts
//! executions older than the stale timeout; their waiters observe
//! [`DedupError::Cancelled`].
//!
//! ## Usage
//!
//! ```no_run
//! use tokio_upstream_orchestrator::config::DedupConfig;
//! use tokio_upstream_orchestrator::enhanced::Deduplicator;
//! use tokio_upstream_orchestrator::RequestDescriptor;
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dedup: Deduplicator<String, String> = Deduplicator::new(&DedupConfig::default())?;
//! let descriptor = RequestDescriptor::get("/items/42");
//!
//! let body = dedup
//!     .dedupe(&descriptor, || async { Ok("payload".to_string()) })
//!     .await?;
//! # let _ = body;
//! # Ok(()) }
//! ```

use crate::config::DedupConfig;
use crate::metrics;
use crate::request::RequestDescriptor;
use crate::OrchestratorError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Why a coalesced call did not produce a value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DedupError<E> {
    /// The shared execution failed; every waiter sees the same error.
    #[error("{0}")]
    Failed(E),
    /// The execution was aborted by the stale sweep or an explicit cancel.
    #[error("shared execution cancelled")]
    Cancelled,
}

type SharedExecution<T, E> = Shared<BoxFuture<'static, Result<T, DedupError<E>>>>;

struct PendingRequest<T, E> {
    generation: u64,
    created_at: Instant,
    waiters: Arc<AtomicUsize>,
    execution: SharedExecution<T, E>,
    abort: AbortHandle,
}

struct DedupInner<T, E> {
    pending: DashMap<String, PendingRequest<T, E>>,
    stale_timeout: Duration,
    next_generation: AtomicU64,
    total_calls: AtomicU64,
    executions: AtomicU64,
    deduplicated: AtomicU64,
    stale_evictions: AtomicU64,
}

/// In-flight request coalescer.
pub struct Deduplicator<T, E> {
    inner: Arc<DedupInner<T, E>>,
    sweeper: JoinHandle<()>,
}

/// Deduplicator counters.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DedupMetrics {
    /// Calls to `dedupe`.
    pub total_calls: u64,
    /// Executions actually started.
    pub executions: u64,
    /// Calls served by an execution already in flight.
    pub deduplicated: u64,
    /// `deduplicated / total_calls`, 0 when idle.
    pub savings_rate: f64,
    /// Executions currently in flight.
    pub pending: usize,
    /// Callers currently attached to in-flight executions.
    pub waiters: usize,
    /// Executions aborted by the stale sweep.
    pub stale_evictions: u64,
}

struct WaiterGuard(Arc<AtomicUsize>);

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl<T, E> Deduplicator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create a deduplicator and start its stale sweep.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Other`] if called outside a Tokio runtime.
    pub fn new(config: &DedupConfig) -> Result<Self, OrchestratorError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            OrchestratorError::Other(format!("deduplicator needs a tokio runtime: {e}"))
        })?;

        let inner = Arc::new(DedupInner {
            pending: DashMap::new(),
            stale_timeout: Duration::from_millis(config.stale_timeout_ms),
            next_generation: AtomicU64::new(0),
            total_calls: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            stale_evictions: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&inner);
        let period = Duration::from_millis(config.sweep_interval_ms.max(1));
        let sweeper = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.evict_stale(Instant::now());
            }
        });

        Ok(Self { inner, sweeper })
    }

    /// Run `executor` unless an identical request is already in flight, in
    /// which case wait for that execution instead.
    ///
    /// # Errors
    ///
    /// - [`DedupError::Failed`] with the shared execution's error.
    /// - [`DedupError::Cancelled`] if the execution was aborted.
    pub async fn dedupe<F, Fut>(
        &self,
        descriptor: &RequestDescriptor,
        executor: F,
    ) -> Result<T, DedupError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let key = descriptor.signature();
        self.inner.total_calls.fetch_add(1, Ordering::Relaxed);

        let (execution, _guard) = match self.inner.pending.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let pending = entry.get();
                pending.waiters.fetch_add(1, Ordering::Relaxed);
                self.inner.deduplicated.fetch_add(1, Ordering::Relaxed);
                metrics::inc_dedup("coalesced");
                debug!(
                    key = %key,
                    waiters = pending.waiters.load(Ordering::Relaxed),
                    "joined in-flight request"
                );
                (
                    pending.execution.clone(),
                    WaiterGuard(Arc::clone(&pending.waiters)),
                )
            }
            Entry::Vacant(entry) => {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let call = executor();
                let owner = Arc::downgrade(&self.inner);
                let settled_key = key.clone();
                let task = tokio::spawn(async move {
                    let result = call.await;
                    if let Some(inner) = owner.upgrade() {
                        inner.settle(&settled_key, generation);
                    }
                    result
                });
                let abort = task.abort_handle();
                let execution: SharedExecution<T, E> = async move {
                    match task.await {
                        Ok(result) => result.map_err(DedupError::Failed),
                        Err(_) => Err(DedupError::Cancelled),
                    }
                }
                .boxed()
                .shared();

                let waiters = Arc::new(AtomicUsize::new(1));
                entry.insert(PendingRequest {
                    generation,
                    created_at: Instant::now(),
                    waiters: Arc::clone(&waiters),
                    execution: execution.clone(),
                    abort,
                });
                self.inner.executions.fetch_add(1, Ordering::Relaxed);
                metrics::inc_dedup("executed");
                debug!(key = %key, "started shared execution");
                (execution, WaiterGuard(waiters))
            }
        };

        execution.await
    }

    /// Abort every in-flight execution. Returns how many.
    pub fn cancel_all(&self) -> usize {
        let keys: Vec<String> = self.inner.pending.iter().map(|e| e.key().clone()).collect();
        let mut cancelled = 0;
        for key in keys {
            if let Some((_, pending)) = self.inner.pending.remove(&key) {
                pending.abort.abort();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(cancelled = cancelled, "cancelled in-flight executions");
        }
        cancelled
    }

    /// Run the stale sweep now instead of waiting for the next tick.
    pub fn evict_stale(&self) -> usize {
        self.inner.evict_stale(Instant::now())
    }

    /// Current counters.
    pub fn metrics(&self) -> DedupMetrics {
        let total_calls = self.inner.total_calls.load(Ordering::Relaxed);
        let deduplicated = self.inner.deduplicated.load(Ordering::Relaxed);
        let waiters = self
            .inner
            .pending
            .iter()
            .map(|e| e.waiters.load(Ordering::Relaxed))
            .sum();
        DedupMetrics {
            total_calls,
            executions: self.inner.executions.load(Ordering::Relaxed),
            deduplicated,
            savings_rate: if total_calls == 0 {
                0.0
            } else {
                deduplicated as f64 / total_calls as f64
            },
            pending: self.inner.pending.len(),
            waiters,
            stale_evictions: self.inner.stale_evictions.load(Ordering::Relaxed),
        }
    }
}

impl<T, E> DedupInner<T, E> {
    fn settle(&self, key: &str, generation: u64) {
        if self
            .pending
            .remove_if(key, |_, pending| pending.generation == generation)
            .is_some()
        {
            debug!(key = key, "shared execution settled");
        }
    }

    fn evict_stale(&self, now: Instant) -> usize {
        let stale: Vec<(String, u64)> = self
            .pending
            .iter()
            .filter(|e| now.saturating_duration_since(e.created_at) >= self.stale_timeout)
            .map(|e| (e.key().clone(), e.generation))
            .collect();

        let mut evicted = 0;
        for (key, generation) in stale {
            if let Some((_, pending)) = self
                .pending
                .remove_if(&key, |_, p| p.generation == generation)
            {
                pending.abort.abort();
                evicted += 1;
                warn!(
                    key = %key,
                    age_ms = now.saturating_duration_since(pending.created_at).as_millis() as u64,
                    "aborting stale in-flight request"
                );
            }
        }
        self.stale_evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }
}

impl<T, E> Drop for Deduplicator<T, E> {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn config() -> DedupConfig {
        DedupConfig {
            stale_timeout_ms: 1_000,
            sweep_interval_ms: 100,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_identical_calls_execute_once() {
        let dedup: Deduplicator<u32, String> = Deduplicator::new(&config()).expect("test: dedup");
        let calls = Arc::new(AtomicU32::new(0));
        let descriptor = RequestDescriptor::get("/items");

        let make = || {
            let calls = Arc::clone(&calls);
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(42)
            }
        };

        let (a, b) = tokio::join!(
            dedup.dedupe(&descriptor, make()),
            dedup.dedupe(&descriptor, make())
        );
        assert_eq!(a, Ok(42));
        assert_eq!(b, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let m = dedup.metrics();
        assert_eq!(m.total_calls, 2);
        assert_eq!(m.deduplicated, 1);
        assert_eq!(m.executions, 1);
        assert!((m.savings_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_order_independent() {
        let dedup: Deduplicator<u32, String> = Deduplicator::new(&config()).expect("test: dedup");
        let a = RequestDescriptor::get("/search").params(json!({"q": "x", "page": 1}));
        let b = RequestDescriptor::get("/search").params(json!({"page": 1, "q": "x"}));

        let (ra, rb) = tokio::join!(
            dedup.dedupe(&a, || async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(1)
            }),
            dedup.dedupe(&b, || async { Ok(2) })
        );
        assert_eq!(ra, Ok(1));
        assert_eq!(rb, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_entry_removed_and_next_call_executes() {
        let dedup: Deduplicator<u32, String> = Deduplicator::new(&config()).expect("test: dedup");
        let descriptor = RequestDescriptor::get("/items");

        assert_eq!(dedup.dedupe(&descriptor, || async { Ok(1) }).await, Ok(1));
        assert_eq!(dedup.metrics().pending, 0);
        assert_eq!(dedup.dedupe(&descriptor, || async { Ok(2) }).await, Ok(2));
        assert_eq!(dedup.metrics().executions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_shared_by_all_waiters_and_cleared() {
        let dedup: Deduplicator<u32, String> = Deduplicator::new(&config()).expect("test: dedup");
        let descriptor = RequestDescriptor::get("/boom");

        let (a, b) = tokio::join!(
            dedup.dedupe(&descriptor, || async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Err("boom".to_string())
            }),
            dedup.dedupe(&descriptor, || async { Ok(0) })
        );
        assert_eq!(a, Err(DedupError::Failed("boom".to_string())));
        assert_eq!(b, Err(DedupError::Failed("boom".to_string())));
        assert_eq!(dedup.metrics().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execution_survives_dropped_waiters() {
        let dedup: Deduplicator<u32, String> = Deduplicator::new(&config()).expect("test: dedup");
        let finished = Arc::new(AtomicU32::new(0));
        let flag = Arc::clone(&finished);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            dedup.dedupe(&RequestDescriptor::get("/slow"), move || async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                flag.store(1, Ordering::SeqCst);
                Ok(9)
            }),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.metrics().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_execution_aborted_by_sweep() {
        let dedup: Deduplicator<u32, String> = Deduplicator::new(&config()).expect("test: dedup");
        let result = dedup
            .dedupe(&RequestDescriptor::get("/stuck"), || {
                futures::future::pending::<Result<u32, String>>()
            })
            .await;
        assert_eq!(result, Err(DedupError::Cancelled));
        let m = dedup.metrics();
        assert_eq!(m.stale_evictions, 1);
        assert_eq!(m.pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_rejects_waiters() {
        let dedup: Deduplicator<u32, String> = Deduplicator::new(&config()).expect("test: dedup");
        let descriptor = RequestDescriptor::get("/never");
        let waiting = dedup.dedupe(&descriptor, || futures::future::pending());
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            dedup.cancel_all()
        };
        let (result, cancelled) = tokio::join!(waiting, cancel);
        assert_eq!(cancelled, 1);
        assert_eq!(result, Err(DedupError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_count_tracks_attached_callers() {
        let dedup: Deduplicator<u32, String> = Deduplicator::new(&config()).expect("test: dedup");
        let descriptor = RequestDescriptor::get("/count");
        let slow = || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(1)
        };

        let probe = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            dedup.metrics().waiters
        };
        let (_, _, _, waiters) = tokio::join!(
            dedup.dedupe(&descriptor, slow),
            dedup.dedupe(&descriptor, slow),
            dedup.dedupe(&descriptor, slow),
            probe
        );
        assert_eq!(waiters, 3);
        assert_eq!(dedup.metrics().waiters, 0);
    }
}
