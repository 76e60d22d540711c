//! Read-path facade over the cache, deduplicator and scheduler.
//!
//! [`Orchestrator::fetch`] is the common flow for idempotent reads: serve a
//! live cache entry if there is one, otherwise coalesce with any identical
//! in-flight request, schedule a new one if none exists, and cache the result.

use crate::config::OrchestratorConfig;
use crate::enhanced::cache::{CacheLayer, CacheMetrics, SetOptions};
use crate::enhanced::dedup::{DedupError, DedupMetrics, Deduplicator};
use crate::enhanced::scheduler::{EnqueueOptions, Scheduler, SchedulerMetrics};
use crate::error::{SchedulerError, UpstreamError};
use crate::request::RequestDescriptor;
use crate::OrchestratorError;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// Options for one [`Orchestrator::fetch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOptions {
    /// Scheduler options for a new execution.
    pub enqueue: EnqueueOptions,
    /// Cache options for storing the result.
    pub cache: SetOptions,
}

/// Snapshot of all three components, for an external dashboard.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OrchestratorMetrics {
    /// Scheduler state and counters.
    pub scheduler: SchedulerMetrics,
    /// Deduplicator counters.
    pub dedup: DedupMetrics,
    /// Cache counters.
    pub cache: CacheMetrics,
}

/// Cache → deduplicator → scheduler pipeline.
pub struct Orchestrator {
    cache: CacheLayer,
    dedup: Deduplicator<Value, SchedulerError>,
    scheduler: Arc<Scheduler>,
}

impl Orchestrator {
    /// Build all three components from one configuration.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::ConfigError`] if `config` fails validation.
    /// - [`OrchestratorError::Storage`] if the durable cache directory cannot be created.
    /// - [`OrchestratorError::Other`] if called outside a Tokio runtime.
    pub fn new(config: &OrchestratorConfig) -> Result<Self, OrchestratorError> {
        let scheduler = Arc::new(Scheduler::new(config)?);
        let dedup = Deduplicator::new(&config.dedup)?;
        let cache = CacheLayer::from_config(&config.cache)?;
        info!(
            max_concurrent = config.scheduler.max_concurrent,
            cache_entries = config.cache.max_entries,
            durable = config.cache.durable_dir.is_some(),
            "orchestrator ready"
        );
        Ok(Self {
            cache,
            dedup,
            scheduler,
        })
    }

    /// Fetch `resource` through the cache, coalescing and scheduling the
    /// executor on a miss.
    ///
    /// The cache key is `resource` plus the descriptor params; the dedup key
    /// is the descriptor signature.
    ///
    /// # Errors
    ///
    /// The scheduler's terminal error, shared by every coalesced caller.
    pub async fn fetch<F, Fut>(
        &self,
        resource: &str,
        descriptor: &RequestDescriptor,
        options: FetchOptions,
        executor: F,
    ) -> Result<Value, SchedulerError>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, UpstreamError>> + Send + 'static,
    {
        if let Some(value) = self.cache.get(resource, &descriptor.params).await {
            return Ok(value);
        }

        let scheduler = Arc::clone(&self.scheduler);
        let scheduled = descriptor.clone();
        let enqueue = options.enqueue;
        let value = self
            .dedup
            .dedupe(descriptor, move || {
                scheduler.enqueue(&scheduled, enqueue, executor)
            })
            .await
            .map_err(|e| match e {
                DedupError::Failed(error) => error,
                DedupError::Cancelled => SchedulerError::Cancelled,
            })?;

        debug!(resource = resource, url = %descriptor.url, "fetched, caching result");
        self.cache
            .set(resource, &descriptor.params, value.clone(), options.cache)
            .await;
        Ok(value)
    }

    /// The cache.
    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    /// The deduplicator.
    pub fn dedup(&self) -> &Deduplicator<Value, SchedulerError> {
        &self.dedup
    }

    /// The scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Snapshot of all three components.
    pub fn metrics(&self) -> OrchestratorMetrics {
        OrchestratorMetrics {
            scheduler: self.scheduler.metrics(),
            dedup: self.dedup.metrics(),
            cache: self.cache.metrics(),
        }
    }

    /// Cancel in-flight executions and reject all scheduled work.
    pub fn shutdown(&self) {
        self.dedup.cancel_all();
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn counting_executor(
        calls: &Arc<AtomicU32>,
        value: Value,
    ) -> impl Fn() -> BoxFuture<'static, Result<Value, UpstreamError>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let value = value.clone();
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(value)
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_caches_result() {
        let orchestrator = Orchestrator::new(&OrchestratorConfig::default()).expect("test: build");
        let calls = Arc::new(AtomicU32::new(0));
        let descriptor = RequestDescriptor::get("/items/1");

        let first = orchestrator
            .fetch(
                "item_detail",
                &descriptor,
                FetchOptions::default(),
                counting_executor(&calls, json!({"id": 1})),
            )
            .await;
        let second = orchestrator
            .fetch(
                "item_detail",
                &descriptor,
                FetchOptions::default(),
                counting_executor(&calls, json!({"id": 2})),
            )
            .await;

        assert_eq!(first, Ok(json!({"id": 1})));
        assert_eq!(second, Ok(json!({"id": 1})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.metrics().cache.hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetches_coalesce() {
        let orchestrator = Orchestrator::new(&OrchestratorConfig::default()).expect("test: build");
        let calls = Arc::new(AtomicU32::new(0));
        let descriptor = RequestDescriptor::get("/items").params(json!({"page": 1}));

        let options = FetchOptions::default;
        let (a, b) = tokio::join!(
            orchestrator.fetch("item_list", &descriptor, options(), counting_executor(&calls, json!([1]))),
            orchestrator.fetch("item_list", &descriptor, options(), counting_executor(&calls, json!([2])))
        );
        assert_eq!(a, Ok(json!([1])));
        assert_eq!(b, Ok(json!([1])));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let m = orchestrator.metrics();
        assert_eq!(m.dedup.deduplicated, 1);
        assert_eq!(m.scheduler.completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_not_cached() {
        let orchestrator = Orchestrator::new(&OrchestratorConfig::default()).expect("test: build");
        let descriptor = RequestDescriptor::get("/items/404");
        let result = orchestrator
            .fetch("item_detail", &descriptor, FetchOptions::default(), || async {
                Err(UpstreamError::from_status(404, "gone"))
            })
            .await;
        assert!(matches!(result, Err(SchedulerError::ClientError { status: 404, .. })));
        assert_eq!(orchestrator.metrics().cache.size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_new_fetches() {
        let orchestrator = Orchestrator::new(&OrchestratorConfig::default()).expect("test: build");
        orchestrator.shutdown();
        let result = orchestrator
            .fetch("x", &RequestDescriptor::get("/x"), FetchOptions::default(), || async {
                Ok(json!(1))
            })
            .await;
        assert_eq!(result, Err(SchedulerError::ShuttingDown));
    }
}
