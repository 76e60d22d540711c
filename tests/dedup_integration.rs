//! # Deduplication Integration Tests
//!
//! Identical requests issued while one is in flight share a single
//! execution; once it settles, the next identical request runs again.

use futures::future::join_all;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_upstream_orchestrator::config::DedupConfig;
use tokio_upstream_orchestrator::enhanced::{DedupError, Deduplicator};
use tokio_upstream_orchestrator::RequestDescriptor;

fn dedup() -> Deduplicator<String, String> {
    Deduplicator::new(&DedupConfig::default()).expect("test: deduplicator")
}

async fn slow_fetch(calls: Arc<AtomicU32>, body: &'static str) -> Result<String, String> {
    calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(5)).await;
    Ok(body.to_string())
}

#[tokio::test(start_paused = true)]
async fn test_twenty_identical_requests_execute_once() {
    let dedup = dedup();
    let calls = Arc::new(AtomicU32::new(0));
    let descriptor = RequestDescriptor::get("/api/search").params(json!({"q": "lamp", "limit": 10}));

    let waiters = (0..20).map(|_| {
        let calls = Arc::clone(&calls);
        dedup.dedupe(&descriptor, move || slow_fetch(calls, "results"))
    });
    let results = join_all(waiters).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| r.as_deref() == Ok("results")));

    let m = dedup.metrics();
    assert_eq!(m.total_calls, 20);
    assert_eq!(m.executions, 1);
    assert_eq!(m.deduplicated, 19);
    assert!((m.savings_rate - 0.95).abs() < 1e-9);
    assert_eq!(m.pending, 0);
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_within_execution_window_shares_result() {
    let dedup = dedup();
    let calls = Arc::new(AtomicU32::new(0));
    let first = RequestDescriptor::get("/api/items").params(json!({"page": 1, "sort": "name"}));
    // Same request, keys in a different order.
    let second = RequestDescriptor::get("/api/items").params(json!({"sort": "name", "page": 1}));

    let early = {
        let calls = Arc::clone(&calls);
        dedup.dedupe(&first, move || slow_fetch(calls, "page-1"))
    };
    let late = async {
        tokio::time::sleep(Duration::from_millis(3)).await;
        let calls = Arc::clone(&calls);
        dedup
            .dedupe(&second, move || slow_fetch(calls, "page-1-again"))
            .await
    };

    let (early, late) = tokio::join!(early, late);
    assert_eq!(early, Ok("page-1".to_string()));
    assert_eq!(late, Ok("page-1".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_request_after_settlement_executes_again() {
    let dedup = dedup();
    let calls = Arc::new(AtomicU32::new(0));
    let descriptor = RequestDescriptor::get("/api/items/7");

    for _ in 0..2 {
        let calls_for_run = Arc::clone(&calls);
        let result = dedup
            .dedupe(&descriptor, move || slow_fetch(calls_for_run, "item"))
            .await;
        assert_eq!(result, Ok("item".to_string()));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(dedup.metrics().deduplicated, 0);
}

#[tokio::test(start_paused = true)]
async fn test_different_methods_do_not_coalesce() {
    let dedup = dedup();
    let calls = Arc::new(AtomicU32::new(0));
    let get = RequestDescriptor::get("/api/items");
    let post = RequestDescriptor::post("/api/items");

    let a = {
        let calls = Arc::clone(&calls);
        dedup.dedupe(&get, move || slow_fetch(calls, "get"))
    };
    let b = {
        let calls = Arc::clone(&calls);
        dedup.dedupe(&post, move || slow_fetch(calls, "post"))
    };
    let (a, b) = tokio::join!(a, b);

    assert_eq!(a, Ok("get".to_string()));
    assert_eq!(b, Ok("post".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stale_execution_is_aborted_for_every_waiter() {
    let dedup: Deduplicator<String, String> = Deduplicator::new(&DedupConfig {
        stale_timeout_ms: 100,
        sweep_interval_ms: 50,
    })
    .expect("test: deduplicator");
    let descriptor = RequestDescriptor::get("/api/hung");

    let hung = || async {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Ok::<_, String>("never".to_string())
    };
    let (a, b) = tokio::join!(dedup.dedupe(&descriptor, hung), dedup.dedupe(&descriptor, hung));

    assert_eq!(a, Err(DedupError::Cancelled));
    assert_eq!(b, Err(DedupError::Cancelled));
    let m = dedup.metrics();
    assert_eq!(m.stale_evictions, 1);
    assert_eq!(m.pending, 0);
}
