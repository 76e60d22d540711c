//! # Cache Integration Tests
//!
//! Capacity-bounded LRU eviction, TTL expiry and durable-tier promotion
//! through the public `CacheLayer` API.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_upstream_orchestrator::config::CacheConfig;
use tokio_upstream_orchestrator::enhanced::{CacheLayer, FileStore, SetOptions, TtlRules};
use tokio_upstream_orchestrator::Priority;

fn memory_cache(max_entries: usize) -> CacheLayer {
    CacheLayer::new_memory(max_entries, TtlRules::new(Vec::new(), Duration::from_secs(60)))
}

fn id(i: usize) -> Value {
    json!({ "id": i })
}

#[tokio::test(start_paused = true)]
async fn test_overflow_by_one_evicts_only_the_oldest_key() {
    let cache = memory_cache(500);
    for i in 0..=500 {
        cache
            .set("item_detail", &id(i), json!(i), SetOptions::default())
            .await;
    }

    let m = cache.metrics();
    assert_eq!(m.size, 500);
    assert_eq!(m.evictions, 1);
    assert_eq!(cache.get("item_detail", &id(0)).await, None);
    for i in [1, 250, 499, 500] {
        assert_eq!(cache.get("item_detail", &id(i)).await, Some(json!(i)));
    }
}

#[tokio::test(start_paused = true)]
async fn test_recent_read_protects_entry_from_eviction() {
    let cache = memory_cache(3);
    for i in 0..3 {
        cache.set("item_detail", &id(i), json!(i), SetOptions::default()).await;
    }
    tokio::time::advance(Duration::from_millis(10)).await;
    assert!(cache.get("item_detail", &id(0)).await.is_some());

    cache.set("item_detail", &id(3), json!(3), SetOptions::default()).await;

    assert!(cache.get("item_detail", &id(0)).await.is_some());
    assert_eq!(cache.get("item_detail", &id(1)).await, None);
    assert!(cache.get("item_detail", &id(2)).await.is_some());
    assert!(cache.get("item_detail", &id(3)).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_ttl_rules_pick_per_resource_lifetimes() {
    let cache = CacheLayer::from_config(&CacheConfig::default()).expect("test: cache");
    let params = json!({"q": "lamp"});
    cache.set("item_search", &params, json!(["a"]), SetOptions::default()).await;
    cache.set("item_detail", &params, json!({"a": 1}), SetOptions::default()).await;

    // Past the 30s search rule, inside the 5min detail rule.
    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(cache.get("item_search", &params).await, None);
    assert_eq!(cache.get("item_detail", &params).await, Some(json!({"a": 1})));

    let m = cache.metrics();
    assert_eq!(m.expirations, 1);
    assert_eq!(m.hits, 1);
    assert_eq!(m.misses, 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_pattern_removes_matching_resources() {
    let cache = memory_cache(10);
    cache.set("item_list", &id(1), json!(1), SetOptions::default()).await;
    cache.set("item_list", &id(2), json!(2), SetOptions::default()).await;
    cache.set("user_profile", &id(1), json!("u"), SetOptions::default()).await;

    assert_eq!(cache.invalidate_pattern("item_list").await, 2);
    assert_eq!(cache.get("item_list", &id(1)).await, None);
    assert_eq!(cache.get("user_profile", &id(1)).await, Some(json!("u")));
}

#[tokio::test]
async fn test_durable_tier_survives_a_fresh_memory_tier() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let store = Arc::new(FileStore::open(dir.path()).expect("test: file store"));
    let params = json!({"id": 42});

    let writer = memory_cache(10).with_durable(store.clone());
    writer
        .set(
            "item_detail",
            &params,
            json!({"name": "lamp"}),
            SetOptions::default().with_priority(Priority::High),
        )
        .await;
    writer
        .set("item_detail", &id(7), json!("volatile"), SetOptions::default())
        .await;

    // A new process: empty memory tier over the same directory.
    let reader = memory_cache(10).with_durable(store);
    assert_eq!(
        reader.get("item_detail", &params).await,
        Some(json!({"name": "lamp"}))
    );
    assert_eq!(reader.get("item_detail", &id(7)).await, None);

    let m = reader.metrics();
    assert_eq!(m.durable_hits, 1);
    assert_eq!(m.size, 1, "durable hit is promoted into memory");
}
