//! Hot-path benchmarks for the read pipeline: request signatures, cache
//! lookups, priority queue churn and breaker admission.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio_upstream_orchestrator::enhanced::cache::cache_key;
use tokio_upstream_orchestrator::enhanced::{
    CacheLayer, CircuitBreaker, Priority, PriorityQueue, SetOptions, TtlRules,
};
use tokio_upstream_orchestrator::RequestDescriptor;

// ═══════════════════════════════════════════════════════════════════════════
// Keys
// ═══════════════════════════════════════════════════════════════════════════

fn bench_request_signature(c: &mut Criterion) {
    let descriptor = RequestDescriptor::get("/api/search").params(json!({
        "q": "desk lamp",
        "limit": 25,
        "filters": {"color": ["black", "white"], "in_stock": true},
    }));
    c.bench_function("request_signature", |b| {
        b.iter(|| black_box(black_box(&descriptor).signature()))
    });
}

fn bench_cache_key(c: &mut Criterion) {
    let params = json!({"page": 3, "sort": "name", "dir": "asc"});
    c.bench_function("cache_key", |b| {
        b.iter(|| black_box(cache_key(black_box("item_list"), black_box(&params))))
    });
}

// ═══════════════════════════════════════════════════════════════════════════
// Cache
// ═══════════════════════════════════════════════════════════════════════════

fn memory_cache(max_entries: usize) -> CacheLayer {
    CacheLayer::new_memory(max_entries, TtlRules::new(Vec::new(), Duration::from_secs(300)))
}

fn bench_cache_get_hit(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let cache = memory_cache(500);
    let params = json!({"id": 42});
    rt.block_on(cache.set("item_detail", &params, json!({"name": "lamp"}), SetOptions::default()));

    c.bench_function("cache_get_hit", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(cache.get("item_detail", black_box(&params)).await) })
    });
}

fn bench_cache_set_at_capacity(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("cache_set_at_capacity");

    for capacity in [100usize, 500] {
        let cache = memory_cache(capacity);
        rt.block_on(async {
            for i in 0..capacity {
                cache
                    .set("item_detail", &json!({"id": i}), json!(i), SetOptions::default())
                    .await;
            }
        });
        let mut next = capacity;
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, _| {
            b.iter(|| {
                next += 1;
                rt.block_on(cache.set(
                    "item_detail",
                    &json!({"id": next}),
                    json!(next),
                    SetOptions::default(),
                ));
            })
        });
    }
    group.finish();
}

// ═══════════════════════════════════════════════════════════════════════════
// Scheduler primitives
// ═══════════════════════════════════════════════════════════════════════════

fn bench_priority_queue_push_pop(c: &mut Criterion) {
    c.bench_function("priority_queue_push_pop_4", |b| {
        b.iter(|| {
            let mut queue = PriorityQueue::new();
            queue.push(Priority::Low, 1u32);
            queue.push(Priority::Critical, 2);
            queue.push(Priority::Medium, 3);
            queue.push(Priority::High, 4);
            while let Some(item) = queue.pop() {
                black_box(item);
            }
        })
    });
}

fn bench_breaker_acquire_closed(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let _guard = rt.enter();
    let breaker = CircuitBreaker::new(5, Duration::from_secs(30), 1);
    c.bench_function("breaker_try_acquire_closed", |b| {
        b.iter(|| black_box(breaker.try_acquire()))
    });
}

criterion_group!(
    benches,
    bench_request_signature,
    bench_cache_key,
    bench_cache_get_hit,
    bench_cache_set_at_capacity,
    bench_priority_queue_push_pop,
    bench_breaker_acquire_closed,
);
criterion_main!(benches);
