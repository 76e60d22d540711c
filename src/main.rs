//! Demo binary for tokio-upstream-orchestrator
//!
//! Drives a simulated flaky upstream through the orchestrator and prints the
//! resulting metrics.
//!
//! ## Usage
//!
//! ```text
//! orchestrator-demo [config.toml]
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json|pretty`: overrides `[observability] log_format`
//! - `RUST_LOG=info`: log level filter

use rand::Rng;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_upstream_orchestrator::config::loader;
use tokio_upstream_orchestrator::{
    init_tracing_with, metrics, EnqueueOptions, FetchOptions, Orchestrator, Priority,
    RequestDescriptor, UpstreamError,
};
use tracing::{info, warn};

/// Pretend network call: mostly succeeds, sometimes throttles or fails.
async fn simulated_upstream(url: String, params: Value) -> Result<Value, UpstreamError> {
    let (latency, roll) = {
        let mut rng = rand::thread_rng();
        (rng.gen_range(20..120), rng.gen_range(0..100))
    };
    tokio::time::sleep(Duration::from_millis(latency)).await;
    match roll {
        0..=4 => Err(UpstreamError::RateLimited {
            retry_after: Some(Duration::from_millis(500)),
        }),
        5..=14 => Err(UpstreamError::from_status(503, "service unavailable")),
        15..=17 => Err(UpstreamError::from_status(404, "not found")),
        _ => Ok(json!({ "url": url, "params": params, "latency_ms": latency })),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args().nth(1);
    let config = loader::load_or_default(path.as_deref().map(Path::new))?;
    let _ = init_tracing_with(config.observability.log_format.clone());
    metrics::init_metrics()?;
    let orchestrator = Arc::new(Orchestrator::new(&config)?);
    info!("starting tokio-upstream-orchestrator demo");

    let requests = [
        ("item_list", "/api/items", json!({"page": 1}), Priority::Medium),
        ("item_list", "/api/items", json!({"page": 1}), Priority::Medium),
        ("item_detail", "/api/items/7", Value::Null, Priority::High),
        ("item_search", "/api/search", json!({"q": "lamp", "limit": 10}), Priority::Critical),
        ("item_search", "/api/search", json!({"limit": 10, "q": "lamp"}), Priority::Critical),
        ("item_detail", "/api/items/8", Value::Null, Priority::Low),
        ("item_list", "/api/items", json!({"page": 2}), Priority::Low),
        ("item_detail", "/api/items/9", Value::Null, Priority::Medium),
    ];

    let mut handles = Vec::new();
    for (resource, url, params, priority) in requests {
        let orchestrator = Arc::clone(&orchestrator);
        handles.push(tokio::spawn(async move {
            let descriptor = RequestDescriptor::get(url).params(params);
            let options = FetchOptions {
                enqueue: EnqueueOptions::priority(priority),
                ..FetchOptions::default()
            };
            let call_url = descriptor.url.clone();
            let call_params = descriptor.params.clone();
            let result = orchestrator
                .fetch(resource, &descriptor, options, move || {
                    simulated_upstream(call_url.clone(), call_params.clone())
                })
                .await;
            match result {
                Ok(value) => info!(resource = resource, value = %value, "fetched"),
                Err(e) => warn!(resource = resource, error = %e, "fetch failed"),
            }
        }));
    }
    for handle in handles {
        handle.await?;
    }

    // Second pass is served from the cache.
    let cached = orchestrator
        .cache()
        .get("item_list", &json!({"page": 1}))
        .await;
    info!(hit = cached.is_some(), "cache check");

    let snapshot = orchestrator.metrics();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    println!("{}", metrics::gather_text());

    orchestrator.shutdown();
    info!("demo complete");
    Ok(())
}
