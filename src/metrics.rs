//! Prometheus metrics for the orchestrator.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`inc_request`, `inc_cache_event`, …) are no-ops if `init_metrics` was
//! never called, so the orchestrator is always safe to run and observability
//! simply degrades gracefully.
//!
//! Components also keep their own in-process counters (see
//! `SchedulerMetrics`, `DedupMetrics`, `CacheMetrics`); the Prometheus
//! series here mirror them for scraping.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `orchestrator_requests_total` | Counter | `outcome` |
//! | `orchestrator_retries_total` | Counter | `class` |
//! | `orchestrator_backpressure_events_total` | Counter | `kind` |
//! | `orchestrator_queue_wait_seconds` | Histogram | (none) |
//! | `orchestrator_queue_depth` | Gauge | `state` |
//! | `orchestrator_dedup_total` | Counter | `outcome` |
//! | `orchestrator_cache_events_total` | Counter | `event` |

use crate::OrchestratorError;
use prometheus::{
    core::Collector, CounterVec, Encoder, Histogram, HistogramOpts, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the orchestrator, bundled together so they can
/// be stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Settled scheduler requests by outcome.
    pub requests_total: CounterVec,
    /// Retries scheduled by error class.
    pub retries_total: CounterVec,
    /// Backpressure pauses by kind.
    pub backpressure_events: CounterVec,
    /// Time between a request becoming ready and being admitted.
    pub queue_wait: Histogram,
    /// Current queued / delayed / processing counts.
    pub queue_depth: IntGaugeVec,
    /// Deduplicator calls by outcome.
    pub dedup_total: CounterVec,
    /// Cache events by kind.
    pub cache_events: CounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<CounterVec, OrchestratorError> {
    let counter = CounterVec::new(Opts::new(name, help), labels)
        .map_err(|e| OrchestratorError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| OrchestratorError::Other(format!("metrics registration failed: {e}")))?;
    Ok(counter)
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if metric construction or registry
/// registration fails (e.g., duplicate descriptor names).
pub fn init_metrics() -> Result<(), OrchestratorError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let requests_total = counter_vec(
        &registry,
        "orchestrator_requests_total",
        "Settled scheduler requests by outcome",
        &["outcome"],
    )?;
    let retries_total = counter_vec(
        &registry,
        "orchestrator_retries_total",
        "Retries scheduled by error class",
        &["class"],
    )?;
    let backpressure_events = counter_vec(
        &registry,
        "orchestrator_backpressure_events_total",
        "Admission pauses by kind",
        &["kind"],
    )?;
    let dedup_total = counter_vec(
        &registry,
        "orchestrator_dedup_total",
        "Deduplicator calls by outcome",
        &["outcome"],
    )?;
    let cache_events = counter_vec(
        &registry,
        "orchestrator_cache_events_total",
        "Cache events by kind",
        &["event"],
    )?;

    let queue_wait = Histogram::with_opts(HistogramOpts::new(
        "orchestrator_queue_wait_seconds",
        "Time from ready to admitted",
    ))
    .map_err(|e| OrchestratorError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(queue_wait.clone()))
        .map_err(|e| OrchestratorError::Other(format!("metrics registration failed: {e}")))?;

    let queue_depth = IntGaugeVec::new(
        Opts::new("orchestrator_queue_depth", "Scheduler requests by state"),
        &["state"],
    )
    .map_err(|e| OrchestratorError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(queue_depth.clone()))
        .map_err(|e| OrchestratorError::Other(format!("metrics registration failed: {e}")))?;

    // Losing a race here is harmless: both bundles carry identical descriptors.
    let _ = METRICS.set(Metrics {
        registry,
        requests_total,
        retries_total,
        backpressure_events,
        queue_wait,
        queue_depth,
        dedup_total,
        cache_events,
    });

    Ok(())
}

/// Return a reference to the initialised [`Metrics`], or `None` if
/// [`init_metrics`] has not been called yet.
fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

fn inc_label(vec: impl Fn(&Metrics) -> &CounterVec, label: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = vec(m).get_metric_with_label_values(&[label]) {
            c.inc();
        }
    }
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count a settled scheduler request (`completed`, `failed`, `timed_out`,
/// `cancelled`, `circuit_open`).
///
/// No-op if metrics have not been initialised.
pub fn inc_request(outcome: &str) {
    inc_label(|m| &m.requests_total, outcome);
}

/// Count a scheduled retry (`rate_limited` or `transient`).
///
/// No-op if metrics have not been initialised.
pub fn inc_retry(class: &str) {
    inc_label(|m| &m.retries_total, class);
}

/// Count a backpressure pause (`preventive`, `emergency`, `rate_limit`,
/// `circuit_open`).
///
/// No-op if metrics have not been initialised.
pub fn inc_backpressure(kind: &str) {
    inc_label(|m| &m.backpressure_events, kind);
}

/// Count a deduplicator call (`executed` or `coalesced`).
///
/// No-op if metrics have not been initialised.
pub fn inc_dedup(outcome: &str) {
    inc_label(|m| &m.dedup_total, outcome);
}

/// Count a cache event (`hit`, `miss`, `durable_hit`, `eviction`,
/// `expiration`).
///
/// No-op if metrics have not been initialised.
pub fn inc_cache_event(event: &str) {
    inc_label(|m| &m.cache_events, event);
}

/// Observe how long an admitted request waited while ready.
///
/// No-op if metrics have not been initialised.
pub fn record_queue_wait(d: Duration) {
    if let Some(m) = metrics() {
        m.queue_wait.observe(d.as_secs_f64());
    }
}

/// Set the scheduler depth gauge for one state (`queued`, `delayed`,
/// `processing`).
///
/// No-op if metrics have not been initialised.
pub fn set_queue_depth(state: &str, depth: i64) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.queue_depth.get_metric_with_label_values(&[state]) {
            g.set(depth);
        }
    }
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
pub fn gather_text() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Current values of a labelled counter, keyed by label value.
///
/// Returns an empty map if metrics have not been initialised or `name` is
/// not one of the counters above.
pub fn counter_values(name: &str) -> HashMap<String, u64> {
    let Some(m) = metrics() else {
        return HashMap::new();
    };
    let vec = match name {
        "orchestrator_requests_total" => &m.requests_total,
        "orchestrator_retries_total" => &m.retries_total,
        "orchestrator_backpressure_events_total" => &m.backpressure_events,
        "orchestrator_dedup_total" => &m.dedup_total,
        "orchestrator_cache_events_total" => &m.cache_events,
        _ => return HashMap::new(),
    };

    let mut values = HashMap::new();
    for family in vec.collect() {
        for metric in family.get_metric() {
            let label = metric
                .get_label()
                .first()
                .map_or("unknown", |l| l.get_value());
            values.insert(label.to_string(), metric.get_counter().get_value() as u64);
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok(), "second call must be a no-op");
    }

    #[test]
    fn test_helpers_after_init_are_visible_in_text() {
        init_metrics().expect("test: init metrics");
        inc_request("completed");
        inc_cache_event("hit");
        record_queue_wait(Duration::from_millis(5));
        set_queue_depth("queued", 3);

        let text = gather_text();
        assert!(text.contains("orchestrator_requests_total"));
        assert!(text.contains("orchestrator_cache_events_total"));
        assert!(text.contains("orchestrator_queue_wait_seconds"));
    }

    #[test]
    fn test_counter_values_reflect_increments() {
        init_metrics().expect("test: init metrics");
        let before = counter_values("orchestrator_dedup_total")
            .get("coalesced")
            .copied()
            .unwrap_or(0);
        inc_dedup("coalesced");
        inc_dedup("coalesced");
        let after = counter_values("orchestrator_dedup_total")
            .get("coalesced")
            .copied()
            .unwrap_or(0);
        assert!(after >= before + 2);
    }

    #[test]
    fn test_counter_values_unknown_name_is_empty() {
        assert!(counter_values("no_such_metric").is_empty());
    }

    #[test]
    fn test_fresh_registry_counter_starts_at_zero() {
        let registry = Registry::new();
        let c = counter_vec(&registry, "t_requests_total", "test", &["outcome"])
            .expect("test: counter registers");
        let child = c
            .get_metric_with_label_values(&["completed"])
            .expect("test: label matches");
        assert_eq!(child.get() as u64, 0);
        child.inc();
        assert_eq!(child.get() as u64, 1);
    }
}
