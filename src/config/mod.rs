//! # Orchestrator Configuration
//!
//! ## Responsibility
//! Parse and validate TOML configuration for the scheduler, deduplicator and
//! cache. Every field is defaulted, so an empty file is a valid configuration.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `OrchestratorConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building runtime components (each component has a `from_config`)
//! - Reloading on file change

pub mod loader;
pub mod validation;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

// ── Default value functions ──────────────────────────────────────────────

fn default_max_concurrent() -> usize {
    4
}

fn default_queue_timeout_ms() -> u64 {
    60_000
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_category_name() -> String {
    "standard".to_string()
}

fn default_max_queue() -> usize {
    10_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_trials() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_circuit_open_pause_ms() -> u64 {
    100
}

fn default_preventive_base_ms() -> u64 {
    250
}

fn default_preventive_cap_ms() -> u64 {
    10_000
}

fn default_emergency_threshold() -> u32 {
    10
}

fn default_emergency_cooldown_ms() -> u64 {
    60_000
}

fn default_rate_limit_base_ms() -> u64 {
    2_000
}

fn default_rate_limit_cap_ms() -> u64 {
    60_000
}

fn default_stale_timeout_ms() -> u64 {
    30_000
}

fn default_dedup_sweep_ms() -> u64 {
    5_000
}

fn default_cache_max_entries() -> usize {
    500
}

fn default_ttl_ms() -> u64 {
    120_000
}

fn default_ttl_rules() -> Vec<TtlRule> {
    vec![
        TtlRule {
            pattern: "search".into(),
            ttl_ms: 30_000,
        },
        TtlRule {
            pattern: "list".into(),
            ttl_ms: 60_000,
        },
        TtlRule {
            pattern: "detail".into(),
            ttl_ms: 300_000,
        },
    ]
}

fn default_categories() -> BTreeMap<String, CategoryConfig> {
    let mut categories = BTreeMap::new();
    categories.insert(
        "standard".to_string(),
        CategoryConfig {
            url_patterns: Vec::new(),
            max_per_window: 30,
            window_ms: 60_000,
            min_spacing_ms: 200,
            burst_max: 5,
            burst_window_ms: 1_000,
        },
    );
    categories.insert(
        "search".to_string(),
        CategoryConfig {
            url_patterns: vec!["search".to_string()],
            max_per_window: 60,
            window_ms: 60_000,
            min_spacing_ms: 100,
            burst_max: 10,
            burst_window_ms: 1_000,
        },
    );
    categories
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for one orchestrator instance.
///
/// # Example
///
/// ```toml
/// [scheduler]
/// max_concurrent = 2
///
/// [categories.search]
/// url_patterns = ["search"]
/// max_per_window = 60
/// window_ms = 60000
///
/// [cache]
/// max_entries = 500
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OrchestratorConfig {
    /// Admission loop and queue settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Rate-limit categories keyed by tag.
    #[serde(default = "default_categories")]
    pub categories: BTreeMap<String, CategoryConfig>,
    /// Circuit breaker thresholds.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry and backoff for transient failures.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Layered backpressure pauses.
    #[serde(default)]
    pub backpressure: BackpressureConfig,
    /// In-flight coalescing.
    #[serde(default)]
    pub dedup: DedupConfig,
    /// Response cache.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Logging.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            categories: default_categories(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            backpressure: BackpressureConfig::default(),
            dedup: DedupConfig::default(),
            cache: CacheConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

// ── Scheduler ────────────────────────────────────────────────────────────

/// Admission loop and queue settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SchedulerConfig {
    /// Maximum simultaneous in-flight executor calls.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Maximum time (ms) a request may wait in the queue before it is rejected.
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
    /// Interval (ms) of the background timeout sweep.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Per-attempt executor timeout (ms). `None` lets the executor decide.
    #[serde(default)]
    pub execution_timeout_ms: Option<u64>,
    /// Category used when no url pattern matches.
    #[serde(default = "default_category_name")]
    pub default_category: String,
    /// Maximum queued (not yet admitted) requests.
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            queue_timeout_ms: default_queue_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            execution_timeout_ms: None,
            default_category: default_category_name(),
            max_queue: default_max_queue(),
        }
    }
}

impl SchedulerConfig {
    /// Queue timeout as a [`Duration`].
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    /// Sweep interval as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Per-attempt executor timeout, if any.
    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_ms.map(Duration::from_millis)
    }
}

/// Budget for one rate-limit category.
///
/// `min_spacing_ms = 0` disables spacing; `burst_window_ms = 0` disables the
/// burst check.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CategoryConfig {
    /// Url substrings that select this category.
    #[serde(default)]
    pub url_patterns: Vec<String>,
    /// Rolling-window cap.
    pub max_per_window: u32,
    /// Rolling-window length (ms).
    pub window_ms: u64,
    /// Minimum spacing (ms) between two requests of this category.
    #[serde(default)]
    pub min_spacing_ms: u64,
    /// Burst-window cap.
    #[serde(default)]
    pub burst_max: u32,
    /// Burst-window length (ms).
    #[serde(default)]
    pub burst_window_ms: u64,
}

// ── Circuit breaker ──────────────────────────────────────────────────────

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time (ms) the circuit stays open before a probe is allowed.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Concurrent probes admitted while half-open.
    #[serde(default = "default_half_open_trials")]
    pub half_open_max_trials: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_max_trials: default_half_open_trials(),
        }
    }
}

// ── Retry ────────────────────────────────────────────────────────────────

/// Retry and backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay (ms) for exponential backoff. Must be ≤ `max_delay_ms`.
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay (ms) cap for exponential backoff.
    #[serde(default = "default_retry_max_ms")]
    pub max_delay_ms: u64,
    /// Growth factor per retry. Must exceed 1.0, or be at least 1.25 with
    /// jitter, so delays keep increasing.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_retry_base_ms(),
            max_delay_ms: default_retry_max_ms(),
            multiplier: default_multiplier(),
            jitter: default_true(),
        }
    }
}

// ── Backpressure ─────────────────────────────────────────────────────────

/// Layered backpressure pauses, evaluated in order: global pause, circuit
/// breaker, preventive throttle, emergency reset.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BackpressureConfig {
    /// Pause (ms) after failing a request fast because the circuit is open.
    #[serde(default = "default_circuit_open_pause_ms")]
    pub circuit_open_pause_ms: u64,
    /// First preventive pause (ms); doubles per consecutive hit.
    #[serde(default = "default_preventive_base_ms")]
    pub preventive_base_ms: u64,
    /// Preventive pause cap (ms).
    #[serde(default = "default_preventive_cap_ms")]
    pub preventive_cap_ms: u64,
    /// Consecutive preventive hits that trigger an emergency reset.
    #[serde(default = "default_emergency_threshold")]
    pub emergency_threshold: u32,
    /// Cool-down (ms) enforced by an emergency reset.
    #[serde(default = "default_emergency_cooldown_ms")]
    pub emergency_cooldown_ms: u64,
    /// First pause (ms) after an explicit upstream rate-limit response.
    #[serde(default = "default_rate_limit_base_ms")]
    pub rate_limit_base_ms: u64,
    /// Cap (ms) for rate-limit pauses.
    #[serde(default = "default_rate_limit_cap_ms")]
    pub rate_limit_cap_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            circuit_open_pause_ms: default_circuit_open_pause_ms(),
            preventive_base_ms: default_preventive_base_ms(),
            preventive_cap_ms: default_preventive_cap_ms(),
            emergency_threshold: default_emergency_threshold(),
            emergency_cooldown_ms: default_emergency_cooldown_ms(),
            rate_limit_base_ms: default_rate_limit_base_ms(),
            rate_limit_cap_ms: default_rate_limit_cap_ms(),
        }
    }
}

// ── Dedup ────────────────────────────────────────────────────────────────

/// In-flight coalescing settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DedupConfig {
    /// Age (ms) after which a pending execution is force-cancelled.
    #[serde(default = "default_stale_timeout_ms")]
    pub stale_timeout_ms: u64,
    /// Interval (ms) of the stale sweep.
    #[serde(default = "default_dedup_sweep_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            stale_timeout_ms: default_stale_timeout_ms(),
            sweep_interval_ms: default_dedup_sweep_ms(),
        }
    }
}

// ── Cache ────────────────────────────────────────────────────────────────

/// Default TTL for resource names containing `pattern`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TtlRule {
    /// Substring matched against the resource name.
    pub pattern: String,
    /// TTL (ms) for matching entries.
    pub ttl_ms: u64,
}

/// Response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CacheConfig {
    /// Memory tier capacity.
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    /// TTL (ms) when no rule matches.
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
    /// Ordered pattern rules; the first match wins.
    #[serde(default = "default_ttl_rules")]
    pub ttl_rules: Vec<TtlRule>,
    /// Directory of the durable tier. `None` runs memory-only.
    #[serde(default)]
    pub durable_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            default_ttl_ms: default_ttl_ms(),
            ttl_rules: default_ttl_rules(),
            durable_dir: None,
        }
    }
}

// ── Observability ────────────────────────────────────────────────────────

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ObservabilityConfig {
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, colorized log output.
    #[default]
    Pretty,
    /// Structured JSON log output for machine consumption.
    Json,
}

/// Export the JSON Schema for [`OrchestratorConfig`].
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(OrchestratorConfig);
    serde_json::to_string_pretty(&schema)
}
