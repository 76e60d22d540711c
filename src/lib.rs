//! # tokio-upstream-orchestrator
//!
//! Client-side request orchestration in front of a rate-limited,
//! quota-constrained upstream API.
//!
//! ## Architecture
//!
//! Three cooperating components, leaves first:
//! ```text
//! caller → Cache ──miss──→ Deduplicator ──new key──→ Scheduler ──admit──→ executor (network I/O)
//!            ↑                   │ attach to in-flight         │ retry / breaker / throttle
//!            └──── store ────────┴─────────────────────────────┘
//! ```
//!
//! - [`enhanced::CacheLayer`]: two-tier TTL cache with an LRU-bounded memory tier.
//! - [`enhanced::Deduplicator`]: coalesces identical in-flight requests.
//! - [`enhanced::Scheduler`]: priority admission under concurrency, rate and
//!   circuit-breaker constraints, with retry and backoff.
//!
//! [`Orchestrator`] wires the three together for the common read path.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use crate::config::LogFormat;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod enhanced;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod request;

// Re-exports for convenience
pub use enhanced::{EnqueueOptions, Priority};
pub use error::{ErrorClass, SchedulerError, UpstreamError};
pub use orchestrator::{FetchOptions, Orchestrator, OrchestratorMetrics};
pub use request::{Method, RequestDescriptor};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Example
///
/// ```no_run
/// # use tokio_upstream_orchestrator::{init_tracing, OrchestratorError};
/// # fn example() -> Result<(), OrchestratorError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), OrchestratorError> {
    init_tracing_with(LogFormat::Pretty)
}

/// Like [`init_tracing`], but falls back to `default_format` (usually the
/// `[observability]` config section) when `LOG_FORMAT` is unset.
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if the global subscriber has already
/// been set.
pub fn init_tracing_with(default_format: LogFormat) -> Result<(), OrchestratorError> {
    let format = match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => LogFormat::Json,
        Ok(_) => LogFormat::Pretty,
        Err(_) => default_format,
    };

    let result = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| OrchestratorError::Other(format!("tracing init failed: {e}")))
}

/// Top-level orchestrator errors.
///
/// Covers construction-time failures. Per-request failures are reported
/// through [`SchedulerError`] instead.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// A configuration value is missing or invalid.
    ///
    /// Returned at construction time so that misconfiguration surfaces
    /// immediately rather than at the first request.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// The durable cache tier could not be opened.
    #[error("durable store error: {0}")]
    Storage(#[from] std::io::Error),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}
