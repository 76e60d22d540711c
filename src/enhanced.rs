//! Enhanced Features
//!
//! The resilience components the orchestrator is built from: response
//! cache, in-flight deduplication, and the scheduler with its priority queue,
//! rate windows, backpressure controller, circuit breaker and retry policy.

pub mod backpressure;
pub mod cache;
pub mod circuit_breaker;
pub mod dedup;
pub mod priority;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;

// Re-exports
pub use backpressure::{Backpressure, BackpressureStats};
pub use cache::{CacheLayer, CacheMetrics, DurableStore, FileStore, SetOptions, TtlRules};
pub use circuit_breaker::{CircuitBreaker, CircuitStatus};
pub use dedup::{DedupError, DedupMetrics, Deduplicator};
pub use priority::{Priority, PriorityQueue};
pub use rate_limit::{CategoryLimits, RateLimitInfo, RateWindows};
pub use retry::RetryPolicy;
pub use scheduler::{EnqueueOptions, Scheduler, SchedulerMetrics};
