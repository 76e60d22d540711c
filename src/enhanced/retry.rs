//! Retry Logic
//!
//! Exponential backoff with jitter for transient upstream failures. The
//! scheduler owns the retry loop (it re-enqueues with a demoted priority);
//! this module only decides how many retries are allowed and how long each
//! one waits.
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//! use tokio_upstream_orchestrator::enhanced::RetryPolicy;
//!
//! let policy = RetryPolicy::exponential(3, Duration::from_millis(100), Duration::from_secs(5))
//!     .without_jitter();
//!
//! assert_eq!(policy.delay(1), Duration::from_millis(100));
//! assert_eq!(policy.delay(2), Duration::from_millis(200));
//! assert!(policy.allows(3));
//! assert!(!policy.allows(4));
//! ```

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Retry policy configuration
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor per retry.
    pub multiplier: f64,
    /// Whether to add up to 25% random jitter.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Doubling backoff with jitter.
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Build from the `[retry]` config section.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }

    /// Same policy with deterministic delays.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Same policy with a different retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether retry number `retry` (1-based) is within budget.
    pub fn allows(&self, retry: u32) -> bool {
        retry <= self.max_retries
    }

    /// Delay before retry number `retry` (1-based).
    ///
    /// Jitter is added before capping, so delays strictly increase until they
    /// reach `max_delay` whenever `multiplier` is at least 1.25.
    pub fn delay(&self, retry: u32) -> Duration {
        let raw = exponential_delay(self.base_delay, self.multiplier, retry, self.max_delay);
        let jittered = if self.jitter { with_jitter(raw) } else { raw };
        jittered.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// `base * multiplier^(n-1)`, capped. `n` is 1-based; `n = 0` yields `base`.
pub fn exponential_delay(base: Duration, multiplier: f64, n: u32, cap: Duration) -> Duration {
    let exponent = n.saturating_sub(1).min(63) as i32;
    let factor = multiplier.powi(exponent);
    if !factor.is_finite() || base.as_secs_f64() * factor >= cap.as_secs_f64() {
        return cap;
    }
    base.mul_f64(factor).min(cap)
}

/// Retry with jitter to prevent thundering herd
pub fn with_jitter(duration: Duration) -> Duration {
    let quarter = duration.as_millis() / 4;
    if quarter == 0 {
        return duration;
    }
    let jitter = rand::thread_rng().gen_range(0..quarter);
    duration + Duration::from_millis(jitter as u64)
}
