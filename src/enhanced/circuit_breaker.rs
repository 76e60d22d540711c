//! Circuit Breaker
//!
//! Fails fast while the upstream is unhealthy instead of spending quota on
//! calls that are likely to fail.
//!
//! ## States
//! - **Closed**: Normal operation, requests flow through
//! - **Open**: Upstream failing, requests rejected immediately
//! - **Half-Open**: Probe requests test whether the upstream recovered
//!
//! `Open` always becomes `HalfOpen` once the recovery timeout has elapsed
//! since the last failure; [`CircuitBreaker::recovery_deadline`] exposes that
//! instant so a scheduler can arm a wake-up for it.
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio_upstream_orchestrator::enhanced::CircuitBreaker;
//! use tokio_upstream_orchestrator::enhanced::circuit_breaker::CircuitBreakerError;
//! # #[tokio::main]
//! # async fn main() {
//! let breaker = CircuitBreaker::new(5, Duration::from_secs(30), 1);
//!
//! match breaker.call(|| async { Ok::<&str, &str>("payload") }).await {
//!     Ok(result) => println!("{result}"),
//!     Err(CircuitBreakerError::Open) => { /* fail fast */ }
//!     Err(CircuitBreakerError::Failed(e)) => eprintln!("call failed: {e}"),
//! }
//! # }
//! ```

use crate::config::CircuitBreakerConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker for preventing cascading failures
#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<Mutex<CircuitState>>,
    config: BreakerSettings,
}

#[derive(Debug, Clone)]
struct BreakerSettings {
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_max_trials: u32,
}

#[derive(Debug)]
struct CircuitState {
    status: CircuitStatus,
    consecutive_failures: u32,
    total_failures: u64,
    total_successes: u64,
    times_opened: u64,
    trials_in_flight: u32,
    last_failure_time: Option<Instant>,
    last_state_change: Instant,
}

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Requests flow through normally.
    Closed,
    /// Requests are rejected immediately without calling the upstream.
    Open,
    /// A limited number of probe requests test recovery.
    HalfOpen,
}

/// Outcome of asking the breaker whether a request may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed circuit; proceed normally.
    Allowed,
    /// Half-open circuit; proceed as a recovery probe.
    Trial,
    /// Open circuit; fail fast.
    Rejected,
    /// Half-open with every probe slot taken; wait for a probe to settle.
    TrialsExhausted,
}

impl Admission {
    /// Whether the request may be executed now.
    pub fn is_permitted(&self) -> bool {
        matches!(self, Admission::Allowed | Admission::Trial)
    }
}

/// Circuit breaker errors
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, request rejected
    Open,
    /// Operation failed
    Failed(E),
}

impl CircuitBreaker {
    /// Create new circuit breaker
    ///
    /// # Arguments
    /// * `failure_threshold` - Consecutive failures before opening
    /// * `recovery_timeout` - How long to stay open before probing recovery
    /// * `half_open_max_trials` - Concurrent probes allowed while half-open
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, half_open_max_trials: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(CircuitState {
                status: CircuitStatus::Closed,
                consecutive_failures: 0,
                total_failures: 0,
                total_successes: 0,
                times_opened: 0,
                trials_in_flight: 0,
                last_failure_time: None,
                last_state_change: Instant::now(),
            })),
            config: BreakerSettings {
                failure_threshold: failure_threshold.max(1),
                recovery_timeout,
                half_open_max_trials: half_open_max_trials.max(1),
            },
        }
    }

    /// Build from the `[circuit_breaker]` config section.
    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(
            config.failure_threshold,
            Duration::from_millis(config.recovery_timeout_ms),
            config.half_open_max_trials,
        )
    }

    /// Ask whether a request may proceed, reserving a probe slot when half-open.
    ///
    /// A [`Admission::Trial`] must be settled with `record_success(true)` or
    /// `record_failure(true)` (or [`release_trial`](Self::release_trial) if
    /// the request never ran).
    pub fn try_acquire(&self) -> Admission {
        let mut state = self.state.lock();
        self.refresh(&mut state);

        match state.status {
            CircuitStatus::Closed => Admission::Allowed,
            CircuitStatus::Open => {
                debug!("circuit breaker: request rejected (open)");
                Admission::Rejected
            }
            CircuitStatus::HalfOpen => {
                if state.trials_in_flight < self.config.half_open_max_trials {
                    state.trials_in_flight += 1;
                    Admission::Trial
                } else {
                    Admission::TrialsExhausted
                }
            }
        }
    }

    /// Return an unused probe slot.
    pub fn release_trial(&self) {
        let mut state = self.state.lock();
        state.trials_in_flight = state.trials_in_flight.saturating_sub(1);
    }

    /// Execute operation through circuit breaker
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let admission = self.try_acquire();
        if !admission.is_permitted() {
            return Err(CircuitBreakerError::Open);
        }
        let trial = admission == Admission::Trial;

        let result = f().await;

        match &result {
            Ok(_) => self.record_success(trial),
            Err(_) => self.record_failure(trial),
        }

        result.map_err(CircuitBreakerError::Failed)
    }

    /// Record a successful upstream call. Closes a half-open circuit.
    pub fn record_success(&self, trial: bool) {
        let mut state = self.state.lock();
        self.refresh(&mut state);

        state.total_successes += 1;
        state.consecutive_failures = 0;
        if trial {
            state.trials_in_flight = state.trials_in_flight.saturating_sub(1);
        }

        if state.status == CircuitStatus::HalfOpen {
            state.status = CircuitStatus::Closed;
            state.trials_in_flight = 0;
            state.last_state_change = Instant::now();
            info!("circuit breaker: closing (upstream recovered)");
        }
    }

    /// Record a failed upstream call.
    ///
    /// Opens a closed circuit at the threshold and reopens a half-open one
    /// immediately, restarting the recovery timer. Late failures from calls
    /// admitted before the circuit opened do not extend an open circuit.
    pub fn record_failure(&self, trial: bool) {
        let mut state = self.state.lock();
        self.refresh(&mut state);

        state.total_failures += 1;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if trial {
            state.trials_in_flight = state.trials_in_flight.saturating_sub(1);
        }

        let now = Instant::now();
        match state.status {
            CircuitStatus::Closed => {
                state.last_failure_time = Some(now);
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.status = CircuitStatus::Open;
                    state.times_opened += 1;
                    state.last_state_change = now;
                    warn!(
                        failures = state.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        recovery_ms = self.config.recovery_timeout.as_millis() as u64,
                        "circuit breaker: opening (threshold exceeded)"
                    );
                } else {
                    debug!(
                        failures = state.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker: failure recorded"
                    );
                }
            }
            CircuitStatus::HalfOpen => {
                state.status = CircuitStatus::Open;
                state.times_opened += 1;
                state.trials_in_flight = 0;
                state.last_failure_time = Some(now);
                state.last_state_change = now;
                warn!("circuit breaker: reopening (half-open probe failed)");
            }
            CircuitStatus::Open => {}
        }
    }

    fn refresh(&self, state: &mut CircuitState) {
        if state.status != CircuitStatus::Open {
            return;
        }
        let elapsed = state
            .last_failure_time
            .map(|t| t.elapsed() >= self.config.recovery_timeout)
            .unwrap_or(true);
        if elapsed {
            state.status = CircuitStatus::HalfOpen;
            state.trials_in_flight = 0;
            state.last_state_change = Instant::now();
            info!("circuit breaker: transitioning to half-open");
        }
    }

    /// Instant at which an open circuit becomes half-open. `None` unless open.
    pub fn recovery_deadline(&self) -> Option<Instant> {
        let mut state = self.state.lock();
        self.refresh(&mut state);
        match state.status {
            CircuitStatus::Open => state
                .last_failure_time
                .map(|t| t + self.config.recovery_timeout),
            _ => None,
        }
    }

    /// Get current circuit status
    pub fn status(&self) -> CircuitStatus {
        let mut state = self.state.lock();
        self.refresh(&mut state);
        state.status
    }

    /// Get circuit breaker statistics
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut state = self.state.lock();
        self.refresh(&mut state);

        CircuitBreakerStats {
            status: state.status,
            consecutive_failures: state.consecutive_failures,
            total_failures: state.total_failures,
            total_successes: state.total_successes,
            times_opened: state.times_opened,
            time_in_current_state: state.last_state_change.elapsed(),
        }
    }

    /// Manually reset circuit breaker to closed state
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.status = CircuitStatus::Closed;
        state.consecutive_failures = 0;
        state.trials_in_flight = 0;
        state.last_state_change = Instant::now();
        info!("circuit breaker: manually reset to closed");
    }

    /// Force circuit to open state (for testing/maintenance)
    pub fn trip(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.status = CircuitStatus::Open;
        state.times_opened += 1;
        state.last_failure_time = Some(now);
        state.last_state_change = now;
        warn!("circuit breaker: manually tripped to open");
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitBreakerStats {
    /// Current state of the circuit breaker.
    pub status: CircuitStatus,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Failures recorded since construction.
    pub total_failures: u64,
    /// Successes recorded since construction.
    pub total_successes: u64,
    /// Number of times the circuit has opened.
    pub times_opened: u64,
    /// Time spent in the current state.
    pub time_in_current_state: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_on_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(5), 1);

        for _ in 0..3 {
            let result: Result<(), CircuitBreakerError<()>> =
                breaker.call(|| async { Err(()) }).await;
            assert!(result.is_err());
        }

        assert_eq!(breaker.status(), CircuitStatus::Open);

        let result: Result<(), CircuitBreakerError<()>> = breaker.call(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Open)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(5), 1);
        breaker.record_failure(false);
        breaker.record_failure(false);
        breaker.record_success(false);
        breaker.record_failure(false);
        breaker.record_failure(false);
        assert_eq!(breaker.status(), CircuitStatus::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_transitions_to_half_open_after_timeout() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(100), 1);
        breaker.record_failure(false);
        assert_eq!(breaker.status(), CircuitStatus::Open);

        let deadline = breaker.recovery_deadline().expect("test: open circuit has deadline");
        tokio::time::sleep_until(deadline).await;

        assert_eq!(breaker.status(), CircuitStatus::HalfOpen);
        assert!(breaker.recovery_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(100), 1);
        breaker.record_failure(false);
        breaker.record_failure(false);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(breaker.try_acquire(), Admission::Trial);
        breaker.record_success(true);
        assert_eq!(breaker.status(), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_and_resets_timer() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(100), 1);
        breaker.record_failure(false);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(breaker.try_acquire(), Admission::Trial);
        breaker.record_failure(true);
        assert_eq!(breaker.status(), CircuitStatus::Open);

        let deadline = breaker.recovery_deadline().expect("test: reopened");
        assert!(deadline >= Instant::now() + Duration::from_millis(100));
        assert_eq!(breaker.stats().times_opened, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_concurrent_trials() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10), 1);
        breaker.record_failure(false);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(breaker.try_acquire(), Admission::Trial);
        assert_eq!(breaker.try_acquire(), Admission::TrialsExhausted);
        breaker.release_trial();
        assert_eq!(breaker.try_acquire(), Admission::Trial);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_failure_does_not_extend_open_circuit() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(100), 1);
        breaker.record_failure(false);
        let first = breaker.recovery_deadline();
        tokio::time::sleep(Duration::from_millis(50)).await;
        breaker.record_failure(false);
        assert_eq!(breaker.recovery_deadline(), first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reset_and_trip() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60), 1);
        breaker.trip();
        assert_eq!(breaker.status(), CircuitStatus::Open);
        assert_eq!(breaker.try_acquire(), Admission::Rejected);

        breaker.reset();
        assert_eq!(breaker.status(), CircuitStatus::Closed);
        assert_eq!(breaker.try_acquire(), Admission::Allowed);
    }

    #[test]
    fn test_from_config_clamps_zero_values() {
        let breaker = CircuitBreaker::new(0, Duration::from_secs(1), 0);
        assert_eq!(breaker.config.failure_threshold, 1);
        assert_eq!(breaker.config.half_open_max_trials, 1);
    }
}
