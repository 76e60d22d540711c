//! Upstream outcomes and caller-facing request errors.
//!
//! Executors report failures as [`UpstreamError`]; the scheduler classifies
//! them into an [`ErrorClass`] to decide between budget shrink, backoff and
//! immediate rejection. Callers only ever observe [`SchedulerError`].

use std::time::Duration;
use thiserror::Error;

/// Failure reported by an executor performing the real network call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// The upstream explicitly throttled the call (HTTP 429 or equivalent).
    #[error("upstream rate limited the request")]
    RateLimited {
        /// Upstream hint for how long to back off, if it sent one.
        retry_after: Option<Duration>,
    },

    /// The call did not complete in time.
    #[error("upstream request timed out")]
    Timeout,

    /// Connection-level failure (DNS, reset, TLS).
    #[error("network error: {0}")]
    Network(String),

    /// Upstream 5xx.
    #[error("upstream server error {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// Upstream 4xx other than rate limiting.
    #[error("upstream rejected request {status}: {message}")]
    Client {
        /// HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },
}

/// How the scheduler treats a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Shrink the category budget, open a long pause, retry.
    RateLimited,
    /// Exponential backoff with jitter, retry.
    Transient,
    /// Surface immediately, never retry.
    Client,
}

impl UpstreamError {
    /// Map an HTTP status code onto an upstream error.
    ///
    /// 429 is rate limiting, 408 a timeout, 5xx a server error and every
    /// other code a client error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => UpstreamError::RateLimited { retry_after: None },
            408 => UpstreamError::Timeout,
            500..=599 => UpstreamError::Server { status, message },
            _ => UpstreamError::Client { status, message },
        }
    }

    /// Classify for retry purposes.
    pub fn class(&self) -> ErrorClass {
        match self {
            UpstreamError::RateLimited { .. } => ErrorClass::RateLimited,
            UpstreamError::Timeout | UpstreamError::Network(_) | UpstreamError::Server { .. } => {
                ErrorClass::Transient
            }
            UpstreamError::Client { .. } => ErrorClass::Client,
        }
    }

    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        self.class() != ErrorClass::Client
    }
}

/// Terminal outcome delivered to a caller whose request did not succeed.
///
/// Cloneable so that every waiter on a coalesced request observes the same
/// rejection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The upstream kept throttling until retries ran out.
    #[error("rate limited after {attempts} attempts")]
    RateLimited {
        /// Total attempts made, including the first.
        attempts: u32,
    },

    /// Timeout, network or 5xx failures until retries ran out.
    #[error("transient failure after {attempts} attempts: {source}")]
    Transient {
        /// Total attempts made, including the first.
        attempts: u32,
        /// The last upstream failure.
        #[source]
        source: UpstreamError,
    },

    /// The upstream rejected the request as invalid; never retried.
    #[error("client error {status}: {message}")]
    ClientError {
        /// HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// The request waited in the queue longer than its timeout.
    #[error("request waited {waited:?} in queue and timed out")]
    QueueTimeout {
        /// How long it had been waiting when evicted.
        waited: Duration,
    },

    /// The circuit breaker is open; the upstream is considered degraded.
    #[error("service degraded: circuit breaker open")]
    CircuitOpen,

    /// The queue already holds `capacity` requests.
    #[error("scheduler queue full ({capacity} requests)")]
    QueueFull {
        /// Configured `max_queue`.
        capacity: usize,
    },

    /// The request was cancelled explicitly.
    #[error("request cancelled")]
    Cancelled,

    /// The scheduler shut down before the request settled.
    #[error("scheduler shutting down")]
    ShuttingDown,
}

impl SchedulerError {
    /// Build the terminal error for an attempt that will not be retried.
    pub(crate) fn exhausted(error: UpstreamError, attempts: u32) -> Self {
        match error {
            UpstreamError::RateLimited { .. } => SchedulerError::RateLimited { attempts },
            UpstreamError::Client { status, message } => {
                SchedulerError::ClientError { status, message }
            }
            other => SchedulerError::Transient {
                attempts,
                source: other,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_classifies_rate_limit() {
        let err = UpstreamError::from_status(429, "slow down");
        assert_eq!(err.class(), ErrorClass::RateLimited);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_from_status_classifies_server_errors_as_transient() {
        for status in [500, 502, 503, 504, 599] {
            let err = UpstreamError::from_status(status, "boom");
            assert_eq!(err.class(), ErrorClass::Transient, "status {status}");
        }
    }

    #[test]
    fn test_from_status_408_is_timeout() {
        assert_eq!(UpstreamError::from_status(408, ""), UpstreamError::Timeout);
    }

    #[test]
    fn test_from_status_other_4xx_is_client() {
        for status in [400, 401, 403, 404, 422] {
            let err = UpstreamError::from_status(status, "bad");
            assert_eq!(err.class(), ErrorClass::Client);
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_network_is_transient() {
        assert_eq!(
            UpstreamError::Network("reset".into()).class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_exhausted_maps_each_class() {
        assert_eq!(
            SchedulerError::exhausted(UpstreamError::RateLimited { retry_after: None }, 4),
            SchedulerError::RateLimited { attempts: 4 }
        );
        assert_eq!(
            SchedulerError::exhausted(UpstreamError::from_status(404, "missing"), 1),
            SchedulerError::ClientError {
                status: 404,
                message: "missing".into()
            }
        );
        assert!(matches!(
            SchedulerError::exhausted(UpstreamError::Timeout, 3),
            SchedulerError::Transient { attempts: 3, .. }
        ));
    }

    #[test]
    fn test_circuit_open_message_mentions_degraded() {
        assert!(SchedulerError::CircuitOpen.to_string().contains("degraded"));
    }
}
