//! Backpressure
//!
//! A single global pause gate in front of admission. Layers, in order of
//! evaluation:
//!
//! 1. an existing global pause blocks everything until it ends,
//! 2. an open circuit fails the head request and pauses briefly,
//! 3. a throttled category opens a preventive pause that doubles per
//!    consecutive hit,
//! 4. too many consecutive preventive hits trigger an emergency reset:
//!    every category window and backoff counter is cleared and one long
//!    cool-down is enforced.
//!
//! Explicit upstream rate-limit responses open their own pause, growing per
//! consecutive strike and never shorter than the upstream's `retry_after`.

use crate::config::BackpressureConfig;
use crate::enhanced::retry::exponential_delay;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// What a preventive throttle hit resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Pause admission for this long.
    Pause(Duration),
    /// Clear every category window and cool down for this long.
    EmergencyReset(Duration),
}

/// Durations from the `[backpressure]` section.
#[derive(Debug, Clone)]
pub struct BackpressureSettings {
    /// Pause after a circuit-open rejection.
    pub circuit_open_pause: Duration,
    /// First preventive pause.
    pub preventive_base: Duration,
    /// Preventive pause cap.
    pub preventive_cap: Duration,
    /// Hits above which an emergency reset fires.
    pub emergency_threshold: u32,
    /// Emergency cool-down.
    pub emergency_cooldown: Duration,
    /// First rate-limit pause.
    pub rate_limit_base: Duration,
    /// Rate-limit pause cap.
    pub rate_limit_cap: Duration,
}

impl BackpressureSettings {
    /// Build from the `[backpressure]` config section.
    pub fn from_config(config: &BackpressureConfig) -> Self {
        Self {
            circuit_open_pause: Duration::from_millis(config.circuit_open_pause_ms),
            preventive_base: Duration::from_millis(config.preventive_base_ms),
            preventive_cap: Duration::from_millis(config.preventive_cap_ms),
            emergency_threshold: config.emergency_threshold.max(1),
            emergency_cooldown: Duration::from_millis(config.emergency_cooldown_ms),
            rate_limit_base: Duration::from_millis(config.rate_limit_base_ms),
            rate_limit_cap: Duration::from_millis(config.rate_limit_cap_ms),
        }
    }
}

/// Counters exposed through scheduler metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct BackpressureStats {
    /// Preventive throttle hits since construction.
    pub preventive_hits: u64,
    /// Emergency resets since construction.
    pub emergency_resets: u64,
    /// Upstream rate-limit responses since construction.
    pub rate_limit_responses: u64,
    /// Circuit-open pauses since construction.
    pub circuit_open_pauses: u64,
}

/// Global pause gate. Not synchronised; owned by the scheduler state.
#[derive(Debug)]
pub struct Backpressure {
    settings: BackpressureSettings,
    pause_until: Option<Instant>,
    consecutive_hits: u32,
    rate_limit_strikes: u32,
    stats: BackpressureStats,
}

impl Backpressure {
    /// Create an idle gate.
    pub fn new(settings: BackpressureSettings) -> Self {
        Self {
            settings,
            pause_until: None,
            consecutive_hits: 0,
            rate_limit_strikes: 0,
            stats: BackpressureStats::default(),
        }
    }

    /// End of the active pause, if one is still running at `now`.
    pub fn paused_until(&self, now: Instant) -> Option<Instant> {
        self.pause_until.filter(|until| *until > now)
    }

    /// Extend the pause to at least `now + duration`. Never shortens it.
    pub fn pause(&mut self, now: Instant, duration: Duration) {
        let until = now
            .checked_add(duration)
            .unwrap_or(now + self.settings.emergency_cooldown);
        self.pause_until = Some(match self.pause_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    /// The circuit rejected the head request.
    pub fn circuit_open(&mut self, now: Instant) {
        self.stats.circuit_open_pauses += 1;
        self.pause(now, self.settings.circuit_open_pause);
    }

    /// A category window refused the head request; `wait` is how long until
    /// the window would admit it.
    pub fn throttled(&mut self, now: Instant, wait: Duration) -> ThrottleDecision {
        self.consecutive_hits = self.consecutive_hits.saturating_add(1);
        self.stats.preventive_hits += 1;

        if self.consecutive_hits > self.settings.emergency_threshold {
            self.consecutive_hits = 0;
            self.rate_limit_strikes = 0;
            self.stats.emergency_resets += 1;
            let cooldown = self.settings.emergency_cooldown;
            self.pause(now, cooldown);
            error!(
                cooldown_ms = cooldown.as_millis() as u64,
                threshold = self.settings.emergency_threshold,
                "backpressure: emergency reset"
            );
            return ThrottleDecision::EmergencyReset(cooldown);
        }

        let backoff = exponential_delay(
            self.settings.preventive_base,
            2.0,
            self.consecutive_hits,
            self.settings.preventive_cap,
        );
        let pause = wait.max(backoff);
        self.pause(now, pause);
        debug!(
            hits = self.consecutive_hits,
            pause_ms = pause.as_millis() as u64,
            "backpressure: preventive pause"
        );
        ThrottleDecision::Pause(pause)
    }

    /// A request was admitted.
    pub fn admitted(&mut self) {
        self.consecutive_hits = 0;
    }

    /// The upstream answered with an explicit rate limit. Returns the pause.
    pub fn rate_limited(&mut self, now: Instant, retry_after: Option<Duration>) -> Duration {
        self.rate_limit_strikes = self.rate_limit_strikes.saturating_add(1);
        self.stats.rate_limit_responses += 1;
        let backoff = exponential_delay(
            self.settings.rate_limit_base,
            2.0,
            self.rate_limit_strikes,
            self.settings.rate_limit_cap,
        );
        let pause = retry_after.unwrap_or(Duration::ZERO).max(backoff);
        self.pause(now, pause);
        warn!(
            strikes = self.rate_limit_strikes,
            pause_ms = pause.as_millis() as u64,
            "backpressure: upstream rate limit"
        );
        pause
    }

    /// An upstream call succeeded.
    pub fn succeeded(&mut self) {
        self.rate_limit_strikes = 0;
    }

    /// Counters since construction.
    pub fn stats(&self) -> BackpressureStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BackpressureSettings {
        BackpressureSettings {
            circuit_open_pause: Duration::from_millis(100),
            preventive_base: Duration::from_millis(250),
            preventive_cap: Duration::from_secs(2),
            emergency_threshold: 3,
            emergency_cooldown: Duration::from_secs(60),
            rate_limit_base: Duration::from_secs(2),
            rate_limit_cap: Duration::from_secs(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_never_shortens() {
        let mut bp = Backpressure::new(settings());
        let now = Instant::now();
        bp.pause(now, Duration::from_secs(5));
        bp.pause(now, Duration::from_secs(1));
        assert_eq!(bp.paused_until(now), Some(now + Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_expires() {
        let mut bp = Backpressure::new(settings());
        bp.circuit_open(Instant::now());
        assert!(bp.paused_until(Instant::now()).is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(bp.paused_until(Instant::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_preventive_pause_doubles_and_respects_window_wait() {
        let mut bp = Backpressure::new(settings());
        let now = Instant::now();
        assert_eq!(
            bp.throttled(now, Duration::from_millis(10)),
            ThrottleDecision::Pause(Duration::from_millis(250))
        );
        assert_eq!(
            bp.throttled(now, Duration::from_millis(10)),
            ThrottleDecision::Pause(Duration::from_millis(500))
        );
        assert_eq!(
            bp.throttled(now, Duration::from_secs(1)),
            ThrottleDecision::Pause(Duration::from_secs(1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_resets_hit_count() {
        let mut bp = Backpressure::new(settings());
        let now = Instant::now();
        bp.throttled(now, Duration::ZERO);
        bp.throttled(now, Duration::ZERO);
        bp.admitted();
        assert_eq!(
            bp.throttled(now, Duration::ZERO),
            ThrottleDecision::Pause(Duration::from_millis(250))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_reset_after_threshold() {
        let mut bp = Backpressure::new(settings());
        let now = Instant::now();
        for _ in 0..3 {
            assert!(matches!(
                bp.throttled(now, Duration::ZERO),
                ThrottleDecision::Pause(_)
            ));
        }
        assert_eq!(
            bp.throttled(now, Duration::ZERO),
            ThrottleDecision::EmergencyReset(Duration::from_secs(60))
        );
        assert_eq!(bp.stats().emergency_resets, 1);
        assert_eq!(bp.stats().preventive_hits, 4);
        assert_eq!(bp.paused_until(now), Some(now + Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_pause_grows_and_honours_retry_after() {
        let mut bp = Backpressure::new(settings());
        let now = Instant::now();
        assert_eq!(bp.rate_limited(now, None), Duration::from_secs(2));
        assert_eq!(bp.rate_limited(now, None), Duration::from_secs(4));
        assert_eq!(
            bp.rate_limited(now, Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
        bp.succeeded();
        assert_eq!(bp.rate_limited(now, None), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_pause_capped() {
        let mut bp = Backpressure::new(settings());
        let now = Instant::now();
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            last = bp.rate_limited(now, None);
        }
        assert_eq!(last, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_reset_clears_rate_limit_strikes() {
        let mut bp = Backpressure::new(settings());
        let now = Instant::now();
        assert_eq!(bp.rate_limited(now, None), Duration::from_secs(2));
        assert_eq!(bp.rate_limited(now, None), Duration::from_secs(4));

        for _ in 0..3 {
            assert!(matches!(bp.throttled(now, Duration::ZERO), ThrottleDecision::Pause(_)));
        }
        assert!(matches!(
            bp.throttled(now, Duration::ZERO),
            ThrottleDecision::EmergencyReset(_)
        ));

        assert_eq!(bp.rate_limited(now, None), Duration::from_secs(2));
    }
}
