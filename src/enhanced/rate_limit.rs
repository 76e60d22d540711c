//! Rate Limiting
//!
//! Preventive, per-category sliding windows. Each category keeps a history
//! of recent admission instants and is checked against three limits before a
//! request is admitted:
//!
//! 1. minimum spacing since the previous request of the category,
//! 2. a short burst-window cap,
//! 3. a longer rolling-window cap.
//!
//! An explicit upstream rate-limit response halves the category budget
//! (never below one) and clears its history; each success afterwards grows
//! the budget back by one until it reaches the configured cap.
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//! use tokio::time::Instant;
//! use tokio_upstream_orchestrator::enhanced::rate_limit::{CategoryLimits, RateWindows};
//!
//! let mut windows = RateWindows::new("standard");
//! windows.insert("standard", CategoryLimits::rolling(2, Duration::from_secs(1)));
//!
//! let now = Instant::now();
//! assert!(windows.check("standard", now).is_ok());
//! windows.record("standard", now);
//! windows.record("standard", now);
//! assert!(windows.check("standard", now).is_err());
//! ```

use crate::config::CategoryConfig;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Budget for one category.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryLimits {
    /// Url substrings that select this category.
    pub url_patterns: Vec<String>,
    /// Rolling-window cap.
    pub max_per_window: u32,
    /// Rolling-window length.
    pub window: Duration,
    /// Minimum spacing between two requests. Zero disables the check.
    pub min_spacing: Duration,
    /// Burst-window cap. Zero disables the check.
    pub burst_max: u32,
    /// Burst-window length. Zero disables the check.
    pub burst_window: Duration,
}

impl CategoryLimits {
    /// Only a rolling-window cap.
    pub fn rolling(max_per_window: u32, window: Duration) -> Self {
        Self {
            url_patterns: Vec::new(),
            max_per_window,
            window,
            min_spacing: Duration::ZERO,
            burst_max: 0,
            burst_window: Duration::ZERO,
        }
    }

    /// No effective limit.
    pub fn unlimited() -> Self {
        Self::rolling(u32::MAX, Duration::from_millis(1))
    }

    /// Build from a `[categories.<tag>]` config section.
    pub fn from_config(config: &CategoryConfig) -> Self {
        Self {
            url_patterns: config.url_patterns.clone(),
            max_per_window: config.max_per_window,
            window: Duration::from_millis(config.window_ms),
            min_spacing: Duration::from_millis(config.min_spacing_ms),
            burst_max: config.burst_max,
            burst_window: Duration::from_millis(config.burst_window_ms),
        }
    }
}

/// Which limit refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleReason {
    /// Too soon after the previous request.
    Spacing,
    /// Burst-window cap reached.
    Burst,
    /// Rolling-window cap reached.
    Window,
}

/// A refused admission and how long until it could succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    /// Which limit refused.
    pub reason: ThrottleReason,
    /// Time until the limit admits one more request.
    pub wait: Duration,
}

struct CategoryWindow {
    limits: CategoryLimits,
    history: VecDeque<Instant>,
    budget: u32,
    last_request: Option<Instant>,
}

impl CategoryWindow {
    fn new(limits: CategoryLimits) -> Self {
        Self {
            budget: limits.max_per_window,
            limits,
            history: VecDeque::new(),
            last_request: None,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.history.front() {
            if now.saturating_duration_since(front) >= self.limits.window {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    fn check(&mut self, now: Instant) -> Result<(), Throttle> {
        self.prune(now);

        if !self.limits.min_spacing.is_zero() {
            if let Some(last) = self.last_request {
                let since = now.saturating_duration_since(last);
                if since < self.limits.min_spacing {
                    return Err(Throttle {
                        reason: ThrottleReason::Spacing,
                        wait: self.limits.min_spacing - since,
                    });
                }
            }
        }

        // A zero burst limit disables the burst window.
        if self.limits.burst_max > 0 && !self.limits.burst_window.is_zero() {
            let burst_start = now.checked_sub(self.limits.burst_window);
            let in_burst: Vec<Instant> = self
                .history
                .iter()
                .copied()
                .filter(|t| burst_start.map_or(true, |start| *t > start))
                .collect();
            if in_burst.len() >= self.limits.burst_max as usize {
                let idx = in_burst.len() - self.limits.burst_max as usize;
                let wait = in_burst
                    .get(idx)
                    .map(|t| (*t + self.limits.burst_window).saturating_duration_since(now))
                    .unwrap_or(self.limits.burst_window)
                    .max(Duration::from_millis(1));
                return Err(Throttle {
                    reason: ThrottleReason::Burst,
                    wait,
                });
            }
        }

        if self.history.len() >= self.budget as usize {
            let idx = self.history.len() - self.budget as usize;
            let wait = self
                .history
                .get(idx)
                .map(|t| (*t + self.limits.window).saturating_duration_since(now))
                .unwrap_or(self.limits.window)
                .max(Duration::from_millis(1));
            return Err(Throttle {
                reason: ThrottleReason::Window,
                wait,
            });
        }

        Ok(())
    }

    fn record(&mut self, now: Instant) {
        self.history.push_back(now);
        self.last_request = Some(now);
    }
}

/// Sliding-window histories for every configured category.
pub struct RateWindows {
    categories: BTreeMap<String, CategoryWindow>,
    default_category: String,
}

impl RateWindows {
    /// Empty set of categories. Unknown categories fall back to `default_category`.
    pub fn new(default_category: impl Into<String>) -> Self {
        Self {
            categories: BTreeMap::new(),
            default_category: default_category.into(),
        }
    }

    /// Build from the `[categories]` config table.
    pub fn from_config(
        categories: &BTreeMap<String, CategoryConfig>,
        default_category: &str,
    ) -> Self {
        let mut windows = Self::new(default_category);
        for (name, config) in categories {
            windows.insert(name.clone(), CategoryLimits::from_config(config));
        }
        windows
    }

    /// Add or replace a category.
    pub fn insert(&mut self, name: impl Into<String>, limits: CategoryLimits) {
        self.categories.insert(name.into(), CategoryWindow::new(limits));
    }

    /// Category for a url: the first category whose pattern the url contains,
    /// else the default.
    pub fn classify(&self, url: &str) -> String {
        self.categories
            .iter()
            .find(|(_, w)| w.limits.url_patterns.iter().any(|p| url.contains(p.as_str())))
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| self.default_category.clone())
    }

    fn window_mut(&mut self, category: &str) -> Option<&mut CategoryWindow> {
        if self.categories.contains_key(category) {
            self.categories.get_mut(category)
        } else {
            self.categories.get_mut(&self.default_category)
        }
    }

    /// Whether a request of `category` may be admitted at `now`.
    ///
    /// Categories without configuration are never throttled.
    pub fn check(&mut self, category: &str, now: Instant) -> Result<(), Throttle> {
        match self.window_mut(category) {
            Some(window) => window.check(now),
            None => Ok(()),
        }
    }

    /// Record an admission.
    pub fn record(&mut self, category: &str, now: Instant) {
        if let Some(window) = self.window_mut(category) {
            window.record(now);
        }
    }

    /// Upstream throttled `category`: halve its budget and forget its history.
    pub fn shrink(&mut self, category: &str) {
        if let Some(window) = self.window_mut(category) {
            let before = window.budget;
            window.budget = (window.budget / 2).max(1);
            window.history.clear();
            warn!(
                category = category,
                budget_before = before,
                budget_after = window.budget,
                "rate limit: budget shrunk after upstream throttle"
            );
        }
    }

    /// A request of `category` succeeded: grow a shrunk budget by one.
    pub fn recover(&mut self, category: &str) {
        if let Some(window) = self.window_mut(category) {
            if window.budget < window.limits.max_per_window {
                window.budget += 1;
                debug!(
                    category = category,
                    budget = window.budget,
                    cap = window.limits.max_per_window,
                    "rate limit: budget recovering"
                );
            }
        }
    }

    /// Clear every history and restore every budget.
    pub fn reset_all(&mut self) {
        for window in self.categories.values_mut() {
            window.history.clear();
            window.last_request = None;
            window.budget = window.limits.max_per_window;
        }
        info!("rate limit: all category windows reset");
    }

    /// Usage snapshot for one category.
    pub fn usage(&mut self, category: &str, now: Instant) -> Option<RateLimitInfo> {
        let window = self.window_mut(category)?;
        window.prune(now);
        let used = window.history.len() as u32;
        Some(RateLimitInfo {
            used,
            remaining: window.budget.saturating_sub(used),
            budget: window.budget,
            cap: window.limits.max_per_window,
        })
    }

    /// Usage for every category.
    pub fn usage_all(&mut self, now: Instant) -> BTreeMap<String, RateLimitInfo> {
        let names: Vec<String> = self.categories.keys().cloned().collect();
        names
            .into_iter()
            .filter_map(|name| self.usage(&name, now).map(|info| (name, info)))
            .collect()
    }

    /// Longest rolling window across categories.
    pub fn longest_window(&self) -> Duration {
        self.categories
            .values()
            .map(|w| w.limits.window)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// Rate limit information for a category
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RateLimitInfo {
    /// Requests admitted in the current rolling window.
    pub used: u32,
    /// Requests still admissible in the current rolling window.
    pub remaining: u32,
    /// Current effective budget (shrinks after upstream throttling).
    pub budget: u32,
    /// Configured rolling-window cap.
    pub cap: u32,
}
