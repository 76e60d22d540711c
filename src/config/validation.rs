//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`OrchestratorConfig`] that
//! cannot be expressed through the type system alone (range checks,
//! cross-field invariants).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::OrchestratorConfig;

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "retry.base_delay_ms").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: impl Into<String>, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Validate all semantic constraints on an [`OrchestratorConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Errors
///
/// Returns every [`ConfigError::InvalidField`] found.
pub fn validate(config: &OrchestratorConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Scheduler ────────────────────────────────────────────────────
    if config.scheduler.max_concurrent == 0 {
        errors.push(invalid("scheduler.max_concurrent", 0, "must be at least 1"));
    }
    if config.scheduler.max_queue == 0 {
        errors.push(invalid("scheduler.max_queue", 0, "must be at least 1"));
    }
    if config.scheduler.queue_timeout_ms == 0 {
        errors.push(invalid("scheduler.queue_timeout_ms", 0, "must be at least 1ms"));
    }
    if config.scheduler.sweep_interval_ms == 0 {
        errors.push(invalid("scheduler.sweep_interval_ms", 0, "must be at least 1ms"));
    }
    if config.scheduler.execution_timeout_ms == Some(0) {
        errors.push(invalid(
            "scheduler.execution_timeout_ms",
            0,
            "must be at least 1ms when set",
        ));
    }

    // ── Categories ───────────────────────────────────────────────────
    if config.categories.is_empty() {
        errors.push(invalid("categories", "{}", "at least one category is required"));
    } else if !config
        .categories
        .contains_key(&config.scheduler.default_category)
    {
        errors.push(invalid(
            "scheduler.default_category",
            &config.scheduler.default_category,
            "must name a configured category",
        ));
    }

    let mut longest_window = 0;
    for (name, category) in &config.categories {
        if category.max_per_window == 0 {
            errors.push(invalid(
                format!("categories.{name}.max_per_window"),
                0,
                "must be at least 1",
            ));
        }
        if category.window_ms == 0 {
            errors.push(invalid(
                format!("categories.{name}.window_ms"),
                0,
                "must be at least 1ms",
            ));
        }
        if category.burst_window_ms > 0 && category.burst_max == 0 {
            errors.push(invalid(
                format!("categories.{name}.burst_max"),
                0,
                "must be at least 1 when burst_window_ms is set",
            ));
        }
        longest_window = longest_window.max(category.window_ms);
    }

    // ── Circuit breaker ──────────────────────────────────────────────
    if config.circuit_breaker.failure_threshold == 0 {
        errors.push(invalid(
            "circuit_breaker.failure_threshold",
            0,
            "must be at least 1",
        ));
    }
    if config.circuit_breaker.recovery_timeout_ms == 0 {
        errors.push(invalid(
            "circuit_breaker.recovery_timeout_ms",
            0,
            "must be at least 1ms",
        ));
    }
    if config.circuit_breaker.half_open_max_trials == 0 {
        errors.push(invalid(
            "circuit_breaker.half_open_max_trials",
            0,
            "must be at least 1",
        ));
    }

    // ── Retry ────────────────────────────────────────────────────────
    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        errors.push(invalid(
            "retry.base_delay_ms",
            config.retry.base_delay_ms,
            "must be \u{2264} max_delay_ms",
        ));
    }
    if config.retry.base_delay_ms == 0 {
        errors.push(invalid("retry.base_delay_ms", 0, "must be at least 1ms"));
    }
    // Jitter adds under 25%, so growth must outrun it for delays to keep rising.
    let multiplier = config.retry.multiplier;
    if !multiplier.is_finite() {
        errors.push(invalid("retry.multiplier", multiplier, "must be finite"));
    } else if config.retry.jitter && multiplier < 1.25 {
        errors.push(invalid(
            "retry.multiplier",
            multiplier,
            "must be \u{2265} 1.25 when jitter is enabled",
        ));
    } else if !config.retry.jitter && multiplier <= 1.0 {
        errors.push(invalid("retry.multiplier", multiplier, "must be > 1.0"));
    }

    // ── Backpressure ─────────────────────────────────────────────────
    let bp = &config.backpressure;
    if bp.preventive_base_ms > bp.preventive_cap_ms {
        errors.push(invalid(
            "backpressure.preventive_base_ms",
            bp.preventive_base_ms,
            "must be \u{2264} preventive_cap_ms",
        ));
    }
    if bp.rate_limit_base_ms > bp.rate_limit_cap_ms {
        errors.push(invalid(
            "backpressure.rate_limit_base_ms",
            bp.rate_limit_base_ms,
            "must be \u{2264} rate_limit_cap_ms",
        ));
    }
    if bp.emergency_threshold == 0 {
        errors.push(invalid(
            "backpressure.emergency_threshold",
            0,
            "must be at least 1",
        ));
    }
    if bp.emergency_cooldown_ms < longest_window {
        errors.push(invalid(
            "backpressure.emergency_cooldown_ms",
            bp.emergency_cooldown_ms,
            "must be \u{2265} the longest category window_ms",
        ));
    }

    // ── Dedup ────────────────────────────────────────────────────────
    if config.dedup.stale_timeout_ms == 0 {
        errors.push(invalid("dedup.stale_timeout_ms", 0, "must be at least 1ms"));
    }
    if config.dedup.sweep_interval_ms == 0 {
        errors.push(invalid("dedup.sweep_interval_ms", 0, "must be at least 1ms"));
    }

    // ── Cache ────────────────────────────────────────────────────────
    if config.cache.max_entries == 0 {
        errors.push(invalid("cache.max_entries", 0, "must be at least 1"));
    }
    if config.cache.default_ttl_ms == 0 {
        errors.push(invalid("cache.default_ttl_ms", 0, "must be at least 1ms"));
    }
    for (i, rule) in config.cache.ttl_rules.iter().enumerate() {
        if rule.pattern.is_empty() {
            errors.push(invalid(
                format!("cache.ttl_rules[{i}].pattern"),
                "\"\"",
                "pattern must not be empty",
            ));
        }
        if rule.ttl_ms == 0 {
            errors.push(invalid(
                format!("cache.ttl_rules[{i}].ttl_ms"),
                0,
                "must be at least 1ms",
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
