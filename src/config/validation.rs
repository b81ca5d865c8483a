//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds, attempts, window sizes)
//! - Check addresses and credentials of enabled surfaces
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ResilienceConfig → Result<(), Vec<ValidationError>>
//! - Instances are checked after merging over their defaults, so an error
//!   names the field the instance actually runs with
//! - Catalog references are resolved later, at registry build time

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{CircuitBreakerConfig, ResilienceConfig, RetryConfig};

/// A single invalid field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path, e.g. `retry.instances.simpleRetry.max_attempts`.
    pub field: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

struct Errors(Vec<ValidationError>);

impl Errors {
    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

pub fn validate_config(config: &ResilienceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Errors(Vec::new());

    let level = config.observability.log_level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        errors.push(
            "observability.log_level",
            format!("'{}' is not one of {:?}", config.observability.log_level, LOG_LEVELS),
        );
    }
    if config.observability.metrics_enabled {
        check_address(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    if config.admin.enabled {
        if config.admin.api_key.trim().is_empty() {
            errors.push("admin.api_key", "must be set when the admin API is enabled");
        }
        check_address(&mut errors, "admin.bind_address", &config.admin.bind_address);
    }

    let retry_defaults = &config.retry.defaults;
    check_retry(&mut errors, "retry.defaults", retry_defaults);
    for (name, instance) in &config.retry.instances {
        let merged = instance.merged_over(retry_defaults);
        check_retry(&mut errors, &format!("retry.instances.{}", name), &merged);
    }

    let breaker_defaults = &config.circuit_breaker.defaults;
    check_breaker(&mut errors, "circuit_breaker.defaults", breaker_defaults);
    for (name, instance) in &config.circuit_breaker.instances {
        let merged = instance.merged_over(breaker_defaults);
        check_breaker(
            &mut errors,
            &format!("circuit_breaker.instances.{}", name),
            &merged,
        );
    }

    if errors.0.is_empty() {
        Ok(())
    } else {
        Err(errors.0)
    }
}

fn check_address(errors: &mut Errors, field: &str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(field, format!("'{}' is not a socket address", value));
    }
}

fn check_retry(errors: &mut Errors, prefix: &str, retry: &RetryConfig) {
    if retry.max_attempts == Some(0) {
        errors.push(format!("{}.max_attempts", prefix), "must be >= 1");
    }
    if let Some(multiplier) = retry.multiplier {
        if !(multiplier.is_finite() && multiplier >= 1.0) {
            errors.push(format!("{}.multiplier", prefix), "must be >= 1.0");
        }
    }
    if let Some(factor) = retry.randomization_factor {
        if !(0.0..1.0).contains(&factor) {
            errors.push(
                format!("{}.randomization_factor", prefix),
                "must be in [0.0, 1.0)",
            );
        }
    }
    if let (Some(wait), Some(max)) = (retry.wait_duration_ms, retry.max_wait_duration_ms) {
        if max < wait {
            errors.push(
                format!("{}.max_wait_duration_ms", prefix),
                "must not be below wait_duration_ms",
            );
        }
    }
}

fn check_breaker(errors: &mut Errors, prefix: &str, cb: &CircuitBreakerConfig) {
    for (field, value) in [
        ("failure_rate_threshold", cb.failure_rate_threshold),
        ("slow_call_rate_threshold", cb.slow_call_rate_threshold),
    ] {
        if let Some(v) = value {
            if !(v > 0.0 && v <= 100.0) {
                errors.push(format!("{}.{}", prefix, field), "must be in (0, 100]");
            }
        }
    }
    for (field, value) in [
        ("sliding_window_size", cb.sliding_window_size),
        ("minimum_number_of_calls", cb.minimum_number_of_calls),
        (
            "permitted_number_of_calls_in_half_open_state",
            cb.permitted_number_of_calls_in_half_open_state,
        ),
    ] {
        if value == Some(0) {
            errors.push(format!("{}.{}", prefix, field), "must be >= 1");
        }
    }
    for (field, value) in [
        ("wait_duration_in_open_state_ms", cb.wait_duration_in_open_state_ms),
        (
            "max_wait_duration_in_half_open_state_ms",
            cb.max_wait_duration_in_half_open_state_ms,
        ),
    ] {
        if value == Some(0) {
            errors.push(format!("{}.{}", prefix, field), "must be > 0");
        }
    }
}
