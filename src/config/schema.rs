//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the engine.
//! All types derive Serde traits for deserialization from config files.
//!
//! Retry and circuit-breaker instances are overlays: a field left out of
//! `[retry.instances.<name>]` is taken from `[retry.defaults]`, and a field
//! left out of both falls back to the built-in spec default.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::observability::logging::LogFormat;
use crate::registry::UnknownNamePolicy;
use crate::resilience::window::SlidingWindowType;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,

    /// Admin API settings.
    pub admin: AdminConfig,

    /// Registry behaviour.
    pub registry: RegistryConfig,

    /// Retry defaults and named instances.
    pub retry: RetrySection,

    /// Circuit-breaker defaults and named instances.
    pub circuit_breaker: CircuitBreakerSection,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Serve the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            bind_address: "127.0.0.1:9091".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RegistryConfig {
    /// What a lookup of an unregistered name does.
    pub unknown_names: UnknownNamePolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RetrySection {
    pub defaults: RetryConfig,
    pub instances: BTreeMap<String, RetryConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub defaults: CircuitBreakerConfig,
    pub instances: BTreeMap<String, CircuitBreakerConfig>,
}

/// Backoff variants as named in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
    Randomized,
    ExponentialRandomized,
}

/// One retry instance (or the defaults).
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RetryConfig {
    /// Initial try plus retries.
    pub max_attempts: Option<u32>,

    pub backoff: Option<BackoffKind>,

    /// Fixed wait, or the initial wait for exponential backoff.
    pub wait_duration_ms: Option<u64>,

    /// Growth per attempt for exponential backoff.
    pub multiplier: Option<f64>,

    /// Cap for exponential backoff.
    pub max_wait_duration_ms: Option<u64>,

    /// Jitter for randomized backoff, in [0, 1).
    pub randomization_factor: Option<f64>,

    /// Catalog error names to retry; empty means every error.
    pub retry_exceptions: Vec<String>,

    /// Catalog error names that are never retried nor counted.
    pub ignore_exceptions: Vec<String>,

    /// Catalog result predicate; matching values are retried.
    pub retry_on_result: Option<String>,

    /// Catalog fallback name.
    pub fallback: Option<String>,
}

impl RetryConfig {
    /// Fill unset fields from `base`.
    pub fn merged_over(&self, base: &RetryConfig) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.or(base.max_attempts),
            backoff: self.backoff.or(base.backoff),
            wait_duration_ms: self.wait_duration_ms.or(base.wait_duration_ms),
            multiplier: self.multiplier.or(base.multiplier),
            max_wait_duration_ms: self.max_wait_duration_ms.or(base.max_wait_duration_ms),
            randomization_factor: self.randomization_factor.or(base.randomization_factor),
            retry_exceptions: inherit(&self.retry_exceptions, &base.retry_exceptions),
            ignore_exceptions: inherit(&self.ignore_exceptions, &base.ignore_exceptions),
            retry_on_result: self.retry_on_result.clone().or(base.retry_on_result.clone()),
            fallback: self.fallback.clone().or(base.fallback.clone()),
        }
    }
}

/// One circuit-breaker instance (or the defaults).
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub sliding_window_type: Option<SlidingWindowType>,

    /// Calls for a count window, seconds for a time window.
    pub sliding_window_size: Option<u32>,

    pub minimum_number_of_calls: Option<u32>,

    /// Percentage in (0, 100].
    pub failure_rate_threshold: Option<f32>,

    pub slow_call_duration_threshold_ms: Option<u64>,

    /// Percentage in (0, 100].
    pub slow_call_rate_threshold: Option<f32>,

    pub wait_duration_in_open_state_ms: Option<u64>,

    pub permitted_number_of_calls_in_half_open_state: Option<u32>,

    pub automatic_transition_from_open_to_half_open_enabled: Option<bool>,

    pub max_wait_duration_in_half_open_state_ms: Option<u64>,

    /// Catalog error names recorded as failures; empty means every error.
    pub record_exceptions: Vec<String>,

    /// Catalog error names that are neither failures nor successes.
    pub ignore_exceptions: Vec<String>,

    /// Catalog result predicate; matching values count as failures.
    pub record_result: Option<String>,

    /// Catalog fallback name.
    pub fallback: Option<String>,
}

impl CircuitBreakerConfig {
    /// Fill unset fields from `base`.
    pub fn merged_over(&self, base: &CircuitBreakerConfig) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            sliding_window_type: self.sliding_window_type.or(base.sliding_window_type),
            sliding_window_size: self.sliding_window_size.or(base.sliding_window_size),
            minimum_number_of_calls: self
                .minimum_number_of_calls
                .or(base.minimum_number_of_calls),
            failure_rate_threshold: self.failure_rate_threshold.or(base.failure_rate_threshold),
            slow_call_duration_threshold_ms: self
                .slow_call_duration_threshold_ms
                .or(base.slow_call_duration_threshold_ms),
            slow_call_rate_threshold: self
                .slow_call_rate_threshold
                .or(base.slow_call_rate_threshold),
            wait_duration_in_open_state_ms: self
                .wait_duration_in_open_state_ms
                .or(base.wait_duration_in_open_state_ms),
            permitted_number_of_calls_in_half_open_state: self
                .permitted_number_of_calls_in_half_open_state
                .or(base.permitted_number_of_calls_in_half_open_state),
            automatic_transition_from_open_to_half_open_enabled: self
                .automatic_transition_from_open_to_half_open_enabled
                .or(base.automatic_transition_from_open_to_half_open_enabled),
            max_wait_duration_in_half_open_state_ms: self
                .max_wait_duration_in_half_open_state_ms
                .or(base.max_wait_duration_in_half_open_state_ms),
            record_exceptions: inherit(&self.record_exceptions, &base.record_exceptions),
            ignore_exceptions: inherit(&self.ignore_exceptions, &base.ignore_exceptions),
            record_result: self.record_result.clone().or(base.record_result.clone()),
            fallback: self.fallback.clone().or(base.fallback.clone()),
        }
    }
}

fn inherit(own: &[String], base: &[String]) -> Vec<String> {
    if own.is_empty() {
        base.to_vec()
    } else {
        own.to_vec()
    }
}
