//! Startup orchestration.
//!
//! # Responsibilities
//! - Turn validated configuration into immutable specs
//! - Resolve catalog references by name
//! - Build the registry every caller shares
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Instances register in name order, retries before breakers

use std::sync::Arc;
use std::time::Duration;

use crate::config::schema::{BackoffKind, CircuitBreakerConfig, ResilienceConfig, RetryConfig};
use crate::error::ConfigurationError;
use crate::registry::{Catalog, ResilienceRegistry};
use crate::resilience::backoff::BackoffPolicy;
use crate::resilience::circuit_breaker::CircuitBreakerSpec;
use crate::resilience::classifier::FailureClassifier;
use crate::resilience::retries::RetrySpec;

/// Build the registry described by `config`.
pub fn build_registry(
    config: &ResilienceConfig,
    catalog: &Catalog,
) -> Result<Arc<ResilienceRegistry>, ConfigurationError> {
    let retry_defaults = retry_spec("default", &config.retry.defaults, catalog)?;
    let breaker_defaults =
        circuit_breaker_spec("default", &config.circuit_breaker.defaults, catalog)?;

    let registry = ResilienceRegistry::new(config.registry.unknown_names)
        .with_retry_defaults(retry_defaults)
        .with_circuit_breaker_defaults(breaker_defaults);

    for (name, instance) in &config.retry.instances {
        let merged = instance.merged_over(&config.retry.defaults);
        registry.register_retry(retry_spec(name, &merged, catalog)?, false)?;
    }
    for (name, instance) in &config.circuit_breaker.instances {
        let merged = instance.merged_over(&config.circuit_breaker.defaults);
        registry.register_circuit_breaker(circuit_breaker_spec(name, &merged, catalog)?, false)?;
    }

    tracing::info!(
        retries = config.retry.instances.len(),
        circuit_breakers = config.circuit_breaker.instances.len(),
        unknown_names = ?config.registry.unknown_names,
        "Resilience registry ready"
    );
    Ok(Arc::new(registry))
}

pub fn retry_spec(
    name: &str,
    cfg: &RetryConfig,
    catalog: &Catalog,
) -> Result<RetrySpec, ConfigurationError> {
    let base = RetrySpec::default();
    let mut builder = RetrySpec::builder(name)
        .max_attempts(cfg.max_attempts.unwrap_or(base.max_attempts))
        .backoff(backoff(cfg));

    if let Some(matches) = catalog.resolve_errors(name, &cfg.retry_exceptions)? {
        builder = builder.retry_exceptions(matches);
    }
    if let Some(ignore) = catalog.resolve_errors(name, &cfg.ignore_exceptions)? {
        builder = builder.ignore(ignore);
    }
    if let Some(predicate) = catalog.resolve_result(name, cfg.retry_on_result.as_deref())? {
        builder = builder.retry_on_result(predicate);
    }
    if let Some(fallback) = catalog.resolve_fallback(name, cfg.fallback.as_deref())? {
        builder = builder.fallback(fallback);
    }
    builder.build()
}

fn backoff(cfg: &RetryConfig) -> BackoffPolicy {
    let wait = cfg
        .wait_duration_ms
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(500));
    let multiplier = cfg.multiplier.unwrap_or(2.0);
    let factor = cfg.randomization_factor.unwrap_or(0.5);
    let max = cfg.max_wait_duration_ms.map(Duration::from_millis);

    match cfg.backoff.unwrap_or(BackoffKind::Fixed) {
        BackoffKind::Fixed => BackoffPolicy::fixed(wait),
        BackoffKind::Exponential => BackoffPolicy::Exponential {
            initial: wait,
            multiplier,
            max,
        },
        BackoffKind::Randomized => BackoffPolicy::randomized(wait, factor),
        BackoffKind::ExponentialRandomized => BackoffPolicy::ExponentialRandomized {
            initial: wait,
            multiplier,
            factor,
            max,
        },
    }
}

pub fn circuit_breaker_spec(
    name: &str,
    cfg: &CircuitBreakerConfig,
    catalog: &Catalog,
) -> Result<CircuitBreakerSpec, ConfigurationError> {
    let base = CircuitBreakerSpec::default();
    let ms = Duration::from_millis;

    let mut builder = CircuitBreakerSpec::builder(name)
        .sliding_window(
            cfg.sliding_window_type.unwrap_or(base.sliding_window_type),
            cfg.sliding_window_size.unwrap_or(base.sliding_window_size),
        )
        .minimum_number_of_calls(
            cfg.minimum_number_of_calls
                .unwrap_or(base.minimum_number_of_calls),
        )
        .failure_rate_threshold(
            cfg.failure_rate_threshold
                .unwrap_or(base.failure_rate_threshold),
        )
        .slow_call_duration_threshold(
            cfg.slow_call_duration_threshold_ms
                .map(ms)
                .unwrap_or(base.slow_call_duration_threshold),
        )
        .slow_call_rate_threshold(
            cfg.slow_call_rate_threshold
                .unwrap_or(base.slow_call_rate_threshold),
        )
        .wait_duration_in_open_state(
            cfg.wait_duration_in_open_state_ms
                .map(ms)
                .unwrap_or(base.wait_duration_in_open_state),
        )
        .permitted_number_of_calls_in_half_open_state(
            cfg.permitted_number_of_calls_in_half_open_state
                .unwrap_or(base.permitted_number_of_calls_in_half_open_state),
        )
        .automatic_transition_from_open_to_half_open_enabled(
            cfg.automatic_transition_from_open_to_half_open_enabled
                .unwrap_or(base.automatic_transition_from_open_to_half_open_enabled),
        );

    if let Some(max) = cfg.max_wait_duration_in_half_open_state_ms {
        builder = builder.max_wait_duration_in_half_open_state(ms(max));
    }
    if let Some(matches) = catalog.resolve_errors(name, &cfg.record_exceptions)? {
        builder = builder.record_failure(FailureClassifier::new(matches));
    }
    if let Some(ignore) = catalog.resolve_errors(name, &cfg.ignore_exceptions)? {
        builder = builder.ignore(ignore);
    }
    if let Some(predicate) = catalog.resolve_result(name, cfg.record_result.as_deref())? {
        builder = builder.record_result(predicate);
    }
    if let Some(fallback) = catalog.resolve_fallback(name, cfg.fallback.as_deref())? {
        builder = builder.fallback(fallback);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::parse_config;
    use crate::resilience::classifier::ErrorMatcher;
    use crate::resilience::window::SlidingWindowType;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("movie not found")]
    struct NotFound;

    const CONFIG: &str = r#"
[retry.defaults]
max_attempts = 3
wait_duration_ms = 100

[retry.instances.retryUsingExponentialBackoff]
backoff = "exponential"
multiplier = 2.0

[retry.instances.customRetryConfig]
ignore_exceptions = ["not_found"]

[circuit_breaker.instances.customCircuitBreaker]
sliding_window_type = "count_based"
sliding_window_size = 5
minimum_number_of_calls = 5
failure_rate_threshold = 50.0
wait_duration_in_open_state_ms = 5000
permitted_number_of_calls_in_half_open_state = 3
"#;

    #[test]
    fn test_build_registry_from_config() {
        let config = parse_config(CONFIG).unwrap();
        let catalog = Catalog::new().with_error("not_found", ErrorMatcher::of::<NotFound>());
        let registry = build_registry(&config, &catalog).unwrap();

        let exp = registry.retry("retryUsingExponentialBackoff").unwrap();
        assert_eq!(exp.spec().max_attempts, 3);
        assert_eq!(exp.spec().backoff.delay(3), Duration::from_millis(400));

        let custom = registry.retry("customRetryConfig").unwrap();
        assert!(custom.spec().ignore.test(&NotFound));

        let cb = registry.circuit_breaker("customCircuitBreaker").unwrap();
        assert_eq!(cb.spec().sliding_window_type, SlidingWindowType::CountBased);
        assert_eq!(cb.spec().permitted_number_of_calls_in_half_open_state, 3);
        assert_eq!(cb.spec().wait_duration_in_open_state, Duration::from_secs(5));
    }

    #[test]
    fn test_unknown_catalog_entry_fails_startup() {
        let config = parse_config(CONFIG).unwrap();
        let err = build_registry(&config, &Catalog::new()).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::UnknownCatalogEntry { ref name, .. } if name == "not_found"
        ));
    }
}
