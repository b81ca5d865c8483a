//! Retry execution.
//!
//! # Responsibilities
//! - Run an operation up to `max_attempts` times (initial try plus retries)
//! - Classify each failure as retryable, non-retryable or ignored
//! - Wait between attempts according to the backoff policy
//! - Publish attempt, retry, success, error and ignored-error events
//!
//! # Design Decisions
//! - The loop works on `ResilienceResult`, so a breaker can sit inside it;
//!   anything other than an operation error (rejection, configuration) ends
//!   the loop without a retry
//! - Waits use `tokio::time::sleep` and suspend only the calling task
//! - A successful value matching `retry_on_result` is retried like a
//!   transient failure; when attempts run out the last value is returned

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::{ConfigurationError, ResilienceError, ResilienceResult};
use crate::events::{Event, EventBus, EventCategory, EventKind, InstanceKind};
use crate::observability::metrics;
use crate::resilience::backoff::BackoffPolicy;
use crate::resilience::classifier::{
    classify_for_retry, Classification, ErrorMatcher, FailureClassifier, ResultPredicate,
};
use crate::resilience::fallback::{recover, Fallback};

/// Immutable retry configuration.
#[derive(Debug, Clone)]
pub struct RetrySpec {
    pub name: String,
    /// Initial try plus retries.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub retry_on: FailureClassifier,
    pub ignore: ErrorMatcher,
    pub retry_on_result: Option<ResultPredicate>,
    pub fallback: Option<Fallback>,
}

impl RetrySpec {
    pub fn builder(name: impl Into<String>) -> RetrySpecBuilder {
        RetrySpecBuilder {
            spec: RetrySpec {
                name: name.into(),
                ..RetrySpec::default()
            },
        }
    }

    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_attempts < 1 {
            return Err(ConfigurationError::out_of_range(
                "max_attempts",
                self.max_attempts,
                ">= 1",
            ));
        }
        self.backoff.validate()
    }
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            retry_on: FailureClassifier::default(),
            ignore: ErrorMatcher::Nothing,
            retry_on_result: None,
            fallback: None,
        }
    }
}

/// Builder for [`RetrySpec`].
#[derive(Debug, Clone)]
pub struct RetrySpecBuilder {
    spec: RetrySpec,
}

impl RetrySpecBuilder {
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.spec.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.spec.backoff = backoff;
        self
    }

    /// Shorthand for a fixed backoff.
    pub fn wait_duration(self, wait: Duration) -> Self {
        self.backoff(BackoffPolicy::fixed(wait))
    }

    pub fn retry_on(mut self, classifier: FailureClassifier) -> Self {
        self.spec.retry_on = classifier;
        self
    }

    /// Retry only errors matching `matcher`, keeping any `unless` clause.
    pub fn retry_exceptions(mut self, matcher: ErrorMatcher) -> Self {
        self.spec.retry_on.matches = matcher;
        self
    }

    pub fn ignore(mut self, matcher: ErrorMatcher) -> Self {
        self.spec.ignore = matcher;
        self
    }

    pub fn retry_on_result(mut self, predicate: ResultPredicate) -> Self {
        self.spec.retry_on_result = Some(predicate);
        self
    }

    pub fn fallback(mut self, fallback: Fallback) -> Self {
        self.spec.fallback = Some(fallback);
        self
    }

    pub fn build(self) -> Result<RetrySpec, ConfigurationError> {
        self.spec.validate()?;
        Ok(self.spec)
    }
}

/// Call counters, as served by the admin API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryMetrics {
    pub name: String,
    pub max_attempts: u32,
    pub successful_calls_without_retry: u64,
    pub successful_calls_with_retry: u64,
    pub failed_calls_without_retry: u64,
    pub failed_calls_with_retry: u64,
}

#[derive(Debug, Default)]
struct Counters {
    success_without_retry: AtomicU64,
    success_with_retry: AtomicU64,
    failed_without_retry: AtomicU64,
    failed_with_retry: AtomicU64,
}

/// A named retry instance, shared by all callers of that name.
pub struct Retry {
    spec: RetrySpec,
    events: EventBus,
    counters: Counters,
}

impl Retry {
    pub fn new(spec: RetrySpec) -> Self {
        let events = EventBus::new(spec.name.clone(), InstanceKind::Retry);
        Self {
            spec,
            events,
            counters: Counters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &RetrySpec {
        &self.spec
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe<F>(&self, category: EventCategory, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.subscribe(category, handler);
    }

    pub fn metrics(&self) -> RetryMetrics {
        RetryMetrics {
            name: self.spec.name.clone(),
            max_attempts: self.spec.max_attempts,
            successful_calls_without_retry: self.counters.success_without_retry.load(Ordering::Relaxed),
            successful_calls_with_retry: self.counters.success_with_retry.load(Ordering::Relaxed),
            failed_calls_without_retry: self.counters.failed_without_retry.load(Ordering::Relaxed),
            failed_calls_with_retry: self.counters.failed_with_retry.load(Ordering::Relaxed),
        }
    }

    /// Run `operation` with retries, then apply the configured fallback if
    /// the call still failed.
    ///
    /// `operation` receives the arguments on every attempt; the fallback
    /// receives them once, with the last error.
    pub async fn execute<A, T, E, F, Fut>(&self, args: A, mut operation: F) -> ResilienceResult<T, E>
    where
        A: Any + Send + Sync,
        T: Any + Send + Sync,
        E: StdError + 'static,
        F: FnMut(&A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let result = self
            .run(|| {
                let call = operation(&args);
                async move { call.await.map_err(ResilienceError::Operation) }
            })
            .await;
        recover(&self.spec.name, self.spec.fallback.as_ref(), &args, result)
    }

    /// The retry loop without a fallback.
    pub(crate) async fn run<T, E, F, Fut>(&self, mut attempt: F) -> ResilienceResult<T, E>
    where
        T: Any + Send + Sync,
        E: StdError + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = ResilienceResult<T, E>>,
    {
        let started = Instant::now();
        let max_attempts = self.spec.max_attempts.max(1);
        let mut number = 0u32;

        loop {
            number += 1;
            self.events.publish(EventKind::Attempt { attempt: number });

            match attempt().await {
                Ok(value) => {
                    let unwanted = self
                        .spec
                        .retry_on_result
                        .as_ref()
                        .is_some_and(|p| p.test(&value));
                    if !unwanted {
                        self.succeeded(number, started);
                        return Ok(value);
                    }
                    if number >= max_attempts {
                        self.failed(number, started, "result matched retry predicate".to_string());
                        return Ok(value);
                    }
                    self.wait(number, "result matched retry predicate".to_string())
                        .await;
                }
                Err(ResilienceError::Operation(err)) => {
                    match classify_for_retry(&self.spec.retry_on, &self.spec.ignore, &err) {
                        Classification::Ignored => {
                            tracing::debug!(
                                name = %self.spec.name,
                                attempt = number,
                                error = %err,
                                "Ignored error, not retrying"
                            );
                            self.events.publish(EventKind::IgnoredError {
                                error: err.to_string(),
                            });
                            return Err(ResilienceError::Operation(err));
                        }
                        Classification::NonRetryable => {
                            self.failed(number, started, err.to_string());
                            return Err(ResilienceError::Operation(err));
                        }
                        Classification::Retryable if number >= max_attempts => {
                            self.failed(number, started, err.to_string());
                            return Err(ResilienceError::Exhausted {
                                name: self.spec.name.clone(),
                                attempts: number,
                                source: err,
                            });
                        }
                        Classification::Retryable => {
                            self.wait(number, err.to_string()).await;
                        }
                    }
                }
                Err(other) => {
                    self.failed(number, started, other.to_string());
                    return Err(other);
                }
            }
        }
    }

    async fn wait(&self, attempt: u32, error: String) {
        let wait = self.spec.backoff.delay(attempt);
        tracing::debug!(
            name = %self.spec.name,
            attempt,
            wait_ms = wait.as_millis() as u64,
            error = %error,
            "Retrying after failure"
        );
        metrics::record_retry(&self.spec.name);
        self.events.publish(EventKind::Retry {
            attempt,
            wait,
            error,
        });
        tokio::time::sleep(wait).await;
    }

    fn succeeded(&self, attempts: u32, started: Instant) {
        let counter = if attempts == 1 {
            &self.counters.success_without_retry
        } else {
            &self.counters.success_with_retry
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::record_call("retry", &self.spec.name, "successful");
        self.events.publish(EventKind::Success {
            attempts,
            elapsed: Some(started.elapsed()),
        });
    }

    fn failed(&self, attempts: u32, started: Instant, error: String) {
        let counter = if attempts == 1 {
            &self.counters.failed_without_retry
        } else {
            &self.counters.failed_with_retry
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::record_call("retry", &self.spec.name, "failed");
        tracing::debug!(
            name = %self.spec.name,
            attempts,
            error = %error,
            "Call failed"
        );
        self.events.publish(EventKind::Error {
            attempts,
            elapsed: Some(started.elapsed()),
            error,
        });
    }
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("name", &self.spec.name)
            .field("max_attempts", &self.spec.max_attempts)
            .field("backoff", &self.spec.backoff)
            .finish()
    }
}
