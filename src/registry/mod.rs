//! Process-wide registry of named resilience instances.
//!
//! # Data Flow
//! ```text
//! startup (config + catalog)
//!     → register_retry / register_circuit_breaker
//!     → Arc<ResilienceRegistry> handed to callers and the admin API
//!
//! execute(name, args, operation)
//!     → Retry (if registered)
//!         → CircuitBreaker (if registered)
//!             → operation
//!     → fallback
//! ```
//!
//! # Design Decisions
//! - Instances are created once and shared through `Arc`
//! - Lookups of unregistered names follow `UnknownNamePolicy`; the default
//!   rejects them so a typo never silently runs without protection
//! - Map guards are never held across an `.await`

pub mod catalog;

use std::any::Any;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, ResilienceResult};
use crate::events::{Event, EventCategory};
use crate::resilience::circuit_breaker::{
    CircuitBreaker, CircuitBreakerMetrics, CircuitBreakerSpec, CircuitState,
};
use crate::resilience::fallback::recover;
use crate::resilience::retries::{Retry, RetryMetrics, RetrySpec};

pub use catalog::Catalog;

const RETRY: &str = "retry";
const CIRCUIT_BREAKER: &str = "circuit breaker";
const POLICY: &str = "resilience policy";

/// What a lookup of an unregistered name does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownNamePolicy {
    /// Fail with `ConfigurationError::UnknownInstance`.
    #[default]
    Reject,
    /// Create an instance from the default spec on first use.
    UseDefaults,
}

#[derive(Debug, Default)]
pub struct ResilienceRegistry {
    retries: DashMap<String, Arc<Retry>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    unknown_names: UnknownNamePolicy,
    retry_defaults: RetrySpec,
    breaker_defaults: CircuitBreakerSpec,
}

impl ResilienceRegistry {
    pub fn new(unknown_names: UnknownNamePolicy) -> Self {
        Self {
            unknown_names,
            ..Self::default()
        }
    }

    /// Spec used for unregistered names under `UseDefaults`.
    pub fn with_retry_defaults(mut self, spec: RetrySpec) -> Self {
        self.retry_defaults = spec;
        self
    }

    pub fn with_circuit_breaker_defaults(mut self, spec: CircuitBreakerSpec) -> Self {
        self.breaker_defaults = spec;
        self
    }

    pub fn unknown_name_policy(&self) -> UnknownNamePolicy {
        self.unknown_names
    }

    // --- Registration ---

    pub fn register_retry(
        &self,
        spec: RetrySpec,
        allow_override: bool,
    ) -> Result<Arc<Retry>, ConfigurationError> {
        spec.validate()?;
        let name = spec.name.clone();
        let instance = Arc::new(Retry::new(spec));
        insert(&self.retries, RETRY, name, instance, allow_override)
    }

    pub fn register_circuit_breaker(
        &self,
        spec: CircuitBreakerSpec,
        allow_override: bool,
    ) -> Result<Arc<CircuitBreaker>, ConfigurationError> {
        spec.validate()?;
        let name = spec.name.clone();
        let instance = Arc::new(CircuitBreaker::new(spec));
        insert(&self.breakers, CIRCUIT_BREAKER, name, instance, allow_override)
    }

    // --- Lookup ---

    pub fn retry(&self, name: &str) -> Result<Arc<Retry>, ConfigurationError> {
        if let Some(found) = self.find_retry(name) {
            return Ok(found);
        }
        match self.unknown_names {
            UnknownNamePolicy::Reject => Err(unknown_instance(RETRY, name)),
            UnknownNamePolicy::UseDefaults => Ok(self.default_retry(name)),
        }
    }

    pub fn circuit_breaker(&self, name: &str) -> Result<Arc<CircuitBreaker>, ConfigurationError> {
        if let Some(found) = self.find_circuit_breaker(name) {
            return Ok(found);
        }
        match self.unknown_names {
            UnknownNamePolicy::Reject => Err(unknown_instance(CIRCUIT_BREAKER, name)),
            UnknownNamePolicy::UseDefaults => Ok(self.default_circuit_breaker(name)),
        }
    }

    /// Registered instance only; never creates one.
    pub fn find_retry(&self, name: &str) -> Option<Arc<Retry>> {
        self.retries.get(name).map(|entry| entry.value().clone())
    }

    pub fn find_circuit_breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| entry.value().clone())
    }

    fn default_retry(&self, name: &str) -> Arc<Retry> {
        self.retries
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::info!(name = %name, "Creating retry from default spec");
                Arc::new(Retry::new(self.retry_defaults.renamed(name)))
            })
            .value()
            .clone()
    }

    fn default_circuit_breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::info!(name = %name, "Creating circuit breaker from default spec");
                Arc::new(CircuitBreaker::new(self.breaker_defaults.renamed(name)))
            })
            .value()
            .clone()
    }

    /// Sorted names of registered retries.
    pub fn retry_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.retries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn circuit_breaker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    // --- Execution ---

    /// Run `operation` under every instance registered as `name`.
    ///
    /// With both a retry and a breaker, the breaker sits inside the retry,
    /// so each attempt asks for admission and a rejection ends the retry
    /// loop. The retry's fallback is preferred over the breaker's.
    pub async fn execute<A, T, E, F, Fut>(
        &self,
        name: &str,
        args: A,
        mut operation: F,
    ) -> ResilienceResult<T, E>
    where
        A: Any + Send + Sync,
        T: Any + Send + Sync,
        E: StdError + 'static,
        F: FnMut(&A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (retry, breaker) = self.resolve_policy(name)?;

        match (retry, breaker) {
            (Some(retry), Some(breaker)) => {
                let breaker = breaker.as_ref();
                let result = retry
                    .run(|| {
                        // admission happens before the operation is built
                        let admitted = breaker
                            .try_acquire_permission()
                            .map(|permit| (permit, operation(&args)));
                        async move {
                            let (permit, call) = admitted?;
                            breaker.observe(permit, call).await
                        }
                    })
                    .await;
                let fallback = retry
                    .spec()
                    .fallback
                    .as_ref()
                    .or(breaker.spec().fallback.as_ref());
                recover(name, fallback, &args, result)
            }
            (Some(retry), None) => retry.execute(args, operation).await,
            (None, Some(breaker)) => breaker.execute(args, operation).await,
            (None, None) => Err(unknown_instance(POLICY, name).into()),
        }
    }

    fn resolve_policy(
        &self,
        name: &str,
    ) -> Result<(Option<Arc<Retry>>, Option<Arc<CircuitBreaker>>), ConfigurationError> {
        let retry = self.find_retry(name);
        let breaker = self.find_circuit_breaker(name);
        if retry.is_some() || breaker.is_some() {
            return Ok((retry, breaker));
        }
        match self.unknown_names {
            UnknownNamePolicy::Reject => Err(unknown_instance(POLICY, name)),
            UnknownNamePolicy::UseDefaults => Ok((
                Some(self.default_retry(name)),
                Some(self.default_circuit_breaker(name)),
            )),
        }
    }

    // --- Events ---

    /// Subscribe to `category` on every instance registered as `name`.
    pub fn subscribe<F>(
        &self,
        name: &str,
        category: EventCategory,
        handler: F,
    ) -> Result<(), ConfigurationError>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.for_each_bus(name, |bus| {
            let handler = handler.clone();
            bus.subscribe(category, move |event| (*handler)(event));
        })
    }

    pub fn subscribe_all<F>(&self, name: &str, handler: F) -> Result<(), ConfigurationError>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.for_each_bus(name, |bus| {
            let handler = handler.clone();
            bus.subscribe_all(move |event| (*handler)(event));
        })
    }

    fn for_each_bus<F>(&self, name: &str, mut f: F) -> Result<(), ConfigurationError>
    where
        F: FnMut(&crate::events::EventBus),
    {
        let (retry, breaker) = self.resolve_policy(name)?;
        if let Some(retry) = retry {
            f(retry.events());
        }
        if let Some(breaker) = breaker {
            f(breaker.events());
        }
        Ok(())
    }

    // --- Administration ---

    /// Manual breaker transition; `duration` only applies to `Open`.
    pub fn transition_state(
        &self,
        name: &str,
        target: CircuitState,
        duration: Option<Duration>,
    ) -> Result<(), ConfigurationError> {
        let breaker = self
            .find_circuit_breaker(name)
            .ok_or_else(|| unknown_instance(CIRCUIT_BREAKER, name))?;
        match (target, duration) {
            (CircuitState::Open, Some(duration)) => breaker.transition_to_open_for(duration),
            (_, Some(duration)) => Err(ConfigurationError::out_of_range(
                "duration",
                format!("{}ms with target {}", duration.as_millis(), target),
                "a duration only with target OPEN",
            )),
            (_, None) => breaker.transition_to(target),
        }
    }

    pub fn reset_circuit_breaker(&self, name: &str) -> Result<(), ConfigurationError> {
        let breaker = self
            .find_circuit_breaker(name)
            .ok_or_else(|| unknown_instance(CIRCUIT_BREAKER, name))?;
        breaker.reset();
        Ok(())
    }

    pub fn circuit_breaker_metrics(&self) -> Vec<CircuitBreakerMetrics> {
        self.circuit_breaker_names()
            .iter()
            .filter_map(|name| self.find_circuit_breaker(name))
            .map(|cb| cb.metrics())
            .collect()
    }

    pub fn retry_metrics(&self) -> Vec<RetryMetrics> {
        self.retry_names()
            .iter()
            .filter_map(|name| self.find_retry(name))
            .map(|r| r.metrics())
            .collect()
    }
}

fn insert<V>(
    map: &DashMap<String, Arc<V>>,
    kind: &'static str,
    name: String,
    instance: Arc<V>,
    allow_override: bool,
) -> Result<Arc<V>, ConfigurationError> {
    match map.entry(name) {
        Entry::Occupied(mut entry) => {
            if !allow_override {
                return Err(ConfigurationError::DuplicateName {
                    kind,
                    name: entry.key().clone(),
                });
            }
            tracing::warn!(kind, name = %entry.key(), "Overriding registered instance");
            entry.insert(instance.clone());
        }
        Entry::Vacant(entry) => {
            tracing::debug!(kind, name = %entry.key(), "Registered instance");
            entry.insert(instance.clone());
        }
    }
    Ok(instance)
}

fn unknown_instance(kind: &'static str, name: &str) -> ConfigurationError {
    ConfigurationError::UnknownInstance {
        kind,
        name: name.to_string(),
    }
}
