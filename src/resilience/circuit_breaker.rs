//! Circuit breaker state machine.
//!
//! # States
//! - Closed: calls pass through, outcomes are recorded
//! - Open: calls fail fast with `CallNotPermitted`
//! - Half-Open: a limited number of trial calls decide whether to close
//! - Disabled: calls pass through, nothing is recorded
//! - Forced-Open: calls always fail fast, timers are ignored
//! - Metrics-Only: calls pass through and are recorded, no transitions
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure rate or slow-call rate >= threshold
//!                (evaluated once minimum_number_of_calls are buffered)
//! Open → Half-Open: wait_duration_in_open_state elapsed
//!                   (automatic transition enabled, or explicit open duration)
//! Half-Open → Closed: all trial outcomes recorded, both rates below threshold
//! Half-Open → Open: all trial outcomes recorded, either rate >= threshold,
//!                   or max_wait_duration_in_half_open_state elapsed
//! any → any: administrative API only
//! ```
//!
//! # Design Decisions
//! - One mutex per breaker guards state, window and timers; it is never held
//!   across an `.await` or while subscribers run
//! - Timed transitions are applied lazily, on the next admission or state
//!   read, so no background task is needed per breaker
//! - Every transition bumps a generation; outcomes of calls admitted under an
//!   older generation are discarded
//! - Half-open trial slots are an atomic counter; a permit dropped without an
//!   outcome gives its slot back

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::error::{CallNotPermitted, ConfigurationError, ResilienceError, ResilienceResult};
use crate::events::{EventBus, EventCategory, EventKind, InstanceKind};
use crate::observability::metrics;
use crate::resilience::classifier::{ErrorMatcher, FailureClassifier, ResultPredicate};
use crate::resilience::fallback::{recover, Fallback};
use crate::resilience::window::{Measurement, SlidingWindow, SlidingWindowType, Snapshot};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
    Disabled,
    ForcedOpen,
    MetricsOnly,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
            CircuitState::Disabled => "DISABLED",
            CircuitState::ForcedOpen => "FORCED_OPEN",
            CircuitState::MetricsOnly => "METRICS_ONLY",
        }
    }

    /// Whether calls are admitted without consulting the trial counter.
    fn always_permits(&self) -> bool {
        matches!(
            self,
            CircuitState::Closed | CircuitState::Disabled | CircuitState::MetricsOnly
        )
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown circuit state '{0}'")]
pub struct ParseStateError(pub String);

impl FromStr for CircuitState {
    type Err = ParseStateError;

    /// Accepts `HALF_OPEN`, `half_open` and `half-open`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "closed" => Ok(CircuitState::Closed),
            "open" => Ok(CircuitState::Open),
            "half_open" => Ok(CircuitState::HalfOpen),
            "disabled" => Ok(CircuitState::Disabled),
            "forced_open" => Ok(CircuitState::ForcedOpen),
            "metrics_only" => Ok(CircuitState::MetricsOnly),
            _ => Err(ParseStateError(s.to_string())),
        }
    }
}

/// Immutable breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerSpec {
    pub name: String,
    pub sliding_window_type: SlidingWindowType,
    /// Calls for a count window, seconds for a time window.
    pub sliding_window_size: u32,
    pub minimum_number_of_calls: u32,
    /// Percentage in (0, 100].
    pub failure_rate_threshold: f32,
    pub slow_call_duration_threshold: Duration,
    /// Percentage in (0, 100].
    pub slow_call_rate_threshold: f32,
    pub wait_duration_in_open_state: Duration,
    pub permitted_number_of_calls_in_half_open_state: u32,
    pub automatic_transition_from_open_to_half_open_enabled: bool,
    pub max_wait_duration_in_half_open_state: Option<Duration>,
    pub record_failure: FailureClassifier,
    pub ignore: ErrorMatcher,
    pub record_result: Option<ResultPredicate>,
    pub fallback: Option<Fallback>,
}

impl CircuitBreakerSpec {
    pub fn builder(name: impl Into<String>) -> CircuitBreakerSpecBuilder {
        CircuitBreakerSpecBuilder {
            spec: CircuitBreakerSpec {
                name: name.into(),
                ..CircuitBreakerSpec::default()
            },
        }
    }

    /// Same settings under another name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Minimum buffered calls before rates are evaluated in Closed.
    pub fn effective_minimum_calls(&self) -> u32 {
        match self.sliding_window_type {
            SlidingWindowType::CountBased => self
                .minimum_number_of_calls
                .min(self.sliding_window_size),
            SlidingWindowType::TimeBased => self.minimum_number_of_calls,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        check_percentage("failure_rate_threshold", self.failure_rate_threshold)?;
        check_percentage("slow_call_rate_threshold", self.slow_call_rate_threshold)?;
        check_positive("sliding_window_size", self.sliding_window_size)?;
        check_positive("minimum_number_of_calls", self.minimum_number_of_calls)?;
        check_positive(
            "permitted_number_of_calls_in_half_open_state",
            self.permitted_number_of_calls_in_half_open_state,
        )?;
        if self.wait_duration_in_open_state.is_zero() {
            return Err(ConfigurationError::out_of_range(
                "wait_duration_in_open_state",
                "0ms",
                "> 0ms",
            ));
        }
        if self.max_wait_duration_in_half_open_state == Some(Duration::ZERO) {
            return Err(ConfigurationError::out_of_range(
                "max_wait_duration_in_half_open_state",
                "0ms",
                "> 0ms",
            ));
        }
        Ok(())
    }

    /// Which threshold, if any, the snapshot reaches.
    fn exceeded(&self, snapshot: &Snapshot) -> Option<&'static str> {
        if snapshot.failure_rate() >= self.failure_rate_threshold {
            Some("failure_rate")
        } else if snapshot.slow_call_rate() >= self.slow_call_rate_threshold {
            Some("slow_call_rate")
        } else {
            None
        }
    }
}

impl Default for CircuitBreakerSpec {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: 100,
            minimum_number_of_calls: 100,
            failure_rate_threshold: 50.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            slow_call_rate_threshold: 100.0,
            wait_duration_in_open_state: Duration::from_secs(60),
            permitted_number_of_calls_in_half_open_state: 10,
            automatic_transition_from_open_to_half_open_enabled: true,
            max_wait_duration_in_half_open_state: None,
            record_failure: FailureClassifier::default(),
            ignore: ErrorMatcher::Nothing,
            record_result: None,
            fallback: None,
        }
    }
}

fn check_percentage(field: &'static str, value: f32) -> Result<(), ConfigurationError> {
    if value > 0.0 && value <= 100.0 {
        Ok(())
    } else {
        Err(ConfigurationError::out_of_range(field, value, "0 < value <= 100"))
    }
}

fn check_positive(field: &'static str, value: u32) -> Result<(), ConfigurationError> {
    if value >= 1 {
        Ok(())
    } else {
        Err(ConfigurationError::out_of_range(field, value, ">= 1"))
    }
}

/// Builder for [`CircuitBreakerSpec`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerSpecBuilder {
    spec: CircuitBreakerSpec,
}

impl CircuitBreakerSpecBuilder {
    pub fn sliding_window(mut self, kind: SlidingWindowType, size: u32) -> Self {
        self.spec.sliding_window_type = kind;
        self.spec.sliding_window_size = size;
        self
    }

    pub fn minimum_number_of_calls(mut self, calls: u32) -> Self {
        self.spec.minimum_number_of_calls = calls;
        self
    }

    pub fn failure_rate_threshold(mut self, percent: f32) -> Self {
        self.spec.failure_rate_threshold = percent;
        self
    }

    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.spec.slow_call_duration_threshold = threshold;
        self
    }

    pub fn slow_call_rate_threshold(mut self, percent: f32) -> Self {
        self.spec.slow_call_rate_threshold = percent;
        self
    }

    pub fn wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.spec.wait_duration_in_open_state = wait;
        self
    }

    pub fn permitted_number_of_calls_in_half_open_state(mut self, calls: u32) -> Self {
        self.spec.permitted_number_of_calls_in_half_open_state = calls;
        self
    }

    pub fn automatic_transition_from_open_to_half_open_enabled(mut self, enabled: bool) -> Self {
        self.spec.automatic_transition_from_open_to_half_open_enabled = enabled;
        self
    }

    pub fn max_wait_duration_in_half_open_state(mut self, wait: Duration) -> Self {
        self.spec.max_wait_duration_in_half_open_state = Some(wait);
        self
    }

    pub fn record_failure(mut self, classifier: FailureClassifier) -> Self {
        self.spec.record_failure = classifier;
        self
    }

    pub fn ignore(mut self, matcher: ErrorMatcher) -> Self {
        self.spec.ignore = matcher;
        self
    }

    pub fn record_result(mut self, predicate: ResultPredicate) -> Self {
        self.spec.record_result = Some(predicate);
        self
    }

    pub fn fallback(mut self, fallback: Fallback) -> Self {
        self.spec.fallback = Some(fallback);
        self
    }

    pub fn build(self) -> Result<CircuitBreakerSpec, ConfigurationError> {
        self.spec.validate()?;
        Ok(self.spec)
    }
}

/// Point-in-time view of a breaker, as served by the admin API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    /// `None` until enough calls are buffered to evaluate.
    pub failure_rate: Option<f32>,
    pub slow_call_rate: Option<f32>,
    pub buffered_calls: u32,
    pub failed_calls: u32,
    pub slow_calls: u32,
    pub not_permitted_calls: u64,
    /// Trial slots taken in the current half-open phase, settled or not.
    pub half_open_trials_admitted: u32,
}

struct Inner {
    state: CircuitState,
    window: SlidingWindow,
    transitioned_at: Instant,
    /// When an open breaker may move to half-open; `None` means never.
    open_until: Option<Instant>,
    generation: u64,
}

/// A named breaker instance, shared by all callers of that name.
pub struct CircuitBreaker {
    spec: CircuitBreakerSpec,
    inner: Mutex<Inner>,
    trial_permits: AtomicU32,
    not_permitted: AtomicU64,
    events: EventBus,
}

impl CircuitBreaker {
    pub fn new(spec: CircuitBreakerSpec) -> Self {
        let window = SlidingWindow::new(spec.sliding_window_type, spec.sliding_window_size);
        let events = EventBus::new(spec.name.clone(), InstanceKind::CircuitBreaker);
        metrics::record_state(&spec.name, CircuitState::Closed);
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window,
                transitioned_at: Instant::now(),
                open_until: None,
                generation: 0,
            }),
            trial_permits: AtomicU32::new(0),
            not_permitted: AtomicU64::new(0),
            events,
            spec,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &CircuitBreakerSpec {
        &self.spec
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe<F>(&self, category: EventCategory, handler: F)
    where
        F: Fn(&crate::events::Event) + Send + Sync + 'static,
    {
        self.events.subscribe(category, handler);
    }

    /// Current state, applying any timed transition that is due.
    pub fn state(&self) -> CircuitState {
        let mut pending = Vec::new();
        let state = {
            let mut inner = self.inner.lock();
            self.apply_timers(&mut inner, Instant::now(), &mut pending);
            inner.state
        };
        self.publish_all(pending);
        state
    }

    pub fn not_permitted_calls(&self) -> u64 {
        self.not_permitted.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut pending = Vec::new();
        let (state, snapshot) = {
            let mut inner = self.inner.lock();
            self.apply_timers(&mut inner, Instant::now(), &mut pending);
            (inner.state, inner.window.snapshot())
        };
        self.publish_all(pending);

        let threshold = match state {
            CircuitState::HalfOpen => self.spec.permitted_number_of_calls_in_half_open_state,
            _ => self.spec.effective_minimum_calls(),
        };
        let evaluated = snapshot.total_calls >= threshold;
        CircuitBreakerMetrics {
            name: self.spec.name.clone(),
            state,
            failure_rate: evaluated.then(|| snapshot.failure_rate()),
            slow_call_rate: evaluated.then(|| snapshot.slow_call_rate()),
            buffered_calls: snapshot.total_calls,
            failed_calls: snapshot.failed_calls,
            slow_calls: snapshot.slow_calls,
            not_permitted_calls: self.not_permitted_calls(),
            half_open_trials_admitted: self.trial_permits.load(Ordering::Relaxed),
        }
    }

    /// Run `operation` if the breaker admits it, record its outcome, and
    /// apply the configured fallback on failure or rejection.
    pub async fn execute<A, T, E, F, Fut>(&self, args: A, operation: F) -> ResilienceResult<T, E>
    where
        A: Any + Send + Sync,
        T: Any + Send + Sync,
        E: StdError + 'static,
        F: FnOnce(&A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let result = self.protect(|| operation(&args)).await;
        recover(&self.spec.name, self.spec.fallback.as_ref(), &args, result)
    }

    /// Admission and recording around `call`, without a fallback.
    ///
    /// `call` is not invoked unless the breaker admits it.
    pub(crate) async fn protect<T, E, C, Fut>(&self, call: C) -> ResilienceResult<T, E>
    where
        T: Any + Send + Sync,
        E: StdError + 'static,
        C: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire_permission()?;
        self.observe(permit, call()).await
    }

    /// Await an admitted call and report its outcome through `permit`.
    pub(crate) async fn observe<T, E, Fut>(
        &self,
        permit: CallPermit<'_>,
        call: Fut,
    ) -> ResilienceResult<T, E>
    where
        T: Any + Send + Sync,
        E: StdError + 'static,
        Fut: Future<Output = Result<T, E>>,
    {
        match call.await {
            Ok(value) => {
                let failed = self
                    .spec
                    .record_result
                    .as_ref()
                    .is_some_and(|p| p.test(&value));
                if failed {
                    permit.on_failure("result recorded as failure".to_string());
                } else {
                    permit.on_success();
                }
                Ok(value)
            }
            Err(err) => {
                if self.spec.ignore.test(&err) {
                    permit.on_ignored(err.to_string());
                } else if self.spec.record_failure.test(&err) {
                    permit.on_failure(err.to_string());
                } else {
                    permit.on_success();
                }
                Err(ResilienceError::Operation(err))
            }
        }
    }

    /// Ask for admission. Rejections are counted and published.
    pub fn try_acquire_permission(&self) -> Result<CallPermit<'_>, CallNotPermitted> {
        let mut pending = Vec::new();
        let admitted = {
            let mut inner = self.inner.lock();
            self.apply_timers(&mut inner, Instant::now(), &mut pending);
            let state = inner.state;
            let trial = state == CircuitState::HalfOpen;
            let permitted = state.always_permits() || (trial && self.try_take_trial_slot());
            if permitted {
                Ok((inner.generation, state, trial))
            } else {
                Err(state)
            }
        };

        match admitted {
            Ok((generation, state, trial)) => {
                self.publish_all(pending);
                Ok(CallPermit {
                    breaker: self,
                    generation,
                    state,
                    trial,
                    started: Instant::now(),
                    settled: false,
                })
            }
            Err(state) => {
                self.not_permitted.fetch_add(1, Ordering::Relaxed);
                metrics::record_call("circuit_breaker", &self.spec.name, "not_permitted");
                tracing::debug!(
                    name = %self.spec.name,
                    state = %state,
                    "Call not permitted"
                );
                pending.push(EventKind::CallNotPermitted { state });
                self.publish_all(pending);
                Err(CallNotPermitted {
                    name: self.spec.name.clone(),
                    state,
                })
            }
        }
    }

    /// Compare-exchange loop bounded by the half-open quota.
    fn try_take_trial_slot(&self) -> bool {
        let limit = self.spec.permitted_number_of_calls_in_half_open_state;
        let mut current = self.trial_permits.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return false;
            }
            match self.trial_permits.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    // --- Administrative API ---

    /// Move to `target`. Moving to the current state is rejected.
    pub fn transition_to(&self, target: CircuitState) -> Result<(), ConfigurationError> {
        self.admin_transition(target, None)
    }

    /// Open for exactly `duration`, then allow half-open trials, regardless of
    /// the automatic-transition setting. Also valid while already open.
    pub fn transition_to_open_for(&self, duration: Duration) -> Result<(), ConfigurationError> {
        self.admin_transition(CircuitState::Open, Some(duration))
    }

    /// Back to Closed with an empty window.
    pub fn reset(&self) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            let from = inner.state;
            let event = self.transition(&mut inner, CircuitState::Closed, None, Instant::now());
            if from != CircuitState::Closed {
                pending.push(event);
            }
        }
        tracing::warn!(admin = true, name = %self.spec.name, "Circuit breaker reset");
        self.publish_all(pending);
    }

    fn admin_transition(
        &self,
        target: CircuitState,
        open_for: Option<Duration>,
    ) -> Result<(), ConfigurationError> {
        let mut pending = Vec::new();
        let from = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            self.apply_timers(&mut inner, now, &mut pending);
            let from = inner.state;
            if from == target && open_for.is_none() {
                drop(inner);
                self.publish_all(pending);
                return Err(ConfigurationError::IllegalStateTransition {
                    name: self.spec.name.clone(),
                    from,
                    to: target,
                });
            }
            pending.push(self.transition(&mut inner, target, open_for, now));
            from
        };

        tracing::warn!(
            admin = true,
            name = %self.spec.name,
            from = %from,
            to = %target,
            open_for_ms = open_for.map(|d| d.as_millis() as u64),
            "Manual circuit breaker transition"
        );
        self.publish_all(pending);
        Ok(())
    }

    // --- State machine internals ---

    /// Apply due timed transitions. Caller holds the lock.
    fn apply_timers(&self, inner: &mut Inner, now: Instant, pending: &mut Vec<EventKind>) {
        match inner.state {
            CircuitState::Open => {
                if inner.open_until.is_some_and(|until| now >= until) {
                    pending.push(self.transition(inner, CircuitState::HalfOpen, None, now));
                }
            }
            CircuitState::HalfOpen => {
                let expired = self
                    .spec
                    .max_wait_duration_in_half_open_state
                    .and_then(|max| inner.transitioned_at.checked_add(max))
                    .is_some_and(|deadline| now >= deadline);
                if expired {
                    tracing::info!(
                        name = %self.spec.name,
                        "Half-open trials did not complete in time"
                    );
                    pending.push(self.transition(inner, CircuitState::Open, None, now));
                }
            }
            _ => {}
        }
    }

    /// Unconditional transition. Caller holds the lock.
    fn transition(
        &self,
        inner: &mut Inner,
        to: CircuitState,
        open_for: Option<Duration>,
        now: Instant,
    ) -> EventKind {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.transitioned_at = now;
        inner.open_until = match to {
            CircuitState::Open => open_for
                .or_else(|| {
                    self.spec
                        .automatic_transition_from_open_to_half_open_enabled
                        .then_some(self.spec.wait_duration_in_open_state)
                })
                .and_then(|wait| now.checked_add(wait)),
            _ => None,
        };
        match to {
            CircuitState::HalfOpen => {
                inner.window = SlidingWindow::new(
                    SlidingWindowType::CountBased,
                    self.spec.permitted_number_of_calls_in_half_open_state,
                );
            }
            // keep the window that caused the trip for inspection
            CircuitState::Open | CircuitState::ForcedOpen => {}
            _ => {
                inner.window = SlidingWindow::new(
                    self.spec.sliding_window_type,
                    self.spec.sliding_window_size,
                );
            }
        }
        self.trial_permits.store(0, Ordering::Release);

        tracing::info!(
            name = %self.spec.name,
            from = %from,
            to = %to,
            generation = inner.generation,
            "Circuit breaker state transition"
        );
        metrics::record_transition(&self.spec.name, from, to);
        EventKind::StateTransition { from, to }
    }

    fn record(&self, generation: u64, measurement: Measurement) -> Vec<EventKind> {
        let mut pending = Vec::new();
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            tracing::debug!(
                name = %self.spec.name,
                generation,
                current = inner.generation,
                "Discarding outcome from an earlier state"
            );
            return pending;
        }

        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => {
                let snapshot = inner.window.record(measurement);
                if snapshot.total_calls >= self.spec.effective_minimum_calls() {
                    if let Some(reason) = self.spec.exceeded(&snapshot) {
                        tracing::warn!(
                            name = %self.spec.name,
                            reason,
                            failure_rate = snapshot.failure_rate(),
                            slow_call_rate = snapshot.slow_call_rate(),
                            "Circuit breaker tripped"
                        );
                        pending.push(self.transition(&mut inner, CircuitState::Open, None, now));
                    }
                }
            }
            CircuitState::HalfOpen => {
                let snapshot = inner.window.record(measurement);
                if snapshot.total_calls >= self.spec.permitted_number_of_calls_in_half_open_state {
                    let to = match self.spec.exceeded(&snapshot) {
                        Some(_) => CircuitState::Open,
                        None => CircuitState::Closed,
                    };
                    pending.push(self.transition(&mut inner, to, None, now));
                }
            }
            CircuitState::MetricsOnly => {
                inner.window.record(measurement);
            }
            CircuitState::Disabled | CircuitState::Open | CircuitState::ForcedOpen => {}
        }
        pending
    }

    fn release_trial(&self, generation: u64) {
        let inner = self.inner.lock();
        if inner.generation == generation {
            // the slot was taken under this generation, so the counter is > 0
            self.trial_permits.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn publish_all(&self, events: Vec<EventKind>) {
        for event in events {
            self.events.publish(event);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.spec.name)
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .finish()
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire_permission`].
///
/// Report exactly one outcome. Dropping the permit without one gives a
/// half-open trial slot back and records nothing.
#[must_use = "report the call outcome through the permit"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    state: CircuitState,
    trial: bool,
    started: Instant,
    settled: bool,
}

impl CallPermit<'_> {
    /// State the call was admitted in.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn on_success(mut self) {
        let elapsed = self.started.elapsed();
        let pending = self.settle(false, elapsed);
        metrics::record_call("circuit_breaker", &self.breaker.spec.name, "successful");
        self.breaker.events.publish(EventKind::Success {
            attempts: 1,
            elapsed: Some(elapsed),
        });
        self.breaker.publish_all(pending);
    }

    pub fn on_failure(mut self, error: String) {
        let elapsed = self.started.elapsed();
        let pending = self.settle(true, elapsed);
        metrics::record_call("circuit_breaker", &self.breaker.spec.name, "failed");
        self.breaker.events.publish(EventKind::Error {
            attempts: 1,
            elapsed: Some(elapsed),
            error,
        });
        self.breaker.publish_all(pending);
    }

    /// The outcome does not count; a half-open slot is given back.
    pub fn on_ignored(mut self, error: String) {
        self.settled = true;
        if self.trial {
            self.breaker.release_trial(self.generation);
        }
        metrics::record_call("circuit_breaker", &self.breaker.spec.name, "ignored");
        self.breaker.events.publish(EventKind::IgnoredError { error });
    }

    /// Record the outcome. Returns the transitions it caused, to be
    /// published after the outcome event.
    fn settle(&mut self, failed: bool, elapsed: Duration) -> Vec<EventKind> {
        self.settled = true;
        let measurement = Measurement {
            failed,
            slow: elapsed >= self.breaker.spec.slow_call_duration_threshold,
            duration: elapsed,
        };
        self.breaker.record(self.generation, measurement)
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial(self.generation);
        }
    }
}

impl fmt::Debug for CallPermit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPermit")
            .field("breaker", &self.breaker.spec.name)
            .field("state", &self.state)
            .field("trial", &self.trial)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::Arc;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("server error")]
    struct ServerError;

    #[derive(Debug, Error)]
    #[error("not found")]
    struct NotFound;

    fn spec() -> CircuitBreakerSpecBuilder {
        CircuitBreakerSpec::builder("test")
            .sliding_window(SlidingWindowType::CountBased, 5)
            .minimum_number_of_calls(5)
            .failure_rate_threshold(50.0)
            .wait_duration_in_open_state(Duration::from_secs(5))
            .permitted_number_of_calls_in_half_open_state(3)
    }

    async fn succeed(cb: &CircuitBreaker) -> ResilienceResult<u32, ServerError> {
        cb.protect(|| async { Ok::<_, ServerError>(1) }).await
    }

    async fn fail(cb: &CircuitBreaker) -> ResilienceResult<u32, ServerError> {
        cb.protect(|| async { Err::<u32, _>(ServerError) }).await
    }

    async fn trip(cb: &CircuitBreaker) {
        for _ in 0..5 {
            let _ = fail(cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_spec_validation() {
        assert!(spec().failure_rate_threshold(0.0).build().is_err());
        assert!(spec().failure_rate_threshold(100.5).build().is_err());
        assert!(spec().slow_call_rate_threshold(-1.0).build().is_err());
        assert!(spec()
            .sliding_window(SlidingWindowType::CountBased, 0)
            .build()
            .is_err());
        assert!(spec()
            .permitted_number_of_calls_in_half_open_state(0)
            .build()
            .is_err());
        assert!(spec().failure_rate_threshold(100.0).build().is_ok());
    }

    #[test]
    fn test_minimum_calls_clamped_to_count_window() {
        let s = spec().minimum_number_of_calls(50).build().unwrap();
        assert_eq!(s.effective_minimum_calls(), 5);

        let s = spec()
            .sliding_window(SlidingWindowType::TimeBased, 5)
            .minimum_number_of_calls(50)
            .build()
            .unwrap();
        assert_eq!(s.effective_minimum_calls(), 50);
    }

    #[test]
    fn test_state_parsing() {
        assert_eq!("HALF_OPEN".parse(), Ok(CircuitState::HalfOpen));
        assert_eq!("forced-open".parse(), Ok(CircuitState::ForcedOpen));
        assert!("ajar".parse::<CircuitState>().is_err());
        assert_eq!(CircuitState::MetricsOnly.to_string(), "METRICS_ONLY");
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_at_threshold_and_rejects() {
        let cb = CircuitBreaker::new(spec().build().unwrap());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        let _ = succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        let _ = succeed(&cb).await;
        // 3 of 5 failed
        assert_eq!(cb.state(), CircuitState::Open);

        let err = succeed(&cb).await.unwrap_err();
        assert!(err.is_call_not_permitted());
        assert_eq!(cb.not_permitted_calls(), 1);
        // rejections are not buffered
        assert_eq!(cb.metrics().buffered_calls, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_evaluated_below_minimum_calls() {
        let cb = CircuitBreaker::new(spec().build().unwrap());
        for _ in 0..4 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().failure_rate, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_wait_then_closes() {
        let cb = CircuitBreaker::new(spec().build().unwrap());
        trip(&cb).await;

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        for _ in 0..3 {
            succeed(&cb).await.unwrap();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().buffered_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_failures_reopen() {
        let cb = CircuitBreaker::new(spec().build().unwrap());
        trip(&cb).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        let _ = succeed(&cb).await;
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        // the wait timer restarted
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_bounded_trials() {
        let cb = CircuitBreaker::new(spec().build().unwrap());
        trip(&cb).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        let p1 = cb.try_acquire_permission().unwrap();
        let p2 = cb.try_acquire_permission().unwrap();
        let p3 = cb.try_acquire_permission().unwrap();
        let rejected = cb.try_acquire_permission().unwrap_err();
        assert_eq!(rejected.state, CircuitState::HalfOpen);

        // a dropped permit gives its slot back
        drop(p3);
        let p4 = cb.try_acquire_permission().unwrap();
        assert!(p4.state() == CircuitState::HalfOpen);

        p1.on_success();
        // a settled trial keeps its slot
        assert_eq!(cb.metrics().half_open_trials_admitted, 3);
        p2.on_success();
        p4.on_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stays_open_without_automatic_transition() {
        let cb = CircuitBreaker::new(
            spec()
                .automatic_transition_from_open_to_half_open_enabled(false)
                .build()
                .unwrap(),
        );
        trip(&cb).await;
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(cb.state(), CircuitState::Open);

        // an explicit duration applies anyway
        cb.transition_to_open_for(Duration::from_secs(2)).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_wait_in_half_open_reopens() {
        let cb = CircuitBreaker::new(
            spec()
                .max_wait_duration_in_half_open_state(Duration::from_secs(1))
                .build()
                .unwrap(),
        );
        trip(&cb).await;
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_special_states() {
        let cb = CircuitBreaker::new(spec().build().unwrap());

        cb.transition_to(CircuitState::Disabled).unwrap();
        for _ in 0..10 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Disabled);
        assert_eq!(cb.metrics().buffered_calls, 0);

        cb.transition_to(CircuitState::MetricsOnly).unwrap();
        for _ in 0..10 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::MetricsOnly);
        assert_eq!(cb.metrics().failed_calls, 5);

        cb.transition_to(CircuitState::ForcedOpen).unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(succeed(&cb).await.unwrap_err().is_call_not_permitted());
        assert_eq!(cb.state(), CircuitState::ForcedOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_state_transition_is_illegal() {
        let cb = CircuitBreaker::new(spec().build().unwrap());
        let err = cb.transition_to(CircuitState::Closed).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::IllegalStateTransition {
                from: CircuitState::Closed,
                to: CircuitState::Closed,
                ..
            }
        ));

        cb.transition_to(CircuitState::Open).unwrap();
        assert!(cb.transition_to(CircuitState::Open).is_err());
        // re-opening for an explicit duration is allowed
        assert!(cb.transition_to_open_for(Duration::from_secs(1)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcomes_from_earlier_generation_are_discarded() {
        let cb = CircuitBreaker::new(spec().build().unwrap());
        let permits: Vec<_> = (0..5).map(|_| cb.try_acquire_permission().unwrap()).collect();
        cb.reset();
        for permit in permits {
            permit.on_failure("late".into());
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().buffered_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_errors_are_not_recorded() {
        let cb = CircuitBreaker::new(
            spec()
                .ignore(ErrorMatcher::of::<NotFound>())
                .build()
                .unwrap(),
        );
        for _ in 0..10 {
            let _ = cb.protect(|| async { Err::<u32, _>(NotFound) }).await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().buffered_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecorded_errors_count_as_success() {
        let cb = CircuitBreaker::new(
            spec()
                .record_failure(FailureClassifier::new(ErrorMatcher::of::<ServerError>()))
                .build()
                .unwrap(),
        );
        for _ in 0..5 {
            let _ = cb.protect(|| async { Err::<u32, _>(NotFound) }).await;
        }
        let m = cb.metrics();
        assert_eq!(m.buffered_calls, 5);
        assert_eq!(m.failed_calls, 0);
        assert_eq!(m.state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_calls_trip() {
        let cb = CircuitBreaker::new(
            spec()
                .slow_call_duration_threshold(Duration::from_millis(100))
                .slow_call_rate_threshold(60.0)
                .build()
                .unwrap(),
        );
        for _ in 0..3 {
            cb.protect(|| async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok::<_, ServerError>(1)
            })
            .await
            .unwrap();
        }
        let _ = succeed(&cb).await;
        let _ = succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_result_counts_as_failure() {
        let cb = CircuitBreaker::new(
            spec()
                .record_result(ResultPredicate::when(|v: &u32| *v == 0))
                .build()
                .unwrap(),
        );
        for _ in 0..5 {
            let out = cb.protect(|| async { Ok::<u32, ServerError>(0) }).await;
            assert_eq!(out.unwrap(), 0);
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_receives_call_not_permitted() {
        let cb = CircuitBreaker::new(
            spec()
                .fallback(Fallback::on_error(|id: &String, e: &CallNotPermitted| {
                    format!("{} unavailable ({})", id, e.state)
                }))
                .build()
                .unwrap(),
        );
        trip(&cb).await;

        let out = cb
            .execute("tt0111161".to_string(), |_| async {
                Ok::<String, ServerError>("live".into())
            })
            .await
            .unwrap();
        assert_eq!(out, "tt0111161 unavailable (OPEN)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transition_events_in_order() {
        let cb = CircuitBreaker::new(spec().build().unwrap());
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let s = seen.clone();
        cb.subscribe(EventCategory::StateTransition, move |e| {
            if let EventKind::StateTransition { from, to } = e.kind {
                s.lock().push((from, to));
            }
        });

        trip(&cb).await;
        tokio::time::advance(Duration::from_secs(5)).await;
        for _ in 0..3 {
            succeed(&cb).await.unwrap();
        }

        assert_eq!(
            *seen.lock(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }
}
