//! Per-instance event publishing.
//!
//! # Data Flow
//! ```text
//! Retry / CircuitBreaker
//!     → EventBus::publish (same task, before the call returns)
//!     → category subscribers, in subscription order
//!     → catch-all subscribers
//! ```
//!
//! # Design Decisions
//! - Publishing is synchronous and ordered with the protected call
//! - Subscriber lists are copied out of the lock before handlers run, so a
//!   handler may subscribe or inspect the instance without deadlocking
//! - A panicking handler is contained and logged; the call result is never
//!   affected

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::observability::metrics;
use crate::resilience::circuit_breaker::CircuitState;

/// Which component emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    Retry,
    CircuitBreaker,
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceKind::Retry => write!(f, "retry"),
            InstanceKind::CircuitBreaker => write!(f, "circuit_breaker"),
        }
    }
}

/// Subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Attempt,
    Success,
    Error,
    Retry,
    IgnoredError,
    StateTransition,
    CallNotPermitted,
}

/// Event payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// An attempt is about to run.
    Attempt { attempt: u32 },
    /// A retryable failure; the next attempt runs after `wait`.
    Retry {
        attempt: u32,
        wait: Duration,
        error: String,
    },
    Success {
        attempts: u32,
        elapsed: Option<Duration>,
    },
    Error {
        attempts: u32,
        elapsed: Option<Duration>,
        error: String,
    },
    IgnoredError { error: String },
    StateTransition { from: CircuitState, to: CircuitState },
    CallNotPermitted { state: CircuitState },
}

impl EventKind {
    pub fn category(&self) -> EventCategory {
        match self {
            EventKind::Attempt { .. } => EventCategory::Attempt,
            EventKind::Retry { .. } => EventCategory::Retry,
            EventKind::Success { .. } => EventCategory::Success,
            EventKind::Error { .. } => EventCategory::Error,
            EventKind::IgnoredError { .. } => EventCategory::IgnoredError,
            EventKind::StateTransition { .. } => EventCategory::StateTransition,
            EventKind::CallNotPermitted { .. } => EventCategory::CallNotPermitted,
        }
    }
}

/// One published event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub instance: String,
    pub source: InstanceKind,
    pub created_at: SystemTime,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn category(&self) -> EventCategory {
        self.kind.category()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}': ", self.source, self.instance)?;
        match &self.kind {
            EventKind::Attempt { attempt } => write!(f, "attempt #{}", attempt),
            EventKind::Retry {
                attempt,
                wait,
                error,
            } => write!(
                f,
                "attempt #{} failed ({}), retrying in {:?}",
                attempt, error, wait
            ),
            EventKind::Success { attempts, .. } => {
                write!(f, "succeeded after {} attempt(s)", attempts)
            }
            EventKind::Error {
                attempts, error, ..
            } => write!(f, "failed after {} attempt(s): {}", attempts, error),
            EventKind::IgnoredError { error } => write!(f, "ignored error: {}", error),
            EventKind::StateTransition { from, to } => write!(f, "{} -> {}", from, to),
            EventKind::CallNotPermitted { state } => write!(f, "call rejected while {}", state),
        }
    }
}

/// Subscriber callback.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    by_category: HashMap<EventCategory, Vec<EventHandler>>,
    all: Vec<EventHandler>,
}

/// Subscriber lists for one instance.
pub struct EventBus {
    instance: String,
    source: InstanceKind,
    subscribers: RwLock<Subscribers>,
}

impl EventBus {
    pub fn new(instance: impl Into<String>, source: InstanceKind) -> Self {
        Self {
            instance: instance.into(),
            source,
            subscribers: RwLock::new(Subscribers::default()),
        }
    }

    pub fn subscribe<F>(&self, category: EventCategory, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .by_category
            .entry(category)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Receive every event regardless of category.
    pub fn subscribe_all<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribers.write().all.push(Arc::new(handler));
    }

    pub fn subscriber_count(&self) -> usize {
        let subs = self.subscribers.read();
        subs.all.len() + subs.by_category.values().map(Vec::len).sum::<usize>()
    }

    pub fn publish(&self, kind: EventKind) {
        let handlers: Vec<EventHandler> = {
            let subs = self.subscribers.read();
            let category = kind.category();
            subs.by_category
                .get(&category)
                .into_iter()
                .flatten()
                .chain(subs.all.iter())
                .cloned()
                .collect()
        };

        let event = Event {
            instance: self.instance.clone(),
            source: self.source,
            created_at: SystemTime::now(),
            kind,
        };
        tracing::trace!(event = %event, "Publishing event");

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::warn!(
                    instance = %self.instance,
                    category = ?event.category(),
                    "Event subscriber panicked; event dropped for this subscriber"
                );
                metrics::record_subscriber_failure(&self.instance);
            }
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("instance", &self.instance)
            .field("source", &self.source)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
