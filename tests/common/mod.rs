//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use resilience_engine::events::Event;
use resilience_engine::EventCategory;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Downstream {
    #[error("downstream returned {0}")]
    Status(u16),

    #[error("resource {0} not found")]
    NotFound(String),

    #[error("connection reset")]
    Reset,
}

/// Downstream stand-in whose answers are programmed per call number.
pub struct Programmable<F> {
    calls: AtomicU32,
    answer: F,
}

impl<F> Programmable<F>
where
    F: Fn(u32) -> Result<String, Downstream> + Send + Sync,
{
    pub fn new(answer: F) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            answer,
        })
    }

    /// Call numbers start at 1.
    pub async fn call(&self) -> Result<String, Downstream> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::task::yield_now().await;
        (self.answer)(n)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Fails the first `failures` calls with `err`, then answers "ok".
pub fn failing_first(
    failures: u32,
    err: Downstream,
) -> Arc<Programmable<impl Fn(u32) -> Result<String, Downstream> + Send + Sync>> {
    Programmable::new(move |n| {
        if n <= failures {
            Err(err.clone())
        } else {
            Ok("ok".to_string())
        }
    })
}

/// Collects every event a subscriber sees.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn handler(&self) -> impl Fn(&Event) + Send + Sync + 'static {
        let events = self.events.clone();
        move |event: &Event| events.lock().push(event.clone())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn categories(&self) -> Vec<EventCategory> {
        self.events.lock().iter().map(Event::category).collect()
    }
}
