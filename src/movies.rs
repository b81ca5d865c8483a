//! Simulated movie lookup used by the demo binary.
//!
//! The client fails a configurable number of times with a chosen failure
//! before answering, so every policy in the sample configuration can be
//! watched retrying, giving up, tripping or falling back.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use clap::ValueEnum;
use resilience_engine::resilience::classifier::{ErrorMatcher, ResultPredicate};
use resilience_engine::resilience::fallback::Fallback;
use resilience_engine::Catalog;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Movie {
    pub id: String,
    pub title: String,
    pub director: String,
    pub rating: f64,
}

impl Movie {
    /// Placeholder returned when the real movie cannot be produced.
    pub fn placeholder() -> Self {
        Self {
            id: "Default".to_string(),
            title: "N/A".to_string(),
            director: "N/A".to_string(),
            rating: 0.0,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.id == "Default"
    }
}

#[derive(Debug, Clone, Error)]
#[error("movie '{id}' not found")]
pub struct MovieNotFound {
    pub id: String,
}

#[derive(Debug, Clone, Error)]
pub enum MovieError {
    #[error("movie API returned server error {status}")]
    Server { status: u16 },

    #[error("movie API rejected the request with {status}")]
    Client { status: u16 },

    #[error("{0}")]
    NotFound(#[source] MovieNotFound),

    #[error("movie API unreachable: {0}")]
    Network(String),
}

/// Failure injected by the simulated client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FailureMode {
    Server,
    Client,
    NotFound,
    Network,
}

impl FailureMode {
    fn error(self, id: &str) -> MovieError {
        match self {
            FailureMode::Server => MovieError::Server { status: 503 },
            FailureMode::Client => MovieError::Client { status: 429 },
            FailureMode::NotFound => MovieError::NotFound(MovieNotFound { id: id.to_string() }),
            FailureMode::Network => MovieError::Network("connection refused".to_string()),
        }
    }
}

/// In-process stand-in for the downstream movie API.
#[derive(Debug)]
pub struct MovieClient {
    remaining_failures: AtomicU32,
    failure: FailureMode,
    latency: Duration,
}

impl MovieClient {
    pub fn new(fail_times: u32, failure: FailureMode) -> Self {
        Self {
            remaining_failures: AtomicU32::new(fail_times),
            failure,
            latency: Duration::from_millis(20),
        }
    }

    pub async fn get_movie_details(&self, id: &str) -> Result<Movie, MovieError> {
        tokio::time::sleep(self.latency).await;

        let failing = self
            .remaining_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            let err = self.failure.error(id);
            tracing::error!(movie_id = %id, error = %err, "Movie lookup failed");
            return Err(err);
        }

        Ok(Movie {
            id: id.to_string(),
            title: "The Shawshank Redemption".to_string(),
            director: "Frank Darabont".to_string(),
            rating: 9.3,
        })
    }
}

/// Named matchers, predicates and fallbacks the sample configuration uses.
pub fn catalog() -> Catalog {
    Catalog::new()
        .with_error(
            "server",
            ErrorMatcher::when(|e: &MovieError| matches!(e, MovieError::Server { .. })),
        )
        .with_error(
            "client",
            ErrorMatcher::when(|e: &MovieError| matches!(e, MovieError::Client { .. })),
        )
        .with_error("not_found", ErrorMatcher::of::<MovieNotFound>())
        .with_error(
            "network",
            ErrorMatcher::when(|e: &MovieError| matches!(e, MovieError::Network(_))),
        )
        .with_result(
            "default_movie",
            ResultPredicate::when(|movie: &Movie| {
                tracing::debug!(movie_id = %movie.id, "Checking for placeholder movie");
                movie.is_placeholder()
            }),
        )
        .with_fallback(
            "movieFallback",
            Fallback::on_error(|id: &String, err: &MovieNotFound| {
                tracing::info!(movie_id = %id, error = %err, "Fallback called");
                Movie::placeholder()
            }),
        )
}
