//! Resilience engine demo.
//!
//! Looks up a movie from a simulated downstream API through one of the
//! policies in the configuration file, then optionally keeps the admin API
//! running so the breakers can be inspected and driven by hand.
//!
//! # Architecture Overview
//!
//! ```text
//!   --policy selector ──▶ instance name
//!                              │
//!                              ▼
//!   ┌──────────────────────────────────────────────────────┐
//!   │                 ResilienceRegistry                    │
//!   │   ┌────────────┐     ┌────────────────┐               │
//!   │   │   Retry    │ ──▶ │ CircuitBreaker │ ──▶ MovieClient
//!   │   │ + backoff  │     │ + window       │   (simulated) │
//!   │   └────────────┘     └────────────────┘               │
//!   │          │                   │                        │
//!   │          └──── EventBus ─────┘──▶ subscribers / logs  │
//!   └──────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!              movie, fallback movie, or error
//! ```

mod movies;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use resilience_engine::admin::{self, AdminState};
use resilience_engine::config::load_config;
use resilience_engine::lifecycle::{build_registry, signals::shutdown_on_signal, Shutdown};
use resilience_engine::observability::{logging::init_logging, metrics::init_metrics};
use resilience_engine::{ConfigurationError, EventCategory, ResilienceRegistry};

use crate::movies::{FailureMode, Movie, MovieClient, MovieError};

#[derive(Parser)]
#[command(name = "resilience-demo")]
#[command(about = "Look up a movie through a configured resilience policy", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/resilience.example.toml")]
    config: PathBuf,

    /// simple-retry, retry-on-exception, retry-on-exception-predicate,
    /// retry-on-conditional-predicate, retry-using-exponential-backoff,
    /// retry-using-randomized-wait, retry-with-fallback,
    /// retry-with-custom-config, retry-with-event-details,
    /// custom-circuit-breaker
    #[arg(short, long, default_value = "simple-retry")]
    policy: String,

    #[arg(short, long, default_value = "tt0111161")]
    movie_id: String,

    /// How many calls to the movie API fail before it answers.
    #[arg(long, default_value_t = 0)]
    fail_times: u32,

    #[arg(long, value_enum, default_value_t = FailureMode::Server)]
    failure: FailureMode,

    /// Number of lookups to run.
    #[arg(long, default_value_t = 1)]
    calls: u32,

    /// Keep serving the admin API after the lookups finish.
    #[arg(long)]
    serve_admin: bool,
}

/// Demo selectors and the instance each one runs under.
const SELECTORS: &[(&str, &str)] = &[
    ("simple-retry", "simpleRetry"),
    ("retry-on-exception", "retryOnException"),
    ("retry-on-exception-predicate", "retryBasedOnExceptionPredicate"),
    ("retry-on-conditional-predicate", "retryBasedOnConditionalPredicate"),
    ("retry-using-exponential-backoff", "retryUsingExponentialBackoff"),
    ("retry-using-randomized-wait", "retryUsingRandomizedWait"),
    ("retry-with-fallback", "retryWithFallback"),
    ("retry-with-custom-config", "customRetryConfig"),
    ("retry-with-event-details", "retryWithEventDetails"),
    ("custom-circuit-breaker", "customCircuitBreaker"),
];

fn instance_for(selector: &str) -> Result<&'static str, ConfigurationError> {
    SELECTORS
        .iter()
        .find(|(s, _)| *s == selector)
        .map(|(_, instance)| *instance)
        .ok_or_else(|| ConfigurationError::UnknownInstance {
            kind: "policy selector",
            name: selector.to_string(),
        })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = load_config(&args.config)?;
    init_logging(&config.observability);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "resilience-demo starting"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let registry = build_registry(&config, &movies::catalog())?;
    let instance = instance_for(&args.policy)?;

    if instance == "retryWithEventDetails" {
        log_event_details(&registry, instance)?;
    }

    let client = Arc::new(MovieClient::new(args.fail_times, args.failure));
    for call in 1..=args.calls {
        tracing::info!(policy = %args.policy, instance, call, "Looking up movie");
        match lookup(&registry, instance, &client, &args.movie_id).await {
            Ok(movie) => println!("{}", serde_json::to_string_pretty(&movie)?),
            Err(e) => tracing::error!(
                instance,
                call,
                kind = ?e.kind(),
                error = %e,
                "Movie lookup failed"
            ),
        }
    }

    if args.serve_admin || config.admin.enabled {
        let addr = config.admin.bind_address.parse()?;
        let shutdown = Shutdown::new();
        tokio::spawn(shutdown_on_signal(shutdown.clone()));

        let state = AdminState::new(registry.clone(), config.admin.api_key.as_str());
        admin::serve(addr, state, shutdown).await?;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn lookup(
    registry: &ResilienceRegistry,
    instance: &str,
    client: &Arc<MovieClient>,
    movie_id: &str,
) -> resilience_engine::ResilienceResult<Movie, MovieError> {
    // The conditional-predicate policy retries on the placeholder value,
    // so a missing movie is turned into one before the retry sees it.
    let placeholder_on_missing = instance == "retryBasedOnConditionalPredicate";

    registry
        .execute(instance, movie_id.to_string(), |id: &String| {
            let client = Arc::clone(client);
            let id = id.clone();
            async move {
                match client.get_movie_details(&id).await {
                    Err(MovieError::NotFound(e)) if placeholder_on_missing => {
                        tracing::info!(error = %e, "Movie not found, returning placeholder");
                        Ok(Movie::placeholder())
                    }
                    other => other,
                }
            }
        })
        .await
}

fn log_event_details(registry: &ResilienceRegistry, instance: &str) -> Result<(), ConfigurationError> {
    for category in [
        EventCategory::Error,
        EventCategory::Retry,
        EventCategory::Success,
        EventCategory::IgnoredError,
    ] {
        registry.subscribe(instance, category, move |event| {
            tracing::debug!(category = ?category, event = %event, "Retry event");
        })?;
    }
    registry.subscribe_all(instance, |event| {
        tracing::debug!(event = %event, "Retry event");
    })
}
