//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define resilience metrics on the `metrics` facade
//! - Optionally expose them on a Prometheus scrape endpoint
//!
//! # Metrics
//! - `resilience_calls_total` (counter): calls by kind, name, outcome
//! - `resilience_retries_total` (counter): waits before another attempt
//! - `resilience_circuit_state` (gauge): 0=closed 1=open 2=half_open
//!   3=disabled 4=forced_open 5=metrics_only
//! - `resilience_circuit_transitions_total` (counter): transitions by from, to
//! - `resilience_subscriber_failures_total` (counter): panicking subscribers
//!
//! # Design Decisions
//! - Without an installed recorder every call here is a no-op
//! - Labels carry instance names; the number of instances is bounded by
//!   configuration

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::resilience::circuit_breaker::CircuitState;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_call(kind: &'static str, name: &str, outcome: &'static str) {
    metrics::counter!(
        "resilience_calls_total",
        "kind" => kind,
        "name" => name.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_retry(name: &str) {
    metrics::counter!("resilience_retries_total", "name" => name.to_string()).increment(1);
}

pub fn record_state(name: &str, state: CircuitState) {
    metrics::gauge!("resilience_circuit_state", "name" => name.to_string())
        .set(state_value(state));
}

pub fn record_transition(name: &str, from: CircuitState, to: CircuitState) {
    metrics::counter!(
        "resilience_circuit_transitions_total",
        "name" => name.to_string(),
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
    record_state(name, to);
}

pub fn record_subscriber_failure(instance: &str) {
    metrics::counter!(
        "resilience_subscriber_failures_total",
        "name" => instance.to_string()
    )
    .increment(1);
}

fn state_value(state: CircuitState) -> f64 {
    match state {
        CircuitState::Closed => 0.0,
        CircuitState::Open => 1.0,
        CircuitState::HalfOpen => 2.0,
        CircuitState::Disabled => 3.0,
        CircuitState::ForcedOpen => 4.0,
        CircuitState::MetricsOnly => 5.0,
    }
}
