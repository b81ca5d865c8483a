use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::admin::AdminState;
use crate::error::ConfigurationError;
use crate::resilience::circuit_breaker::{CircuitBreakerMetrics, CircuitState, ParseStateError};
use crate::resilience::retries::RetryMetrics;

#[derive(Debug, Serialize, Deserialize)]
pub struct SystemStatus {
    pub version: String,
    pub status: String,
    pub retries: usize,
    pub circuit_breakers: usize,
}

/// Body of `POST /admin/circuit-breakers/{name}/state`.
#[derive(Debug, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub state: String,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// Error body for every non-2xx admin response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug)]
pub enum AdminError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
}

impl From<ConfigurationError> for AdminError {
    fn from(err: ConfigurationError) -> Self {
        match err {
            ConfigurationError::UnknownInstance { .. } => AdminError::NotFound(err.to_string()),
            ConfigurationError::IllegalStateTransition { .. } => {
                AdminError::Conflict(err.to_string())
            }
            other => AdminError::BadRequest(other.to_string()),
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            AdminError::NotFound(e) => (StatusCode::NOT_FOUND, e),
            AdminError::BadRequest(e) => (StatusCode::BAD_REQUEST, e),
            AdminError::Conflict(e) => (StatusCode::CONFLICT, e),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: "operational".to_string(),
        retries: state.registry.retry_names().len(),
        circuit_breakers: state.registry.circuit_breaker_names().len(),
    })
}

pub async fn list_circuit_breakers(
    State(state): State<AdminState>,
) -> Json<Vec<CircuitBreakerMetrics>> {
    Json(state.registry.circuit_breaker_metrics())
}

pub async fn get_circuit_breaker(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<CircuitBreakerMetrics>, AdminError> {
    breaker_metrics(&state, &name).map(Json)
}

pub async fn transition_circuit_breaker(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(body): Json<TransitionRequest>,
) -> Result<Json<CircuitBreakerMetrics>, AdminError> {
    let target: CircuitState = body
        .state
        .parse()
        .map_err(|e: ParseStateError| AdminError::BadRequest(e.to_string()))?;
    let duration = body.duration_ms.map(Duration::from_millis);

    state.registry.transition_state(&name, target, duration)?;
    breaker_metrics(&state, &name).map(Json)
}

pub async fn reset_circuit_breaker(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<CircuitBreakerMetrics>, AdminError> {
    state.registry.reset_circuit_breaker(&name)?;
    breaker_metrics(&state, &name).map(Json)
}

pub async fn list_retries(State(state): State<AdminState>) -> Json<Vec<RetryMetrics>> {
    Json(state.registry.retry_metrics())
}

fn breaker_metrics(state: &AdminState, name: &str) -> Result<CircuitBreakerMetrics, AdminError> {
    state
        .registry
        .find_circuit_breaker(name)
        .map(|cb| cb.metrics())
        .ok_or_else(|| AdminError::NotFound(format!("no circuit breaker registered under '{}'", name)))
}
