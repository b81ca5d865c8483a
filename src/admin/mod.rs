//! Operator control surface.
//!
//! # Responsibilities
//! - Expose breaker and retry metrics over HTTP
//! - Accept manual breaker transitions and resets
//!
//! # Design Decisions
//! - Every route sits behind the bearer-token middleware
//! - Handlers only call the registry's administrative API, so manual
//!   transitions are logged the same way as library calls

pub mod auth;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::lifecycle::Shutdown;
use crate::registry::ResilienceRegistry;

/// Shared state for admin handlers.
#[derive(Debug, Clone)]
pub struct AdminState {
    pub registry: Arc<ResilienceRegistry>,
    pub api_key: Arc<str>,
}

impl AdminState {
    pub fn new(registry: Arc<ResilienceRegistry>, api_key: impl Into<Arc<str>>) -> Self {
        Self {
            registry,
            api_key: api_key.into(),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/circuit-breakers", get(list_circuit_breakers))
        .route("/admin/circuit-breakers/{name}", get(get_circuit_breaker))
        .route(
            "/admin/circuit-breakers/{name}/state",
            post(transition_circuit_breaker),
        )
        .route(
            "/admin/circuit-breakers/{name}/reset",
            post(reset_circuit_breaker),
        )
        .route("/admin/retries", get(list_retries))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin API until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    state: AdminState,
    shutdown: Shutdown,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(address = %listener.local_addr()?, "Admin API listening");
    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(shutdown.wait())
        .await
}
