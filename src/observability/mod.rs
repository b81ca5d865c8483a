//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Retry / CircuitBreaker / EventBus / registry:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters and gauges via `metrics`)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Instance names are structured fields, never interpolated into messages
//! - Metrics are cheap no-ops until a recorder is installed

pub mod logging;
pub mod metrics;
