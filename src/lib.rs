//! Resilience engine library: retries, circuit breakers and a registry of
//! named, configured instances.

pub mod admin;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod observability;
pub mod registry;
pub mod resilience;

pub use config::schema::ResilienceConfig;
pub use error::{CallNotPermitted, ConfigurationError, ErrorKind, ResilienceError, ResilienceResult};
pub use events::{Event, EventCategory, EventKind};
pub use lifecycle::Shutdown;
pub use registry::{Catalog, ResilienceRegistry, UnknownNamePolicy};
