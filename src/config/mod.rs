//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ResilienceConfig (validated, immutable)
//!     → lifecycle::startup::build_registry (specs + catalog lookups)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; specs built from it never change
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::ResilienceConfig;
pub use schema::{CircuitBreakerConfig, RetryConfig};
