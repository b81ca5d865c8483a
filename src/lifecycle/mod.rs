//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Build specs (catalog lookups) → Registry
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop admin server → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config, then logging, then registry, then admin
//! - Any startup error is fatal and returned from `main`

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::build_registry;
