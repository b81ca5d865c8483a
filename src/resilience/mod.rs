//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Protected call:
//!     → retries.rs (attempt loop, classify failure, back off)
//!         → circuit_breaker.rs (admission, record outcome, trip / recover)
//!             → operation
//!     → fallback.rs (replace a failed result when configured)
//! ```
//!
//! # Design Decisions
//! - classifier.rs and backoff.rs are pure; they hold no call state
//! - Breaker windows live in window.rs and are only touched under the
//!   breaker's lock
//! - Specs are immutable once built; instances own the mutable state

pub mod backoff;
pub mod circuit_breaker;
pub mod classifier;
pub mod fallback;
pub mod retries;
pub mod window;

pub use backoff::BackoffPolicy;
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerMetrics, CircuitBreakerSpec,
    CircuitBreakerSpecBuilder, CircuitState,
};
pub use classifier::{Classification, ErrorMatcher, FailureClassifier, ResultPredicate};
pub use fallback::Fallback;
pub use retries::{Retry, RetryMetrics, RetrySpec, RetrySpecBuilder};
pub use window::{SlidingWindowType, Snapshot};
