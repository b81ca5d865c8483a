//! Error types shared by every resilience component.
//!
//! # Kinds
//! - Transient: retryable failure whose attempts ran out
//! - Permanent: failure that was not retried (non-retryable, ignored, or a
//!   plain circuit-breaker failure)
//! - CallNotPermitted: a breaker refused admission
//! - Configuration: invalid spec, unknown name, duplicate registration
//!
//! Configuration errors are fatal at startup and are never handed to a
//! fallback.

use std::fmt;

use thiserror::Error;

use crate::resilience::circuit_breaker::CircuitState;

/// Coarse classification of a [`ResilienceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    CallNotPermitted,
    Configuration,
}

/// A breaker rejected the call without invoking the operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit breaker '{name}' is {state} and does not permit further calls")]
pub struct CallNotPermitted {
    pub name: String,
    pub state: CircuitState,
}

/// Invalid configuration or an illegal administrative request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    /// An instance with this name is already registered.
    #[error("{kind} '{name}' is already registered")]
    DuplicateName { kind: &'static str, name: String },

    /// No instance registered under this name.
    #[error("no {kind} registered under '{name}'")]
    UnknownInstance { kind: &'static str, name: String },

    /// A numeric setting is outside its permitted range.
    #[error("{field} = {value} is out of range (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: String,
        expected: &'static str,
    },

    /// A configuration file references a catalog entry that does not exist.
    #[error("unknown {kind} '{name}' referenced by '{instance}'")]
    UnknownCatalogEntry {
        kind: &'static str,
        name: String,
        instance: String,
    },

    /// The fallback attached to a spec cannot handle this call's types.
    #[error("fallback for '{name}' expects ({args}) -> {output}")]
    FallbackSignature {
        name: String,
        args: &'static str,
        output: &'static str,
    },

    /// Administrative transition that the state machine does not allow.
    #[error("circuit breaker '{name}' cannot transition from {from} to {to}")]
    IllegalStateTransition {
        name: String,
        from: CircuitState,
        to: CircuitState,
    },
}

impl ConfigurationError {
    pub(crate) fn out_of_range(
        field: &'static str,
        value: impl fmt::Display,
        expected: &'static str,
    ) -> Self {
        Self::OutOfRange {
            field,
            value: value.to_string(),
            expected,
        }
    }
}

/// Error returned by a protected call.
///
/// `E` is the wrapped operation's own error type; it is preserved untouched
/// so callers can still match on it.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// The operation failed and was not retried further.
    #[error("{0}")]
    Operation(E),

    /// The operation kept failing with a retryable error.
    #[error("'{name}' gave up after {attempts} attempts: {source}")]
    Exhausted {
        name: String,
        attempts: u32,
        source: E,
    },

    #[error(transparent)]
    CallNotPermitted(#[from] CallNotPermitted),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl<E> ResilienceError<E> {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResilienceError::Operation(_) => ErrorKind::Permanent,
            ResilienceError::Exhausted { .. } => ErrorKind::Transient,
            ResilienceError::CallNotPermitted(_) => ErrorKind::CallNotPermitted,
            ResilienceError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// The wrapped operation's error, if the failure came from it.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            ResilienceError::Operation(e) | ResilienceError::Exhausted { source: e, .. } => Some(e),
            _ => None,
        }
    }

    pub fn into_operation_error(self) -> Option<E> {
        match self {
            ResilienceError::Operation(e) | ResilienceError::Exhausted { source: e, .. } => Some(e),
            _ => None,
        }
    }

    pub fn is_call_not_permitted(&self) -> bool {
        matches!(self, ResilienceError::CallNotPermitted(_))
    }
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + 'static,
{
    /// The error a fallback should see, or `None` for configuration errors.
    pub(crate) fn fallback_cause(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResilienceError::Operation(e) | ResilienceError::Exhausted { source: e, .. } => Some(e),
            ResilienceError::CallNotPermitted(e) => Some(e),
            ResilienceError::Configuration(_) => None,
        }
    }
}

/// Result alias for protected calls.
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;
