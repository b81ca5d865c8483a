//! Fallback functions.
//!
//! A fallback has the fixed shape `(args, error) -> result`. It is attached
//! to a spec when the spec is built, so the spec does not know the call's
//! types; they are checked when the fallback is applied.

use std::any::{type_name, Any};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use crate::error::{ConfigurationError, ResilienceError, ResilienceResult};

type ArgsRef<'a> = &'a (dyn Any + Send + Sync);
type ErrorRef<'a> = &'a (dyn StdError + 'static);

enum Applied {
    Value(Box<dyn Any + Send>),
    NotApplicable,
    ArgsMismatch,
}

/// Type-erased `(args, error) -> result`.
#[derive(Clone)]
pub struct Fallback {
    args: &'static str,
    output: &'static str,
    f: Arc<dyn Fn(ArgsRef<'_>, ErrorRef<'_>) -> Applied + Send + Sync>,
}

impl Fallback {
    /// Applies to every error.
    pub fn new<A, T, F>(f: F) -> Self
    where
        A: Any + Send + Sync,
        T: Send + 'static,
        F: Fn(&A, &(dyn StdError + 'static)) -> T + Send + Sync + 'static,
    {
        Self {
            args: type_name::<A>(),
            output: type_name::<T>(),
            f: Arc::new(move |args: &(dyn Any + Send + Sync), err: &(dyn StdError + 'static)| {
                match args.downcast_ref::<A>() {
                    Some(args) => Applied::Value(Box::new(f(args, err))),
                    None => Applied::ArgsMismatch,
                }
            }),
        }
    }

    /// Applies only when the error (or one of its sources) is an `Err`;
    /// any other error propagates unchanged.
    pub fn on_error<A, T, Err, F>(f: F) -> Self
    where
        A: Any + Send + Sync,
        T: Send + 'static,
        Err: StdError + 'static,
        F: Fn(&A, &Err) -> T + Send + Sync + 'static,
    {
        Self {
            args: type_name::<A>(),
            output: type_name::<T>(),
            f: Arc::new(move |args: &(dyn Any + Send + Sync), err: &(dyn StdError + 'static)| {
                let Some(args) = args.downcast_ref::<A>() else {
                    return Applied::ArgsMismatch;
                };
                let matched = std::iter::successors(Some(err), |e| (*e).source())
                    .find_map(|e| e.downcast_ref::<Err>());
                match matched {
                    Some(err) => Applied::Value(Box::new(f(args, err))),
                    None => Applied::NotApplicable,
                }
            }),
        }
    }

    /// `Ok(None)` when this fallback does not handle `err`.
    pub(crate) fn apply<A, T>(
        &self,
        name: &str,
        args: &A,
        err: &(dyn StdError + 'static),
    ) -> Result<Option<T>, ConfigurationError>
    where
        A: Any + Send + Sync,
        T: 'static,
    {
        match (self.f)(args, err) {
            Applied::Value(value) => value
                .downcast::<T>()
                .map(|v| Some(*v))
                .map_err(|_| self.signature_error(name)),
            Applied::NotApplicable => Ok(None),
            Applied::ArgsMismatch => Err(self.signature_error(name)),
        }
    }

    fn signature_error(&self, name: &str) -> ConfigurationError {
        ConfigurationError::FallbackSignature {
            name: name.to_string(),
            args: self.args,
            output: self.output,
        }
    }
}

/// Replace a failed result with the fallback's value when one applies.
///
/// Configuration errors always propagate.
pub(crate) fn recover<A, T, E>(
    name: &str,
    fallback: Option<&Fallback>,
    args: &A,
    result: ResilienceResult<T, E>,
) -> ResilienceResult<T, E>
where
    A: Any + Send + Sync,
    T: 'static,
    E: StdError + 'static,
{
    let err = match result {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };
    let (Some(fallback), Some(cause)) = (fallback, err.fallback_cause()) else {
        return Err(err);
    };
    match fallback.apply::<A, T>(name, args, cause) {
        Ok(Some(value)) => {
            tracing::debug!(name = %name, error = %cause, "Fallback applied");
            Ok(value)
        }
        Ok(None) => Err(err),
        Err(config) => Err(ResilienceError::Configuration(config)),
    }
}

impl fmt::Debug for Fallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fallback(({}) -> {})", self.args, self.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("not found")]
    struct NotFound;

    #[derive(Debug, Error)]
    #[error("server error")]
    struct ServerError;

    #[test]
    fn test_fallback_receives_args_and_error() {
        let fb = Fallback::new(|id: &String, err: &(dyn StdError + 'static)| {
            format!("{}:{}", id, err)
        });
        let out: Option<String> = fb.apply("r", &"tt1".to_string(), &NotFound).unwrap();
        assert_eq!(out.as_deref(), Some("tt1:not found"));
    }

    #[test]
    fn test_typed_fallback_skips_other_errors() {
        let fb = Fallback::on_error(|id: &String, _: &NotFound| format!("default-{}", id));
        let hit: Option<String> = fb.apply("r", &"a".to_string(), &NotFound).unwrap();
        assert_eq!(hit.as_deref(), Some("default-a"));

        let miss: Option<String> = fb.apply("r", &"a".to_string(), &ServerError).unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn test_signature_mismatch_is_a_configuration_error() {
        let fb = Fallback::new(|_: &String, _: &(dyn StdError + 'static)| 1u32);

        let wrong_output = fb.apply::<String, String>("r", &"a".to_string(), &NotFound);
        assert!(matches!(
            wrong_output,
            Err(ConfigurationError::FallbackSignature { .. })
        ));

        let wrong_args = fb.apply::<u64, u32>("r", &7u64, &NotFound);
        assert!(matches!(
            wrong_args,
            Err(ConfigurationError::FallbackSignature { .. })
        ));
    }
}
