//! Failure classification.
//!
//! # Responsibilities
//! - Decide whether an error is retryable, ignored, or recorded as a failure
//! - Decide whether a successful value should still be treated as a failure
//!
//! # Design Decisions
//! - Type-based matching walks the `source()` chain, so wrapping an error
//!   does not hide it from its classifier
//! - Predicates are stored as `Arc<dyn Fn>` and shared between specs
//! - "match X unless Y" is one struct, used for both retry and breaker

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

type ErrorFn = Arc<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>;
type ValueFn = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> bool + Send + Sync>;

/// Predicate over an error.
#[derive(Clone)]
pub enum ErrorMatcher {
    Any,
    Nothing,
    /// Matches when the error or one of its sources is the named type.
    Type { type_name: &'static str, check: ErrorFn },
    Predicate(ErrorFn),
    AnyOf(Vec<ErrorMatcher>),
}

impl ErrorMatcher {
    /// Type-based matcher for `E`.
    pub fn of<E>() -> Self
    where
        E: StdError + 'static,
    {
        ErrorMatcher::Type {
            type_name: std::any::type_name::<E>(),
            check: Arc::new(|err: &(dyn StdError + 'static)| {
                source_chain(err).any(|e| e.is::<E>())
            }),
        }
    }

    /// Predicate over the first error of type `E` in the source chain.
    pub fn when<E, F>(predicate: F) -> Self
    where
        E: StdError + 'static,
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        ErrorMatcher::Predicate(Arc::new(move |err: &(dyn StdError + 'static)| {
            source_chain(err)
                .find_map(|e| e.downcast_ref::<E>())
                .is_some_and(&predicate)
        }))
    }

    /// Predicate over the raw error.
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        ErrorMatcher::Predicate(Arc::new(predicate))
    }

    pub fn or(self, other: ErrorMatcher) -> Self {
        match self {
            ErrorMatcher::Nothing => other,
            ErrorMatcher::AnyOf(mut all) => {
                all.push(other);
                ErrorMatcher::AnyOf(all)
            }
            single => ErrorMatcher::AnyOf(vec![single, other]),
        }
    }

    pub fn test(&self, err: &(dyn StdError + 'static)) -> bool {
        match self {
            ErrorMatcher::Any => true,
            ErrorMatcher::Nothing => false,
            ErrorMatcher::Type { check, .. } => check(err),
            ErrorMatcher::Predicate(f) => f(err),
            ErrorMatcher::AnyOf(all) => all.iter().any(|m| m.test(err)),
        }
    }
}

impl fmt::Debug for ErrorMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorMatcher::Any => write!(f, "Any"),
            ErrorMatcher::Nothing => write!(f, "Nothing"),
            ErrorMatcher::Type { type_name, .. } => write!(f, "Type({})", type_name),
            ErrorMatcher::Predicate(_) => write!(f, "Predicate(<fn>)"),
            ErrorMatcher::AnyOf(all) => f.debug_list().entries(all).finish(),
        }
    }
}

fn source_chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |e| (*e).source())
}

/// "match X unless Y".
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    pub matches: ErrorMatcher,
    pub unless: ErrorMatcher,
}

impl FailureClassifier {
    pub fn new(matches: ErrorMatcher) -> Self {
        Self {
            matches,
            unless: ErrorMatcher::Nothing,
        }
    }

    pub fn unless(mut self, unless: ErrorMatcher) -> Self {
        self.unless = unless;
        self
    }

    pub fn test(&self, err: &(dyn StdError + 'static)) -> bool {
        self.matches.test(err) && !self.unless.test(err)
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new(ErrorMatcher::Any)
    }
}

/// Conditional classification of a successful value.
#[derive(Clone)]
pub struct ResultPredicate {
    type_name: &'static str,
    check: ValueFn,
}

impl ResultPredicate {
    /// A value of any type other than `T` never matches.
    pub fn when<T, F>(predicate: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self {
            type_name: std::any::type_name::<T>(),
            check: Arc::new(move |value: &(dyn Any + Send + Sync)| {
                value.downcast_ref::<T>().is_some_and(&predicate)
            }),
        }
    }

    pub fn test<T>(&self, value: &T) -> bool
    where
        T: Any + Send + Sync,
    {
        (self.check)(value)
    }
}

impl fmt::Debug for ResultPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResultPredicate({})", self.type_name)
    }
}

/// What a retry executor should do with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retryable,
    NonRetryable,
    Ignored,
}

/// Ignore wins over retry, matching how both lists are configured.
pub fn classify_for_retry(
    retry_on: &FailureClassifier,
    ignore: &ErrorMatcher,
    err: &(dyn StdError + 'static),
) -> Classification {
    if ignore.test(err) {
        Classification::Ignored
    } else if retry_on.test(err) {
        Classification::Retryable
    } else {
        Classification::NonRetryable
    }
}
