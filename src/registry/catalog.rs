//! Named building blocks for file-based configuration.
//!
//! Error types, result predicates and fallbacks are code; a TOML file can
//! only refer to them by name. The application registers them here before
//! the configuration is turned into specs.

use std::collections::HashMap;

use crate::error::ConfigurationError;
use crate::resilience::classifier::{ErrorMatcher, ResultPredicate};
use crate::resilience::fallback::Fallback;

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    errors: HashMap<String, ErrorMatcher>,
    results: HashMap<String, ResultPredicate>,
    fallbacks: HashMap<String, Fallback>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error(mut self, name: impl Into<String>, matcher: ErrorMatcher) -> Self {
        self.errors.insert(name.into(), matcher);
        self
    }

    pub fn with_result(mut self, name: impl Into<String>, predicate: ResultPredicate) -> Self {
        self.results.insert(name.into(), predicate);
        self
    }

    pub fn with_fallback(mut self, name: impl Into<String>, fallback: Fallback) -> Self {
        self.fallbacks.insert(name.into(), fallback);
        self
    }

    pub fn error(&self, name: &str) -> Option<&ErrorMatcher> {
        self.errors.get(name)
    }

    pub fn result(&self, name: &str) -> Option<&ResultPredicate> {
        self.results.get(name)
    }

    pub fn fallback(&self, name: &str) -> Option<&Fallback> {
        self.fallbacks.get(name)
    }

    /// Union of the named matchers; `None` for an empty list.
    pub fn resolve_errors(
        &self,
        instance: &str,
        names: &[String],
    ) -> Result<Option<ErrorMatcher>, ConfigurationError> {
        let mut resolved: Option<ErrorMatcher> = None;
        for name in names {
            let matcher = self
                .error(name)
                .cloned()
                .ok_or_else(|| unknown("error", name, instance))?;
            resolved = Some(match resolved {
                Some(acc) => acc.or(matcher),
                None => matcher,
            });
        }
        Ok(resolved)
    }

    pub fn resolve_result(
        &self,
        instance: &str,
        name: Option<&str>,
    ) -> Result<Option<ResultPredicate>, ConfigurationError> {
        name.map(|n| {
            self.result(n)
                .cloned()
                .ok_or_else(|| unknown("result predicate", n, instance))
        })
        .transpose()
    }

    pub fn resolve_fallback(
        &self,
        instance: &str,
        name: Option<&str>,
    ) -> Result<Option<Fallback>, ConfigurationError> {
        name.map(|n| {
            self.fallback(n)
                .cloned()
                .ok_or_else(|| unknown("fallback", n, instance))
        })
        .transpose()
    }
}

fn unknown(kind: &'static str, name: &str, instance: &str) -> ConfigurationError {
    ConfigurationError::UnknownCatalogEntry {
        kind,
        name: name.to_string(),
        instance: instance.to_string(),
    }
}
