//! Backoff policies for retry waits.
//!
//! `attempt` is the 1-based number of the attempt that just failed, so the
//! first wait is `delay(1)`.

use std::time::Duration;

use rand::Rng;

use crate::error::ConfigurationError;

/// How long to wait before the next attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
    /// Same wait every time.
    Fixed(Duration),
    /// `initial * multiplier^(attempt - 1)`, optionally capped.
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Option<Duration>,
    },
    /// Uniform in `[base * (1 - factor), base * (1 + factor)]`.
    Randomized { base: Duration, factor: f64 },
    /// Exponential growth with the randomized spread applied on top.
    ExponentialRandomized {
        initial: Duration,
        multiplier: f64,
        factor: f64,
        max: Option<Duration>,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Fixed(Duration::from_millis(500))
    }
}

impl BackoffPolicy {
    pub fn fixed(wait: Duration) -> Self {
        BackoffPolicy::Fixed(wait)
    }

    pub fn exponential(initial: Duration, multiplier: f64) -> Self {
        BackoffPolicy::Exponential {
            initial,
            multiplier,
            max: None,
        }
    }

    pub fn randomized(base: Duration, factor: f64) -> Self {
        BackoffPolicy::Randomized { base, factor }
    }

    /// Cap the exponential variants. No effect on the others.
    pub fn with_max(self, cap: Duration) -> Self {
        match self {
            BackoffPolicy::Exponential {
                initial,
                multiplier,
                ..
            } => BackoffPolicy::Exponential {
                initial,
                multiplier,
                max: Some(cap),
            },
            BackoffPolicy::ExponentialRandomized {
                initial,
                multiplier,
                factor,
                ..
            } => BackoffPolicy::ExponentialRandomized {
                initial,
                multiplier,
                factor,
                max: Some(cap),
            },
            other => other,
        }
    }

    /// Calculate the wait after `attempt` failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            BackoffPolicy::Fixed(wait) => wait,
            BackoffPolicy::Exponential {
                initial,
                multiplier,
                max,
            } => exponential_nanos(initial, multiplier, attempt, max),
            BackoffPolicy::Randomized { base, factor } => jitter(base, factor),
            BackoffPolicy::ExponentialRandomized {
                initial,
                multiplier,
                factor,
                max,
            } => {
                let grown = exponential_nanos(initial, multiplier, attempt, None);
                let jittered = jitter(grown, factor);
                match max {
                    Some(cap) => jittered.min(cap),
                    None => jittered,
                }
            }
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigurationError> {
        match *self {
            BackoffPolicy::Fixed(_) => Ok(()),
            BackoffPolicy::Exponential { multiplier, .. } => check_multiplier(multiplier),
            BackoffPolicy::Randomized { factor, .. } => check_factor(factor),
            BackoffPolicy::ExponentialRandomized {
                multiplier, factor, ..
            } => {
                check_multiplier(multiplier)?;
                check_factor(factor)
            }
        }
    }
}

fn exponential_nanos(
    initial: Duration,
    multiplier: f64,
    attempt: u32,
    max: Option<Duration>,
) -> Duration {
    let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
    let nanos = initial.as_nanos() as f64 * multiplier.powi(exponent);
    let capped = match max {
        Some(cap) => nanos.min(cap.as_nanos() as f64),
        None => nanos,
    };
    nanos_to_duration(capped)
}

fn jitter(base: Duration, factor: f64) -> Duration {
    if factor == 0.0 || base.is_zero() {
        return base;
    }
    let nanos = base.as_nanos() as f64;
    let low = nanos * (1.0 - factor);
    let high = nanos * (1.0 + factor);
    let picked = rand::thread_rng().gen_range(low..=high);
    nanos_to_duration(picked)
}

fn nanos_to_duration(nanos: f64) -> Duration {
    if !nanos.is_finite() || nanos >= u64::MAX as f64 {
        Duration::from_nanos(u64::MAX)
    } else {
        Duration::from_nanos(nanos.max(0.0).round() as u64)
    }
}

fn check_multiplier(multiplier: f64) -> Result<(), ConfigurationError> {
    if multiplier.is_finite() && multiplier >= 1.0 {
        Ok(())
    } else {
        Err(ConfigurationError::out_of_range(
            "backoff.multiplier",
            multiplier,
            ">= 1.0",
        ))
    }
}

fn check_factor(factor: f64) -> Result<(), ConfigurationError> {
    if (0.0..1.0).contains(&factor) {
        Ok(())
    } else {
        Err(ConfigurationError::out_of_range(
            "backoff.randomization_factor",
            factor,
            "0.0 <= factor < 1.0",
        ))
    }
}
