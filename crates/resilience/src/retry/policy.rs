//! Retry policy configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::millis;
use crate::errors::{ErrorKind, ResilienceError, RetryCondition};

/// Default number of attempts, including the first.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default first retry delay.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default delay ceiling.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// How the deterministic part of the delay grows between attempts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// `min(base * multiplier^(attempt - 1), max)`
    Exponential {
        #[serde(with = "millis")]
        base: Duration,
        #[serde(with = "millis")]
        max: Duration,
        multiplier: f64,
    },
    /// `min(base * attempt, max)`
    Linear {
        #[serde(with = "millis")]
        base: Duration,
        #[serde(with = "millis")]
        max: Duration,
    },
    /// Always `delay`.
    Fixed {
        #[serde(with = "millis")]
        delay: Duration,
    },
}

impl Backoff {
    pub fn exponential(base: Duration, max: Duration, multiplier: f64) -> Self {
        Self::Exponential {
            base,
            max,
            multiplier,
        }
    }

    pub fn linear(base: Duration, max: Duration) -> Self {
        Self::Linear { base, max }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    pub fn base(&self) -> Duration {
        match self {
            Self::Exponential { base, .. } | Self::Linear { base, .. } => *base,
            Self::Fixed { delay } => *delay,
        }
    }

    pub fn max(&self) -> Duration {
        match self {
            Self::Exponential { max, .. } | Self::Linear { max, .. } => *max,
            Self::Fixed { delay } => *delay,
        }
    }

    fn validate(&self) -> Result<(), ResilienceError> {
        if self.base().is_zero() {
            return Err(ResilienceError::invalid_config(
                "backoff base delay must be positive",
            ));
        }
        if self.max().is_zero() {
            return Err(ResilienceError::invalid_config(
                "backoff max delay must be positive",
            ));
        }
        if self.max() < self.base() {
            return Err(ResilienceError::invalid_config(format!(
                "backoff max delay {:?} is below base delay {:?}",
                self.max(),
                self.base()
            )));
        }
        if let Self::Exponential { multiplier, .. } = self {
            if !multiplier.is_finite() || *multiplier < 1.0 {
                return Err(ResilienceError::invalid_config(format!(
                    "backoff multiplier must be a finite value >= 1, got {}",
                    multiplier
                )));
            }
        }
        Ok(())
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, 2.0)
    }
}

/// Random perturbation applied on top of the backoff delay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Jitter {
    None,
    /// `d * (1 + (r - 0.5) * 2 * factor)`
    Full { factor: f64 },
    /// `d * (1 - factor / 2) + d * factor * r`
    Equal { factor: f64 },
    /// Uniform in `[base, previous * (1 + 2 * factor)]`, clamped to `[base, max]`.
    Decorrelated { factor: f64 },
}

impl Jitter {
    pub fn factor(&self) -> f64 {
        match self {
            Self::None => 0.0,
            Self::Full { factor } | Self::Equal { factor } | Self::Decorrelated { factor } => {
                *factor
            }
        }
    }

    fn validate(&self) -> Result<(), ResilienceError> {
        let factor = self.factor();
        if !(0.0..=1.0).contains(&factor) {
            return Err(ResilienceError::invalid_config(format!(
                "jitter factor must be within [0, 1], got {}",
                factor
            )));
        }
        Ok(())
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Self::Full { factor: 0.1 }
    }
}

/// Immutable retry configuration supplied by the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts including the first. `1` never retries.
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub jitter: Jitter,
    /// Ordered classification table; first match wins.
    pub retry_conditions: Vec<RetryCondition>,
}

impl RetryPolicy {
    /// Create a validated policy using [`default_conditions`](Self::default_conditions).
    pub fn new(max_attempts: u32, backoff: Backoff, jitter: Jitter) -> Result<Self, ResilienceError> {
        let policy = Self {
            max_attempts,
            backoff,
            jitter,
            retry_conditions: Self::default_conditions(),
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Replace the classification table.
    pub fn with_conditions(mut self, conditions: Vec<RetryCondition>) -> Self {
        self.retry_conditions = conditions;
        self
    }

    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_attempts == 0 {
            return Err(ResilienceError::invalid_config(
                "max attempts must be at least 1",
            ));
        }
        self.backoff.validate()?;
        self.jitter.validate()
    }

    /// The stock classification table.
    pub fn default_conditions() -> Vec<RetryCondition> {
        vec![
            RetryCondition::new(ErrorKind::RateLimit, true)
                .with_status_codes([429])
                .with_messages(["rate limit", "too many requests", "quota"]),
            RetryCondition::new(ErrorKind::Auth, false)
                .with_status_codes([401, 403])
                .with_messages(["unauthorized", "forbidden", "api key"]),
            RetryCondition::new(ErrorKind::ServerError, true)
                .with_status_codes([500, 502, 503, 504])
                .with_messages(["internal server error", "service unavailable", "overloaded"]),
            RetryCondition::new(ErrorKind::ClientError, false)
                .with_status_codes([400, 404, 405, 409, 413, 422]),
            RetryCondition::new(ErrorKind::Network, true)
                .with_messages(["timeout", "timed out", "connection", "network"]),
        ]
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
            jitter: Jitter::default(),
            retry_conditions: Self::default_conditions(),
        }
    }
}
