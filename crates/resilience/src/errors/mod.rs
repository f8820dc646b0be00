//! Error types and failure classification for the resilience engines.
//!
//! This module provides:
//! - [`Failure`]: The error caller operations return, carrying raw response metadata
//! - [`ResilienceError`]: The error enum returned by every engine
//! - [`ErrorClassification`]: The derived view used for retry and failover decisions

mod classify;

pub use classify::{classify, ErrorClassification, ErrorKind, RetryCondition, Severity};

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// A failed upstream call, as reported by a caller-supplied operation.
///
/// The engines never perform I/O themselves; operations describe what went
/// wrong through this type so it can be classified and routed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Failure {
    /// HTTP-style status code, if the upstream answered at all.
    pub status_code: Option<u16>,
    /// Human readable error text.
    pub message: String,
    /// Server supplied retry hint (e.g. a `Retry-After` header).
    pub retry_after: Option<Duration>,
    /// Raw response headers, used for quota tracking.
    pub headers: HashMap<String, String>,
    /// True when the call never reached the upstream (DNS, connect, reset).
    pub network: bool,
}

impl Failure {
    /// A transport-level failure with no response.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            network: true,
            ..Default::default()
        }
    }

    /// A failure carrying an upstream status code.
    pub fn http(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code: Some(status_code),
            message: message.into(),
            ..Default::default()
        }
    }

    /// A failure described only by its message.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_headers<K, V>(mut self, headers: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.headers = headers
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(status) => write!(f, "[{}] {}", status, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for Failure {}

/// Errors returned by the resilience engines.
#[derive(Error, Debug)]
pub enum ResilienceError {
    /// A policy or config object failed validation at construction time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The retry executor gave up, either because attempts ran out or
    /// because the failure was classified as non-retryable.
    #[error("Operation failed after {attempts} attempt(s): {classification}")]
    RetriesExhausted {
        /// Number of attempts made, including the first.
        attempts: u32,
        /// Classification of the last failure.
        classification: ErrorClassification,
    },

    /// The circuit for this boundary is open. The operation was not attempted.
    #[error("Circuit open: {boundary} (retry in {retry_in:?})")]
    CircuitOpen {
        /// The protected call boundary
        boundary: String,
        /// Time left until the breaker admits a trial call
        retry_in: Duration,
    },

    /// The circuit is half-open and its trial call budget is used up.
    #[error("Circuit half-open trial limit reached: {boundary}")]
    HalfOpenSaturated {
        /// The protected call boundary
        boundary: String,
    },

    /// Every registered provider was filtered out before any attempt.
    #[error("No provider available")]
    NoProviderAvailable,

    /// The last provider tried during failover failed.
    #[error("Provider error: {provider} - {failure}")]
    Provider {
        /// The provider that produced the error
        provider: String,
        /// The failure it reported
        failure: Failure,
    },

    /// The upstream kept signalling quota exhaustion after the bounded
    /// retry-after wait.
    #[error("Rate limited: {provider}")]
    RateLimited {
        /// The provider that rate limited the request
        provider: String,
        /// The last retry hint seen, if any
        retry_after: Option<Duration>,
    },

    /// A queued operation was not started before its deadline.
    #[error("Queue timeout: {provider} after {waited:?}")]
    QueueTimeout {
        /// The provider queue the request waited in
        provider: String,
        /// How long the request was allowed to wait
        waited: Duration,
    },

    /// The drain worker dropped a queued request without answering.
    #[error("Queue closed: {provider}")]
    QueueClosed {
        /// The provider queue
        provider: String,
    },

    /// The wrapped operation failed and the engine passed the failure through.
    #[error("Operation failed: {0}")]
    Operation(Failure),
}

impl ResilienceError {
    /// Returns the classification attached to a terminal retry error.
    pub fn classification(&self) -> Option<&ErrorClassification> {
        match self {
            Self::RetriesExhausted { classification, .. } => Some(classification),
            _ => None,
        }
    }

    /// Returns the upstream failure behind this error, if there is one.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Provider { failure, .. } | Self::Operation(failure) => Some(failure),
            _ => None,
        }
    }

    /// True for errors raised without the operation ever running.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. }
                | Self::HalfOpenSaturated { .. }
                | Self::NoProviderAvailable
                | Self::QueueTimeout { .. }
        )
    }

    /// Convert back into a [`Failure`] so one engine can wrap another.
    ///
    /// Upstream failures are returned unchanged. Rate-limit errors become a
    /// 429 carrying the retry hint, an open circuit becomes a 503 carrying
    /// the time left, and everything else becomes a message-only failure.
    pub fn into_failure(self) -> Failure {
        match self {
            Self::Provider { failure, .. } | Self::Operation(failure) => failure,
            Self::RateLimited {
                ref retry_after, ..
            } => {
                let failure = Failure::http(429, self.to_string());
                match retry_after {
                    Some(hint) => failure.with_retry_after(*hint),
                    None => failure,
                }
            }
            Self::CircuitOpen { retry_in, .. } => {
                Failure::http(503, self.to_string()).with_retry_after(retry_in)
            }
            Self::HalfOpenSaturated { .. } => Failure::http(503, self.to_string()),
            other => Failure::message(other.to_string()),
        }
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}
