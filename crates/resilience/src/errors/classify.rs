//! Failure classification.
//!
//! Turns a raw [`Failure`] into an [`ErrorClassification`] by walking an
//! ordered list of [`RetryCondition`]s. The first matching condition wins.
//!
//! # Behavior Summary
//!
//! | Kind | Recoverable (route around)? | Severity |
//! |------|-----------------------------|----------|
//! | `Network` | Yes | Medium |
//! | `RateLimit` | Yes | Medium |
//! | `Auth` | No | Critical |
//! | `ClientError` | No | Low |
//! | `ServerError` | Yes | High |
//! | `Unknown` | No | Medium |
//!
//! Whether a failure is *retryable* is decided by the matching condition,
//! not by the kind.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::Failure;

/// Flat failure taxonomy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    RateLimit,
    Auth,
    ClientError,
    ServerError,
    Unknown,
}

impl ErrorKind {
    /// Whether a caller can route around this kind of failure (e.g. via fallback).
    pub fn recoverable(self) -> bool {
        matches!(self, Self::Network | Self::RateLimit | Self::ServerError)
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::ClientError => Severity::Low,
            Self::Network | Self::RateLimit | Self::Unknown => Severity::Medium,
            Self::ServerError => Severity::High,
            Self::Auth => Severity::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::RateLimit => "rate_limit",
            Self::Auth => "auth",
            Self::ClientError => "client_error",
            Self::ServerError => "server_error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure severity, ordered from least to most severe.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Derived view of a single failure. Created fresh per failure and never mutated.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrorClassification {
    pub kind: ErrorKind,
    /// Can the system route around it (e.g. switch provider)?
    pub recoverable: bool,
    /// Should the same call be attempted again?
    pub retryable: bool,
    pub severity: Severity,
    pub status_code: Option<u16>,
    pub message: String,
    /// Retry hint copied from the failure.
    pub retry_after: Option<Duration>,
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(status) => write!(f, "{} error [{}]: {}", self.kind, status, self.message),
            None => write!(f, "{} error: {}", self.kind, self.message),
        }
    }
}

/// One row of a retry policy's classification table.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryCondition {
    pub error_kind: ErrorKind,
    #[serde(default)]
    pub status_codes: BTreeSet<u16>,
    /// Matched case-insensitively against the failure message.
    #[serde(default)]
    pub message_substrings: Vec<String>,
    pub retryable: bool,
}

impl RetryCondition {
    pub fn new(error_kind: ErrorKind, retryable: bool) -> Self {
        Self {
            error_kind,
            status_codes: BTreeSet::new(),
            message_substrings: Vec::new(),
            retryable,
        }
    }

    pub fn with_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.status_codes.extend(codes);
        self
    }

    pub fn with_messages<S: Into<String>>(mut self, needles: impl IntoIterator<Item = S>) -> Self {
        self.message_substrings
            .extend(needles.into_iter().map(Into::into));
        self
    }

    /// Returns true if this condition describes the failure.
    pub fn matches(&self, failure: &Failure) -> bool {
        if let Some(status) = failure.status_code {
            if self.status_codes.contains(&status) {
                return true;
            }
        }

        if self.error_kind == ErrorKind::Network && failure.network {
            return true;
        }

        if self.message_substrings.is_empty() {
            return false;
        }

        let message = failure.message.to_lowercase();
        self.message_substrings
            .iter()
            .any(|needle| !needle.is_empty() && message.contains(&needle.to_lowercase()))
    }
}

/// Classify a failure against an ordered condition table.
///
/// Pure: the same failure and table always produce the same classification.
/// Falls back to `Unknown` / not retryable when nothing matches.
pub fn classify(failure: &Failure, conditions: &[RetryCondition]) -> ErrorClassification {
    let (kind, retryable) = conditions
        .iter()
        .find(|condition| condition.matches(failure))
        .map(|condition| (condition.error_kind, condition.retryable))
        .unwrap_or((ErrorKind::Unknown, false));

    ErrorClassification {
        kind,
        recoverable: kind.recoverable(),
        retryable,
        severity: kind.severity(),
        status_code: failure.status_code,
        message: failure.message.clone(),
        retry_after: failure.retry_after,
    }
}
