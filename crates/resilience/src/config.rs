//! Aggregate configuration for the four engines.
//!
//! Every engine config derives serde so a whole setup can be loaded from one
//! JSON document. Durations are written as integer milliseconds.

use serde::{Deserialize, Serialize};

use crate::circuit::CircuitBreakerConfig;
use crate::errors::ResilienceError;
use crate::fallback::RouterConfig;
use crate::ratelimit::RateLimiterConfig;
use crate::retry::RetryPolicy;

/// Serde helper writing a [`std::time::Duration`] as whole milliseconds.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Configuration for a complete resilience setup.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResilienceConfig {
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    pub router: RouterConfig,
    pub rate_limiter: RateLimiterConfig,
}

impl ResilienceConfig {
    /// Parse and validate a JSON document. Missing sections take their defaults;
    /// malformed or out-of-range values are rejected.
    pub fn from_json_str(json: &str) -> Result<Self, ResilienceError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ResilienceError::invalid_config(format!("malformed config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ResilienceError> {
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.router.validate()?;
        self.rate_limiter.validate()
    }

    pub fn to_json_string(&self) -> Result<String, ResilienceError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ResilienceError::invalid_config(format!("unserializable config: {}", e)))
    }
}
