//! Provider registrations, health, requirements and running metrics.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::diagnostics::SkipReason;
use crate::errors::ResilienceError;

/// Health reported by the external health-check collaborator.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Weight used by the router's score.
    pub fn score(self) -> f64 {
        match self {
            Self::Healthy => 1.0,
            Self::Degraded => 0.6,
            Self::Unhealthy => 0.2,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// A registered upstream target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub id: String,
    #[serde(default)]
    pub health_status: HealthStatus,
    #[serde(default)]
    pub latency_ms: u64,
    /// Fraction of failed calls, `0.0..=1.0`.
    #[serde(default)]
    pub error_rate: f64,
    /// Percentage of time the provider was reachable, `0.0..=100.0`.
    #[serde(default = "full_availability")]
    pub availability_pct: f64,
    #[serde(default)]
    pub cost_per_unit: f64,
    /// Failover position. Lower values are tried first.
    pub priority: u32,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Models served by this provider.
    #[serde(default)]
    pub models: BTreeSet<String>,
}

fn full_availability() -> f64 {
    100.0
}

impl Provider {
    /// A healthy provider with zero latency, zero cost and full availability.
    pub fn new(id: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            health_status: HealthStatus::Healthy,
            latency_ms: 0,
            error_rate: 0.0,
            availability_pct: full_availability(),
            cost_per_unit: 0.0,
            priority,
            capabilities: BTreeSet::new(),
            models: BTreeSet::new(),
        }
    }

    pub fn with_health(mut self, health_status: HealthStatus) -> Self {
        self.health_status = health_status;
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_availability_pct(mut self, availability_pct: f64) -> Self {
        self.availability_pct = availability_pct;
        self
    }

    pub fn with_cost_per_unit(mut self, cost_per_unit: f64) -> Self {
        self.cost_per_unit = cost_per_unit;
        self
    }

    pub fn with_capabilities<S: Into<String>>(mut self, caps: impl IntoIterator<Item = S>) -> Self {
        self.capabilities.extend(caps.into_iter().map(Into::into));
        self
    }

    pub fn with_models<S: Into<String>>(mut self, models: impl IntoIterator<Item = S>) -> Self {
        self.models.extend(models.into_iter().map(Into::into));
        self
    }

    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.id.trim().is_empty() {
            return Err(ResilienceError::invalid_config("provider id must not be empty"));
        }
        if !(0.0..=100.0).contains(&self.availability_pct) {
            return Err(ResilienceError::invalid_config(format!(
                "provider '{}' availability must be within 0..=100, got {}",
                self.id, self.availability_pct
            )));
        }
        if !(0.0..=1.0).contains(&self.error_rate) {
            return Err(ResilienceError::invalid_config(format!(
                "provider '{}' error rate must be within 0..=1, got {}",
                self.id, self.error_rate
            )));
        }
        if !self.cost_per_unit.is_finite() || self.cost_per_unit < 0.0 {
            return Err(ResilienceError::invalid_config(format!(
                "provider '{}' cost must be a non-negative number",
                self.id
            )));
        }
        Ok(())
    }

    pub(crate) fn apply_health(&mut self, health: &ProviderHealth) {
        self.health_status = health.health_status;
        self.latency_ms = health.latency_ms;
        self.error_rate = health.error_rate;
        self.availability_pct = health.availability_pct;
    }
}

/// Health sample pushed by the external health checker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    pub health_status: HealthStatus,
    pub latency_ms: u64,
    pub error_rate: f64,
    pub availability_pct: f64,
}

impl ProviderHealth {
    pub(crate) fn validate(&self) -> Result<(), ResilienceError> {
        if !(0.0..=100.0).contains(&self.availability_pct) || !(0.0..=1.0).contains(&self.error_rate)
        {
            return Err(ResilienceError::invalid_config(
                "health sample out of range (availability 0..=100, error rate 0..=1)",
            ));
        }
        Ok(())
    }
}

/// Predicates a provider must satisfy to be considered for a call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderRequirements {
    pub model: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub max_latency_ms: Option<u64>,
    pub max_cost_per_unit: Option<f64>,
}

impl ProviderRequirements {
    pub fn model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Default::default()
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_max_latency_ms(mut self, max_latency_ms: u64) -> Self {
        self.max_latency_ms = Some(max_latency_ms);
        self
    }

    pub fn with_max_cost_per_unit(mut self, max_cost_per_unit: f64) -> Self {
        self.max_cost_per_unit = Some(max_cost_per_unit);
        self
    }

    /// Why `provider` cannot serve a call with these requirements, if it can't.
    pub(crate) fn rejection(&self, provider: &Provider) -> Option<SkipReason> {
        if let Some(model) = &self.model {
            if !provider.models.contains(model) {
                return Some(SkipReason::ModelNotServed {
                    model: model.clone(),
                });
            }
        }

        if let Some(missing) = self
            .capabilities
            .iter()
            .find(|cap| !provider.capabilities.contains(*cap))
        {
            return Some(SkipReason::MissingCapability {
                capability: missing.clone(),
            });
        }

        if let Some(max_ms) = self.max_latency_ms {
            if provider.latency_ms > max_ms {
                return Some(SkipReason::LatencyCeiling {
                    latency_ms: provider.latency_ms,
                    max_ms,
                });
            }
        }

        if let Some(max_cost) = self.max_cost_per_unit {
            if provider.cost_per_unit > max_cost {
                return Some(SkipReason::CostCeiling {
                    cost: provider.cost_per_unit,
                    max_cost,
                });
            }
        }

        None
    }
}

/// Running call counters kept per provider.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProviderMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub last_latency: Option<Duration>,
    pub last_error: Option<String>,
}

impl ProviderMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }

    pub(crate) fn record(&mut self, latency: Duration, error: Option<String>) {
        self.total_requests += 1;
        self.last_latency = Some(latency);
        match error {
            None => self.successful_requests += 1,
            Some(message) => {
                self.failed_requests += 1;
                self.last_error = Some(message);
            }
        }
    }
}
