//! Weighted provider score.

use serde::{Deserialize, Serialize};

use super::provider::Provider;
use crate::errors::ResilienceError;

const HEALTH_WEIGHT: f64 = 0.4;
const PERFORMANCE_WEIGHT: f64 = 0.3;
const COST_WEIGHT: f64 = 0.2;
const PRIORITY_WEIGHT: f64 = 0.1;

/// Default latency treated as "as slow as it gets".
const DEFAULT_LATENCY_CAP_MS: u64 = 1000;

/// Default cost treated as "as expensive as it gets".
const DEFAULT_COST_REFERENCE: f64 = 0.1;

/// Normalisation bounds for scoring.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterConfig {
    pub latency_cap_ms: u64,
    pub cost_reference: f64,
}

impl RouterConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.latency_cap_ms == 0 {
            return Err(ResilienceError::invalid_config(
                "router latency cap must be positive",
            ));
        }
        if !self.cost_reference.is_finite() || self.cost_reference <= 0.0 {
            return Err(ResilienceError::invalid_config(
                "router cost reference must be positive",
            ));
        }
        Ok(())
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            latency_cap_ms: DEFAULT_LATENCY_CAP_MS,
            cost_reference: DEFAULT_COST_REFERENCE,
        }
    }
}

/// Score a provider in `0.0..=1.0`. Higher is better.
///
/// ```text
/// 0.4 * health
/// + 0.3 * (0.5 * latency + 0.5 * availability)
/// + 0.2 * cost
/// + 0.1 * 1 / max(priority, 1)
/// ```
/// where latency and cost are inverted and normalised against the config caps.
pub fn score(provider: &Provider, config: &RouterConfig) -> f64 {
    let cap = config.latency_cap_ms as f64;
    let latency_score = 1.0 - (provider.latency_ms as f64).min(cap) / cap;
    let availability = (provider.availability_pct / 100.0).clamp(0.0, 1.0);
    let cost_score =
        1.0 - provider.cost_per_unit.max(0.0).min(config.cost_reference) / config.cost_reference;
    let priority_score = 1.0 / f64::from(provider.priority.max(1));

    HEALTH_WEIGHT * provider.health_status.score()
        + PERFORMANCE_WEIGHT * (0.5 * latency_score + 0.5 * availability)
        + COST_WEIGHT * cost_score
        + PRIORITY_WEIGHT * priority_score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::HealthStatus;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_perfect_provider_scores_one() {
        let provider = Provider::new("p", 1);
        assert!(approx(score(&provider, &RouterConfig::default()), 1.0));
    }

    #[test]
    fn test_score_components() {
        let provider = Provider::new("p", 2)
            .with_health(HealthStatus::Degraded)
            .with_latency_ms(500)
            .with_availability_pct(90.0)
            .with_cost_per_unit(0.05);

        // 0.4*0.6 + 0.3*(0.5*0.5 + 0.5*0.9) + 0.2*0.5 + 0.1*0.5
        let expected = 0.24 + 0.3 * 0.7 + 0.1 + 0.05;
        assert!(approx(score(&provider, &RouterConfig::default()), expected));
    }

    #[test]
    fn test_latency_and_cost_saturate() {
        let provider = Provider::new("p", 0)
            .with_latency_ms(5_000)
            .with_cost_per_unit(1.0);

        // priority 0 is treated as 1
        let expected = 0.4 + 0.3 * 0.5 + 0.0 + 0.1;
        assert!(approx(score(&provider, &RouterConfig::default()), expected));
    }

    #[test]
    fn test_invalid_router_config() {
        let config = RouterConfig {
            latency_cap_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
