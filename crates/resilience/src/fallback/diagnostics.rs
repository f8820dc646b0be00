//! Per-call record of which providers were skipped, failed or answered.

use std::fmt;

/// Why a provider was not attempted.
#[derive(Clone, Debug, PartialEq)]
pub enum SkipReason {
    /// Health checker marked the provider unhealthy.
    Unhealthy,

    /// Provider doesn't serve the requested model.
    ModelNotServed { model: String },

    /// Provider lacks a required capability.
    MissingCapability { capability: String },

    /// Provider latency exceeds the requested ceiling.
    LatencyCeiling { latency_ms: u64, max_ms: u64 },

    /// Provider cost exceeds the requested ceiling.
    CostCeiling { cost: f64, max_cost: f64 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::ModelNotServed { model } => write!(f, "model '{}' not served", model),
            Self::MissingCapability { capability } => {
                write!(f, "missing capability '{}'", capability)
            }
            Self::LatencyCeiling { latency_ms, max_ms } => {
                write!(f, "latency {}ms over {}ms", latency_ms, max_ms)
            }
            Self::CostCeiling { cost, max_cost } => write!(f, "cost {} over {}", cost, max_cost),
        }
    }
}

/// Record of a single provider considered during a call.
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderAttempt {
    pub provider_id: String,
    pub skipped: Option<SkipReason>,
    pub error: Option<String>,
    pub success: bool,
}

/// Detailed trace of a failover call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FallbackDiagnostics {
    pub attempts: Vec<ProviderAttempt>,
}

impl FallbackDiagnostics {
    pub fn new() -> Self {
        Self {
            attempts: Vec::new(),
        }
    }

    pub fn record_skip(&mut self, provider_id: &str, reason: SkipReason) {
        self.attempts.push(ProviderAttempt {
            provider_id: provider_id.to_string(),
            skipped: Some(reason),
            error: None,
            success: false,
        });
    }

    pub fn record_error(&mut self, provider_id: &str, error: String) {
        self.attempts.push(ProviderAttempt {
            provider_id: provider_id.to_string(),
            skipped: None,
            error: Some(error),
            success: false,
        });
    }

    pub fn record_success(&mut self, provider_id: &str) {
        self.attempts.push(ProviderAttempt {
            provider_id: provider_id.to_string(),
            skipped: None,
            error: None,
            success: true,
        });
    }

    /// Summary for logging/debugging.
    pub fn summary(&self) -> String {
        self.attempts
            .iter()
            .map(|a| {
                if a.success {
                    format!("{}: SUCCESS", a.provider_id)
                } else if let Some(skip) = &a.skipped {
                    format!("{}: SKIPPED ({})", a.provider_id, skip)
                } else if let Some(err) = &a.error {
                    format!("{}: ERROR ({})", a.provider_id, err)
                } else {
                    format!("{}: UNKNOWN", a.provider_id)
                }
            })
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    pub fn has_success(&self) -> bool {
        self.attempts.iter().any(|a| a.success)
    }

    /// Providers that were actually called, in call order.
    pub fn attempted(&self) -> Vec<&str> {
        self.attempts
            .iter()
            .filter(|a| a.skipped.is_none())
            .map(|a| a.provider_id.as_str())
            .collect()
    }

    pub fn skip_reasons(&self) -> Vec<(&str, &SkipReason)> {
        self.attempts
            .iter()
            .filter_map(|a| a.skipped.as_ref().map(|s| (a.provider_id.as_str(), s)))
            .collect()
    }

    pub fn errors(&self) -> Vec<(&str, &str)> {
        self.attempts
            .iter()
            .filter_map(|a| {
                a.error
                    .as_ref()
                    .map(|e| (a.provider_id.as_str(), e.as_str()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_summary() {
        let mut diag = FallbackDiagnostics::new();
        diag.record_skip("groq", SkipReason::Unhealthy);
        diag.record_error("openai", "[503] unavailable".to_string());
        diag.record_success("anthropic");

        assert_eq!(
            diag.summary(),
            "groq: SKIPPED (unhealthy) -> openai: ERROR ([503] unavailable) -> anthropic: SUCCESS"
        );
        assert_eq!(diag.attempted(), vec!["openai", "anthropic"]);
    }

    #[test]
    fn test_has_success() {
        let mut diag = FallbackDiagnostics::new();
        diag.record_error("a", "down".to_string());
        assert!(!diag.has_success());

        diag.record_success("b");
        assert!(diag.has_success());
        assert_eq!(diag.errors(), vec![("a", "down")]);
    }

    #[test]
    fn test_skip_reasons() {
        let mut diag = FallbackDiagnostics::new();
        diag.record_skip("a", SkipReason::Unhealthy);
        diag.record_skip(
            "b",
            SkipReason::MissingCapability {
                capability: "vision".to_string(),
            },
        );
        diag.record_success("c");

        assert_eq!(diag.skip_reasons().len(), 2);
    }
}
