//! Provider selection and ordered failover.
//!
//! The router keeps a registration-ordered list of upstream providers whose
//! health fields are refreshed from outside (see
//! [`FallbackRouter::update_health`]). It answers two questions:
//!
//! - Which provider is the best fit right now? ([`FallbackRouter::select_best_provider`],
//!   weighted score, see [`score`])
//! - Which provider answers this call? ([`FallbackRouter::execute_with_fallback`],
//!   ascending priority, first success wins)

mod diagnostics;
mod provider;
mod router;
mod scoring;

pub use diagnostics::{FallbackDiagnostics, ProviderAttempt, SkipReason};
pub use provider::{
    HealthStatus, Provider, ProviderHealth, ProviderMetrics, ProviderRequirements,
};
pub use router::FallbackRouter;
pub use scoring::{score, RouterConfig};
