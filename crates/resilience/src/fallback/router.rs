//! Provider router with ordered failover.

use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};

use log::{debug, info, warn};

use super::diagnostics::{FallbackDiagnostics, SkipReason};
use super::provider::{HealthStatus, Provider, ProviderHealth, ProviderMetrics, ProviderRequirements};
use super::scoring::{score, RouterConfig};
use crate::errors::{Failure, ResilienceError};
use crate::runtime::{lock_or_recover, until, Clock, SystemClock};

/// Scores closer than this are treated as equal.
const SCORE_EPSILON: f64 = 1e-9;

/// A provider plus its own metrics lock.
struct Registration {
    provider: Mutex<Provider>,
    metrics: Mutex<ProviderMetrics>,
}

impl Registration {
    fn snapshot(&self) -> Provider {
        lock_or_recover(&self.provider, "Provider").clone()
    }
}

/// Router over a set of registered providers.
///
/// Registration order is kept and used as the final tie-breaker. Each
/// provider's metrics live behind their own lock, so concurrent calls to
/// different providers never contend.
pub struct FallbackRouter {
    config: RouterConfig,
    clock: Arc<dyn Clock>,
    registrations: RwLock<Vec<Arc<Registration>>>,
}

impl FallbackRouter {
    pub fn new(config: RouterConfig) -> Result<Self, ResilienceError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RouterConfig, clock: Arc<dyn Clock>) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            registrations: RwLock::new(Vec::new()),
        })
    }

    fn registrations(&self) -> Vec<Arc<Registration>> {
        match self.registrations.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => {
                warn!("Provider list lock was poisoned, recovering");
                poisoned.into_inner().clone()
            }
        }
    }

    fn find(&self, provider_id: &str) -> Option<Arc<Registration>> {
        self.registrations()
            .into_iter()
            .find(|reg| lock_or_recover(&reg.provider, "Provider").id == provider_id)
    }

    fn write_registrations(&self) -> RwLockWriteGuard<'_, Vec<Arc<Registration>>> {
        match self.registrations.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Provider list lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Register a provider, or replace the registration with the same id in
    /// place (keeping its position and metrics).
    pub fn register(&self, provider: Provider) -> Result<(), ResilienceError> {
        provider.validate()?;

        // Lookup and insert under one write guard so ids stay unique.
        let mut list = self.write_registrations();
        let existing = list
            .iter()
            .find(|reg| lock_or_recover(&reg.provider, "Provider").id == provider.id);
        if let Some(existing) = existing {
            debug!("Replacing provider '{}'", provider.id);
            *lock_or_recover(&existing.provider, "Provider") = provider;
            return Ok(());
        }

        info!(
            "Registering provider '{}' with priority {}",
            provider.id, provider.priority
        );
        list.push(Arc::new(Registration {
            provider: Mutex::new(provider),
            metrics: Mutex::new(ProviderMetrics::default()),
        }));
        Ok(())
    }

    /// Remove a provider. Returns whether it was registered.
    pub fn unregister(&self, provider_id: &str) -> bool {
        let mut list = self.write_registrations();
        let before = list.len();
        list.retain(|reg| lock_or_recover(&reg.provider, "Provider").id != provider_id);
        before != list.len()
    }

    /// Apply a health sample from the external health checker.
    ///
    /// Returns `Ok(false)` when the provider is not registered.
    pub fn update_health(
        &self,
        provider_id: &str,
        health: ProviderHealth,
    ) -> Result<bool, ResilienceError> {
        health.validate()?;
        let Some(registration) = self.find(provider_id) else {
            return Ok(false);
        };

        let mut provider = lock_or_recover(&registration.provider, "Provider");
        if provider.health_status != health.health_status {
            info!(
                "Provider '{}' health changed: {} -> {}",
                provider_id, provider.health_status, health.health_status
            );
        }
        provider.apply_health(&health);
        Ok(true)
    }

    /// Registered providers in registration order.
    pub fn providers(&self) -> Vec<Provider> {
        self.registrations()
            .iter()
            .map(|reg| reg.snapshot())
            .collect()
    }

    pub fn metrics(&self, provider_id: &str) -> Option<ProviderMetrics> {
        self.find(provider_id)
            .map(|reg| lock_or_recover(&reg.metrics, "Provider metrics").clone())
    }

    /// Split registrations into eligible ones (registration order) and the
    /// reasons the others were filtered out.
    fn eligible(
        &self,
        requirements: Option<&ProviderRequirements>,
    ) -> (Vec<(Arc<Registration>, Provider)>, Vec<(String, SkipReason)>) {
        let mut eligible = Vec::new();
        let mut skipped = Vec::new();

        for registration in self.registrations() {
            let provider = registration.snapshot();
            let rejection = if provider.health_status == HealthStatus::Unhealthy {
                Some(SkipReason::Unhealthy)
            } else {
                requirements.and_then(|req| req.rejection(&provider))
            };

            match rejection {
                Some(reason) => skipped.push((provider.id.clone(), reason)),
                None => eligible.push((registration, provider)),
            }
        }

        (eligible, skipped)
    }

    /// Highest scoring eligible provider.
    ///
    /// Ties go to the lowest priority value, then to the earliest registration.
    pub fn select_best_provider(&self, requirements: Option<&ProviderRequirements>) -> Option<Provider> {
        let (eligible, _) = self.eligible(requirements);

        let mut best: Option<(f64, Provider)> = None;
        for (_, provider) in eligible {
            let candidate = score(&provider, &self.config);
            let better = match &best {
                None => true,
                Some((best_score, best_provider)) => {
                    if (candidate - best_score).abs() <= SCORE_EPSILON {
                        provider.priority < best_provider.priority
                    } else {
                        candidate > *best_score
                    }
                }
            };
            if better {
                best = Some((candidate, provider));
            }
        }

        best.map(|(best_score, provider)| {
            debug!(
                "Selected provider '{}' with score {:.3}",
                provider.id, best_score
            );
            provider
        })
    }

    /// Try eligible providers in ascending priority until one succeeds.
    pub async fn execute_with_fallback<T, F, Fut>(
        &self,
        operation: F,
        requirements: Option<&ProviderRequirements>,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut(Provider) -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let (result, diagnostics) = self
            .execute_with_fallback_diagnosed(operation, requirements)
            .await;
        debug!("Fallback trace: {}", diagnostics.summary());
        result
    }

    /// Like [`execute_with_fallback`](Self::execute_with_fallback), also
    /// returning the per-provider trace.
    pub async fn execute_with_fallback_diagnosed<T, F, Fut>(
        &self,
        mut operation: F,
        requirements: Option<&ProviderRequirements>,
    ) -> (Result<T, ResilienceError>, FallbackDiagnostics)
    where
        F: FnMut(Provider) -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let mut diagnostics = FallbackDiagnostics::new();
        let (mut eligible, skipped) = self.eligible(requirements);
        for (provider_id, reason) in skipped {
            debug!("Skipping provider '{}': {}", provider_id, reason);
            diagnostics.record_skip(&provider_id, reason);
        }

        if eligible.is_empty() {
            warn!("No provider available for request");
            return (Err(ResilienceError::NoProviderAvailable), diagnostics);
        }

        // Stable: equal priorities keep registration order.
        eligible.sort_by_key(|(_, provider)| provider.priority);

        let mut last_error: Option<ResilienceError> = None;

        for (registration, provider) in eligible {
            let provider_id = provider.id.clone();
            debug!("Attempting provider '{}'", provider_id);

            let started = self.clock.now();
            let outcome = operation(provider).await;
            let latency = until(started, self.clock.now());

            match outcome {
                Ok(value) => {
                    lock_or_recover(&registration.metrics, "Provider metrics").record(latency, None);
                    diagnostics.record_success(&provider_id);
                    if last_error.is_some() {
                        info!("Provider '{}' succeeded after failover", provider_id);
                    }
                    return (Ok(value), diagnostics);
                }
                Err(failure) => {
                    let message = failure.to_string();
                    lock_or_recover(&registration.metrics, "Provider metrics")
                        .record(latency, Some(message.clone()));
                    info!(
                        "Provider '{}' failed with {}, trying next provider",
                        provider_id, message
                    );
                    diagnostics.record_error(&provider_id, message);
                    last_error = Some(ResilienceError::Provider {
                        provider: provider_id,
                        failure,
                    });
                }
            }
        }

        warn!("All providers failed: {}", diagnostics.summary());
        (
            Err(last_error.unwrap_or(ResilienceError::NoProviderAvailable)),
            diagnostics,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn router() -> FallbackRouter {
        FallbackRouter::with_clock(RouterConfig::default(), Arc::new(ManualClock::starting_now()))
            .unwrap()
    }

    fn health(status: HealthStatus) -> ProviderHealth {
        ProviderHealth {
            health_status: status,
            latency_ms: 100,
            error_rate: 0.0,
            availability_pct: 100.0,
        }
    }

    #[tokio::test]
    async fn test_failover_in_priority_order() {
        let router = router();
        // Registered out of priority order on purpose.
        router.register(Provider::new("p3", 3)).unwrap();
        router.register(Provider::new("p1", 1)).unwrap();
        router.register(Provider::new("p2", 2)).unwrap();

        let (result, diag) = router
            .execute_with_fallback_diagnosed(
                |provider| async move {
                    if provider.id == "p3" {
                        Ok(provider.id)
                    } else {
                        Err(Failure::http(503, "unavailable"))
                    }
                },
                None,
            )
            .await;

        assert_eq!(result.unwrap(), "p3");
        assert_eq!(diag.attempted(), vec!["p1", "p2", "p3"]);

        for id in ["p1", "p2"] {
            let metrics = router.metrics(id).unwrap();
            assert_eq!(metrics.total_requests, 1);
            assert_eq!(metrics.failed_requests, 1);
            assert_eq!(metrics.successful_requests, 0);
        }
        let metrics = router.metrics("p3").unwrap();
        assert_eq!(metrics.successful_requests, 1);
        assert_eq!(metrics.failed_requests, 0);
    }

    #[tokio::test]
    async fn test_all_fail_returns_last_error() {
        let router = router();
        router.register(Provider::new("a", 1)).unwrap();
        router.register(Provider::new("b", 2)).unwrap();

        let result: Result<(), _> = router
            .execute_with_fallback(
                |provider| async move { Err(Failure::message(format!("{} down", provider.id))) },
                None,
            )
            .await;

        match result {
            Err(ResilienceError::Provider { provider, failure }) => {
                assert_eq!(provider, "b");
                assert_eq!(failure.message, "b down");
            }
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_non_recoverable_failure_still_fails_over() {
        let router = router();
        router.register(Provider::new("a", 1)).unwrap();
        router.register(Provider::new("b", 2)).unwrap();

        let result = router
            .execute_with_fallback(
                |provider| async move {
                    if provider.id == "a" {
                        Err(Failure::http(401, "unauthorized"))
                    } else {
                        Ok(provider.id)
                    }
                },
                None,
            )
            .await;

        assert_eq!(result.unwrap(), "b");
        assert_eq!(router.metrics("a").unwrap().failed_requests, 1);
    }

    #[tokio::test]
    async fn test_first_success_stops_iteration() {
        let router = router();
        router.register(Provider::new("a", 1)).unwrap();
        router.register(Provider::new("b", 2)).unwrap();

        let calls = AtomicU32::new(0);
        let result = router
            .execute_with_fallback(
                |provider| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok::<_, Failure>(provider.id) }
                },
                None,
            )
            .await;

        assert_eq!(result.unwrap(), "a");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(router.metrics("b").unwrap().total_requests, 0);
    }

    #[tokio::test]
    async fn test_no_provider_available() {
        let router = router();
        router
            .register(Provider::new("a", 1).with_health(HealthStatus::Unhealthy))
            .unwrap();

        let (result, diag): (Result<(), _>, _) = router
            .execute_with_fallback_diagnosed(|_| async { Ok(()) }, None)
            .await;

        assert!(matches!(result, Err(ResilienceError::NoProviderAvailable)));
        assert_eq!(diag.skip_reasons(), vec![("a", &SkipReason::Unhealthy)]);
        assert!(router.select_best_provider(None).is_none());
    }

    #[test]
    fn test_select_best_by_score() {
        let router = router();
        router
            .register(Provider::new("slow", 1).with_latency_ms(900))
            .unwrap();
        router
            .register(Provider::new("fast", 2).with_latency_ms(50))
            .unwrap();

        let best = router.select_best_provider(None).unwrap();
        assert_eq!(best.id, "fast");
    }

    #[test]
    fn test_select_tie_breaks_on_priority_then_registration() {
        let router = router();
        router.register(Provider::new("first", 1)).unwrap();
        router.register(Provider::new("second", 1)).unwrap();
        assert_eq!(router.select_best_provider(None).unwrap().id, "first");

        // Priorities 0 and 1 both score as 1, so this is a tie on score.
        let router = FallbackRouter::new(RouterConfig::default()).unwrap();
        router.register(Provider::new("one", 1)).unwrap();
        router.register(Provider::new("zero", 0)).unwrap();
        assert_eq!(router.select_best_provider(None).unwrap().id, "zero");
    }

    #[test]
    fn test_requirements_filter_selection() {
        let router = router();
        router
            .register(Provider::new("cheap", 1).with_capabilities(["chat"]))
            .unwrap();
        router
            .register(Provider::new("vision", 2).with_capabilities(["chat", "vision"]))
            .unwrap();

        let req = ProviderRequirements::default().with_capability("vision");
        assert_eq!(router.select_best_provider(Some(&req)).unwrap().id, "vision");
    }

    #[test]
    fn test_update_health_excludes_unhealthy() {
        let router = router();
        router.register(Provider::new("a", 1)).unwrap();
        router.register(Provider::new("b", 2)).unwrap();

        assert!(router
            .update_health("a", health(HealthStatus::Unhealthy))
            .unwrap());
        assert!(!router
            .update_health("missing", health(HealthStatus::Healthy))
            .unwrap());

        assert_eq!(router.select_best_provider(None).unwrap().id, "b");
        assert_eq!(router.providers()[0].latency_ms, 100);
    }

    #[test]
    fn test_register_replaces_in_place() {
        let router = router();
        router.register(Provider::new("a", 1)).unwrap();
        router.register(Provider::new("b", 2)).unwrap();
        router
            .register(Provider::new("a", 5).with_cost_per_unit(0.05))
            .unwrap();

        let providers = router.providers();
        assert_eq!(providers.len(), 2);
        assert_eq!(providers[0].id, "a");
        assert_eq!(providers[0].priority, 5);

        assert!(router.unregister("a"));
        assert_eq!(router.providers().len(), 1);
    }

    #[test]
    fn test_concurrent_register_keeps_ids_unique() {
        let router = router();

        std::thread::scope(|scope| {
            for priority in 1..=8 {
                let router = &router;
                scope.spawn(move || router.register(Provider::new("dup", priority)).unwrap());
            }
        });

        assert_eq!(router.providers().len(), 1);
    }

    #[tokio::test]
    async fn test_latency_is_recorded_with_clock() {
        let clock = Arc::new(ManualClock::starting_now());
        let router = FallbackRouter::with_clock(RouterConfig::default(), clock.clone()).unwrap();
        router.register(Provider::new("a", 1)).unwrap();

        let result = router
            .execute_with_fallback(
                |_| {
                    let clock = clock.clone();
                    async move {
                        clock.advance(Duration::from_millis(40));
                        Ok::<_, Failure>(())
                    }
                },
                None,
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(
            router.metrics("a").unwrap().last_latency,
            Some(Duration::from_millis(40))
        );
    }
}
