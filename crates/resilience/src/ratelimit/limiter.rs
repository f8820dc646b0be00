//! Adaptive per-provider rate limiter.
//!
//! Tracks each provider's quota window from response headers and slows calls
//! down as the quota runs out. Rate-limit responses raise an adaptive
//! multiplier; successes lower it again (multiplicative increase/decrease).

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::headers::{parse_headers, HeaderFormat};
use super::queue::ProviderQueue;
use super::window::RateLimitWindow;
use crate::config::millis;
use crate::errors::{Failure, ResilienceError};
use crate::runtime::{saturating_after, until, Clock, Sleeper, SystemClock, TokioSleeper};

/// Default remaining-quota fraction below which calls are slowed down.
const DEFAULT_THROTTLE_THRESHOLD: f64 = 0.2;

/// Default delay at full throttle with a multiplier of 1.
const DEFAULT_THROTTLE_BASE_DELAY: Duration = Duration::from_millis(1000);

const DEFAULT_MAX_MULTIPLIER: f64 = 5.0;
const DEFAULT_MIN_MULTIPLIER: f64 = 0.1;
const DEFAULT_INCREASE_FACTOR: f64 = 1.5;
const DEFAULT_DECREASE_FACTOR: f64 = 0.9;

/// Default number of retry-after waits inside one call.
const DEFAULT_MAX_RETRY_AFTER_ATTEMPTS: u32 = 1;

/// Rate limiter configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimiterConfig {
    /// Remaining-quota fraction below which throttling starts.
    pub throttle_threshold: f64,
    #[serde(with = "millis")]
    pub throttle_base_delay: Duration,
    pub max_multiplier: f64,
    pub min_multiplier: f64,
    /// Applied to the multiplier on every rate-limit response.
    pub increase_factor: f64,
    /// Applied to the multiplier on every success.
    pub decrease_factor: f64,
    /// Retry-after waits allowed inside one `execute_with_rate_limit` call.
    pub max_retry_after_attempts: u32,
}

impl RateLimiterConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if !(0.0..=1.0).contains(&self.throttle_threshold) {
            return Err(ResilienceError::invalid_config(
                "throttle threshold must be within 0..=1",
            ));
        }
        if !(self.min_multiplier.is_finite() && self.min_multiplier > 0.0) {
            return Err(ResilienceError::invalid_config(
                "minimum multiplier must be positive",
            ));
        }
        if !(self.max_multiplier.is_finite() && self.max_multiplier >= self.min_multiplier) {
            return Err(ResilienceError::invalid_config(
                "maximum multiplier must be at least the minimum multiplier",
            ));
        }
        if !(self.increase_factor.is_finite() && self.increase_factor >= 1.0) {
            return Err(ResilienceError::invalid_config(
                "multiplier increase factor must be at least 1",
            ));
        }
        if !(self.decrease_factor > 0.0 && self.decrease_factor <= 1.0) {
            return Err(ResilienceError::invalid_config(
                "multiplier decrease factor must be within (0, 1]",
            ));
        }
        Ok(())
    }

    fn initial_multiplier(&self) -> f64 {
        1.0_f64.clamp(self.min_multiplier, self.max_multiplier)
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            throttle_threshold: DEFAULT_THROTTLE_THRESHOLD,
            throttle_base_delay: DEFAULT_THROTTLE_BASE_DELAY,
            max_multiplier: DEFAULT_MAX_MULTIPLIER,
            min_multiplier: DEFAULT_MIN_MULTIPLIER,
            increase_factor: DEFAULT_INCREASE_FACTOR,
            decrease_factor: DEFAULT_DECREASE_FACTOR,
            max_retry_after_attempts: DEFAULT_MAX_RETRY_AFTER_ATTEMPTS,
        }
    }
}

/// Snapshot of one provider's limiter state.
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitStatus {
    pub provider: String,
    pub format: HeaderFormat,
    pub window: Option<RateLimitWindow>,
    pub multiplier: f64,
    /// Set by a retry-after hint; no call is dispatched before it.
    pub blocked_until: Option<DateTime<Utc>>,
    pub rate_limit_hits: u64,
    pub queued: usize,
}

/// Mutable limiter state for one provider.
#[derive(Debug)]
struct ProviderLimits {
    format: HeaderFormat,
    window: Option<RateLimitWindow>,
    multiplier: f64,
    blocked_until: Option<DateTime<Utc>>,
    rate_limit_hits: u64,
}

impl ProviderLimits {
    fn new(config: &RateLimiterConfig) -> Self {
        Self {
            format: HeaderFormat::Auto,
            window: None,
            multiplier: config.initial_multiplier(),
            blocked_until: None,
            rate_limit_hits: 0,
        }
    }
}

/// Returns true if the failure signals quota exhaustion.
pub fn is_rate_limit_failure(failure: &Failure) -> bool {
    if failure.status_code == Some(429) {
        return true;
    }
    let message = failure.message.to_lowercase();
    message.contains("rate limit") || message.contains("too many requests")
}

/// Adaptive rate limiter keyed by provider id.
///
/// State for a provider is created on first use and kept until
/// [`forget`](Self::forget). Each provider's entry is locked independently.
pub struct RateLimiter {
    pub(super) config: RateLimiterConfig,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) sleeper: Arc<dyn Sleeper>,
    limits: DashMap<String, ProviderLimits>,
    pub(super) queues: DashMap<String, Arc<ProviderQueue>>,
    pub(super) sequence: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Result<Self, ResilienceError> {
        Self::with_runtime(config, Arc::new(SystemClock), Arc::new(TokioSleeper))
    }

    pub fn with_runtime(
        config: RateLimiterConfig,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            sleeper,
            limits: DashMap::new(),
            queues: DashMap::new(),
            sequence: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Run `f` against the provider's state, creating it if needed.
    fn with_limits<R>(&self, provider: &str, f: impl FnOnce(&mut ProviderLimits) -> R) -> R {
        let mut entry = self
            .limits
            .entry(provider.to_string())
            .or_insert_with(|| ProviderLimits::new(&self.config));
        f(entry.value_mut())
    }

    /// Pin the header convention used for a provider.
    pub fn set_header_format(&self, provider: &str, format: HeaderFormat) {
        self.with_limits(provider, |limits| limits.format = format);
    }

    /// Parse quota headers from an upstream response.
    ///
    /// Headers in an unknown format are ignored.
    pub fn record_limit_headers(&self, provider: &str, headers: &HashMap<String, String>) {
        let now = self.clock.now();
        self.with_limits(provider, |limits| {
            let parsed = parse_headers(limits.format, headers, now);
            if parsed.is_empty() {
                debug!(
                    "Rate limiter: no recognised quota headers for '{}'",
                    provider
                );
                return;
            }

            if let Some(quota) = parsed.quota {
                match limits.window.as_mut() {
                    Some(window) => window.observe(&quota, now),
                    None => limits.window = Some(RateLimitWindow::from_headers(&quota, now)),
                }
                debug!(
                    "Rate limiter: '{}' quota {}/{} ({:?})",
                    provider, quota.remaining, quota.limit, quota.format
                );
            }

            if let Some(wait) = parsed.retry_after {
                block(limits, now, wait);
            }
        });
    }

    /// Time to wait before the next call to `provider` may be dispatched.
    pub fn compute_delay(&self, provider: &str) -> Duration {
        let now = self.clock.now();
        let Some(mut entry) = self.limits.get_mut(provider) else {
            return Duration::ZERO;
        };
        let limits = entry.value_mut();

        let blocked = limits
            .blocked_until
            .map(|at| until(now, at))
            .unwrap_or(Duration::ZERO);

        let throttled = match limits.window.as_mut() {
            None => Duration::ZERO,
            Some(window) => {
                window.refresh(now);
                if window.remaining == 0 {
                    window.time_until_reset(now)
                } else if window.remaining_ratio() < self.config.throttle_threshold {
                    let pressure = 1.0 - window.remaining_ratio();
                    let ms = self.config.throttle_base_delay.as_millis() as f64
                        * pressure
                        * limits.multiplier;
                    Duration::from_millis(ms.max(0.0).round() as u64)
                } else {
                    Duration::ZERO
                }
            }
        };

        blocked.max(throttled)
    }

    fn consume(&self, provider: &str) {
        let now = self.clock.now();
        self.with_limits(provider, |limits| {
            if let Some(window) = limits.window.as_mut() {
                window.consume(now);
            }
        });
    }

    fn on_success(&self, provider: &str) {
        let config = &self.config;
        self.with_limits(provider, |limits| {
            limits.multiplier = (limits.multiplier * config.decrease_factor).max(config.min_multiplier);
        });
    }

    fn on_rate_limited(&self, provider: &str) {
        let config = &self.config;
        self.with_limits(provider, |limits| {
            limits.rate_limit_hits += 1;
            let raised = limits.multiplier * config.increase_factor;
            if raised >= config.max_multiplier {
                if limits.multiplier < config.max_multiplier {
                    warn!(
                        "Rate limiter: multiplier for '{}' saturated at {}",
                        provider, config.max_multiplier
                    );
                }
                limits.multiplier = config.max_multiplier;
            } else {
                limits.multiplier = raised;
            }
        });
    }

    fn block_for(&self, provider: &str, wait: Duration) {
        let now = self.clock.now();
        self.with_limits(provider, |limits| block(limits, now, wait));
    }

    /// Run `operation` once the provider's delay has passed.
    ///
    /// A rate-limit failure raises the adaptive multiplier. If it carries a
    /// retry hint and the retry budget allows, the call waits and runs again;
    /// otherwise it fails with [`ResilienceError::RateLimited`]. Other
    /// failures pass through as [`ResilienceError::Operation`].
    pub async fn execute_with_rate_limit<T, F, Fut>(
        &self,
        provider: &str,
        operation: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        self.run_limited(provider, operation, true).await
    }

    /// The retry-after loop. The queue worker has already waited out the
    /// provider delay before the first attempt, so it passes `wait_first = false`.
    pub(super) async fn run_limited<T, F, Fut>(
        &self,
        provider: &str,
        mut operation: F,
        mut wait_first: bool,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let mut retries = 0u32;

        loop {
            if wait_first {
                let delay = self.compute_delay(provider);
                if !delay.is_zero() {
                    debug!(
                        "Rate limiter: waiting {:?} for provider '{}'",
                        delay, provider
                    );
                    self.sleeper.sleep(delay).await;
                }
            }
            wait_first = true;

            self.consume(provider);

            let failure = match operation().await {
                Ok(value) => {
                    self.on_success(provider);
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            if !failure.headers.is_empty() {
                self.record_limit_headers(provider, &failure.headers);
            }

            if !is_rate_limit_failure(&failure) {
                return Err(ResilienceError::Operation(failure));
            }

            self.on_rate_limited(provider);

            let hint = failure.retry_after.or_else(|| {
                // A retry-after header was folded into blocked_until above.
                let delay = self.compute_delay(provider);
                (!delay.is_zero()).then_some(delay)
            });

            match hint {
                Some(wait) if retries < self.config.max_retry_after_attempts => {
                    retries += 1;
                    info!(
                        "Rate limiter: '{}' rate limited, retrying after {:?} ({}/{})",
                        provider, wait, retries, self.config.max_retry_after_attempts
                    );
                    self.block_for(provider, wait);
                }
                _ => {
                    warn!("Rate limiter: '{}' still rate limited, giving up", provider);
                    return Err(ResilienceError::RateLimited {
                        provider: provider.to_string(),
                        retry_after: hint,
                    });
                }
            }
        }
    }

    pub fn status(&self, provider: &str) -> RateLimitStatus {
        let queued = self.queue_len(provider);
        let now = self.clock.now();

        match self.limits.get_mut(provider) {
            Some(mut entry) => {
                let limits = entry.value_mut();
                if let Some(window) = limits.window.as_mut() {
                    window.refresh(now);
                }
                RateLimitStatus {
                    provider: provider.to_string(),
                    format: limits.format,
                    window: limits.window.clone(),
                    multiplier: limits.multiplier,
                    blocked_until: limits.blocked_until.filter(|at| *at > now),
                    rate_limit_hits: limits.rate_limit_hits,
                    queued,
                }
            }
            None => RateLimitStatus {
                provider: provider.to_string(),
                format: HeaderFormat::Auto,
                window: None,
                multiplier: self.config.initial_multiplier(),
                blocked_until: None,
                rate_limit_hits: 0,
                queued,
            },
        }
    }

    /// Drop all tracked state for a provider.
    ///
    /// A queue whose drain task is still running is kept, so later calls
    /// join the same heap; forget again once it has drained.
    pub fn forget(&self, provider: &str) -> bool {
        let had_limits = self.limits.remove(provider).is_some();
        let had_queue = self
            .queues
            .remove_if(provider, |_, queue| !queue.is_draining())
            .is_some();
        if had_limits || had_queue {
            debug!("Rate limiter: forgot provider '{}'", provider);
        }
        had_limits || had_queue
    }
}

fn block(limits: &mut ProviderLimits, now: DateTime<Utc>, wait: Duration) {
    let until_at = saturating_after(now, wait);
    limits.blocked_until = Some(match limits.blocked_until {
        Some(existing) if existing > until_at => existing,
        _ => until_at,
    });
}
