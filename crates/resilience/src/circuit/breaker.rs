//! Circuit breaker for a single protected call boundary.
//!
//! Implements the circuit breaker pattern to stop calling a failing
//! dependency for a cooldown period. The circuit has three phases:
//!
//! - **Closed**: Normal operation, calls are allowed through.
//! - **Open**: Dependency is failing, calls are rejected without running.
//! - **HalfOpen**: Testing recovery with a bounded number of trial calls.
//!
//! State is in-memory and lost on restart.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::window::OutcomeWindow;
use crate::config::millis;
use crate::errors::{Failure, ResilienceError};
use crate::runtime::{lock_or_recover, saturating_after, until, Clock, SystemClock};

/// Default number of consecutive failures before opening the circuit.
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default number of consecutive half-open successes needed to close.
const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;

/// Default time to wait before transitioning from Open to HalfOpen.
const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of concurrent half-open trial calls.
const DEFAULT_HALF_OPEN_MAX_CALLS: u32 = 3;

/// Default span of the rolling failure-rate window.
const DEFAULT_MONITORING_WINDOW: Duration = Duration::from_secs(60);

/// Circuit breaker phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    /// Normal operation - calls are allowed.
    Closed,
    /// Dependency is failing - calls are rejected.
    Open,
    /// Testing recovery - limited calls allowed.
    HalfOpen,
}

impl fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (while closed) that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive successes (while half-open) that close the circuit.
    pub success_threshold: u32,
    /// Time the circuit stays open before admitting trial calls.
    #[serde(with = "millis")]
    pub recovery_timeout: Duration,
    /// Trial calls allowed in flight at once while half-open.
    pub half_open_max_calls: u32,
    /// Span of the rolling failure-rate window.
    #[serde(with = "millis")]
    pub monitoring_window: Duration,
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::invalid_config(
                "circuit failure threshold must be at least 1",
            ));
        }
        if self.success_threshold == 0 {
            return Err(ResilienceError::invalid_config(
                "circuit success threshold must be at least 1",
            ));
        }
        if self.half_open_max_calls == 0 {
            return Err(ResilienceError::invalid_config(
                "circuit half-open call limit must be at least 1",
            ));
        }
        if self.recovery_timeout.is_zero() {
            return Err(ResilienceError::invalid_config(
                "circuit recovery timeout must be positive",
            ));
        }
        if self.monitoring_window.is_zero() {
            return Err(ResilienceError::invalid_config(
                "circuit monitoring window must be positive",
            ));
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            half_open_max_calls: DEFAULT_HALF_OPEN_MAX_CALLS,
            monitoring_window: DEFAULT_MONITORING_WINDOW,
        }
    }
}

/// Answer of [`CircuitBreaker::can_execute`].
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionDecision {
    pub allowed: bool,
    /// Why the call was rejected.
    pub reason: Option<String>,
    /// Phase after the check (the check itself may move Open → HalfOpen).
    pub phase: CircuitPhase,
    /// Time left until the breaker admits a trial call, when open.
    pub retry_in: Option<Duration>,
}

/// Read-only view of a breaker.
#[derive(Clone, Debug, PartialEq)]
pub struct CircuitState {
    pub boundary: String,
    pub phase: CircuitPhase,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub next_eligible_retry_time: Option<DateTime<Utc>>,
    /// Failure fraction over the monitoring window.
    pub rolling_failure_rate: f64,
    /// Calls inside the monitoring window.
    pub window_calls: usize,
    pub average_duration: Duration,
    pub last_error: Option<String>,
}

/// Internal mutable circuit state.
#[derive(Debug)]
struct Circuit {
    phase: CircuitPhase,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_calls: u64,
    half_open_in_flight: u32,
    /// Bumped every time a fresh set of trial slots is handed out.
    trial_round: u64,
    half_open_since: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    next_eligible: Option<DateTime<Utc>>,
    last_error: Option<String>,
    window: OutcomeWindow,
}

impl Circuit {
    fn new(monitoring_window: Duration) -> Self {
        Self {
            phase: CircuitPhase::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_calls: 0,
            half_open_in_flight: 0,
            trial_round: 0,
            half_open_since: None,
            last_failure: None,
            next_eligible: None,
            last_error: None,
            window: OutcomeWindow::new(monitoring_window),
        }
    }
}

/// Circuit breaker guarding one call boundary.
///
/// Thread-safe: every read-modify-write happens under the breaker's own
/// mutex. Callers must pair each allowed [`can_execute`](Self::can_execute)
/// with exactly one [`record_outcome`](Self::record_outcome), or use
/// [`execute`](Self::execute) which does both.
pub struct CircuitBreaker {
    boundary: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    circuit: Mutex<Circuit>,
}

impl CircuitBreaker {
    /// Create a breaker on the system clock.
    pub fn new(
        boundary: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Result<Self, ResilienceError> {
        Self::with_clock(boundary, config, Arc::new(SystemClock))
    }

    /// Create a breaker with an injected clock.
    pub fn with_clock(
        boundary: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self::from_validated(boundary.into(), config, clock))
    }

    pub(crate) fn from_validated(
        boundary: String,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let circuit = Circuit::new(config.monitoring_window);
        Self {
            boundary,
            config,
            clock,
            circuit: Mutex::new(circuit),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock_circuit(&self) -> MutexGuard<'_, Circuit> {
        lock_or_recover(&self.circuit, "Circuit breaker")
    }

    /// Check whether a call may proceed.
    ///
    /// Not a pure read: when the circuit is open and the recovery timeout has
    /// elapsed, this moves it to HalfOpen and admits the call as a trial.
    /// Trial slots that were never answered with an outcome expire after
    /// another recovery timeout.
    pub fn can_execute(&self) -> ExecutionDecision {
        self.admit().0
    }

    /// Like `can_execute`, also returning the trial round of the half-open
    /// slot taken, if any.
    fn admit(&self) -> (ExecutionDecision, Option<u64>) {
        let now = self.clock.now();
        let mut circuit = self.lock_circuit();

        if circuit.phase == CircuitPhase::Open {
            let eligible = circuit.next_eligible.unwrap_or(now);
            if now < eligible {
                let retry_in = until(now, eligible);
                let decision = ExecutionDecision {
                    allowed: false,
                    reason: Some(format!("circuit open, retry in {:?}", retry_in)),
                    phase: CircuitPhase::Open,
                    retry_in: Some(retry_in),
                };
                return (decision, None);
            }

            info!(
                "Circuit breaker: transitioning '{}' from Open to HalfOpen",
                self.boundary
            );
            circuit.phase = CircuitPhase::HalfOpen;
            circuit.consecutive_successes = 0;
            self.new_trial_round(&mut circuit, now);
        }

        if circuit.phase == CircuitPhase::Closed {
            let decision = ExecutionDecision {
                allowed: true,
                reason: None,
                phase: CircuitPhase::Closed,
                retry_in: None,
            };
            return (decision, None);
        }

        if circuit.half_open_in_flight >= self.config.half_open_max_calls {
            let stale_after = circuit
                .half_open_since
                .map(|since| saturating_after(since, self.config.recovery_timeout))
                .unwrap_or(now);
            if now < stale_after {
                debug!(
                    "Circuit breaker: '{}' half-open trial limit reached ({})",
                    self.boundary, self.config.half_open_max_calls
                );
                let decision = ExecutionDecision {
                    allowed: false,
                    reason: Some("half-open trial limit reached".to_string()),
                    phase: CircuitPhase::HalfOpen,
                    retry_in: None,
                };
                return (decision, None);
            }

            info!(
                "Circuit breaker: {} unanswered trial call(s) for '{}' expired",
                circuit.half_open_in_flight, self.boundary
            );
            self.new_trial_round(&mut circuit, now);
        }

        circuit.half_open_in_flight += 1;
        let decision = ExecutionDecision {
            allowed: true,
            reason: None,
            phase: CircuitPhase::HalfOpen,
            retry_in: None,
        };
        (decision, Some(circuit.trial_round))
    }

    fn new_trial_round(&self, circuit: &mut Circuit, now: DateTime<Utc>) {
        circuit.half_open_in_flight = 0;
        circuit.half_open_since = Some(now);
        circuit.trial_round += 1;
    }

    /// Give back a trial slot whose call ended without an outcome.
    fn release_trial(&self, round: u64) {
        let mut circuit = self.lock_circuit();
        if circuit.phase != CircuitPhase::HalfOpen || circuit.trial_round != round {
            return;
        }
        circuit.half_open_in_flight = circuit.half_open_in_flight.saturating_sub(1);
        debug!(
            "Circuit breaker: trial call for '{}' abandoned, slot released",
            self.boundary
        );
    }

    /// Record the outcome of a call that [`can_execute`](Self::can_execute) allowed.
    pub fn record_outcome(&self, success: bool, duration: Duration, error_message: Option<&str>) {
        let now = self.clock.now();
        let mut circuit = self.lock_circuit();

        circuit.total_calls += 1;
        circuit.window.record(now, success, duration);
        if circuit.phase == CircuitPhase::HalfOpen {
            circuit.half_open_in_flight = circuit.half_open_in_flight.saturating_sub(1);
        }

        if success {
            self.on_success(&mut circuit);
        } else {
            self.on_failure(&mut circuit, now, error_message);
        }
    }

    pub fn record_success(&self, duration: Duration) {
        self.record_outcome(true, duration, None);
    }

    pub fn record_failure(&self, duration: Duration, error_message: &str) {
        self.record_outcome(false, duration, Some(error_message));
    }

    fn on_success(&self, circuit: &mut Circuit) {
        circuit.consecutive_failures = 0;
        circuit.consecutive_successes += 1;

        match circuit.phase {
            CircuitPhase::Closed => {
                debug!(
                    "Circuit breaker: success for '{}', failure count reset",
                    self.boundary
                );
            }
            CircuitPhase::HalfOpen => {
                debug!(
                    "Circuit breaker: success for '{}' in HalfOpen ({}/{})",
                    self.boundary, circuit.consecutive_successes, self.config.success_threshold
                );

                if circuit.consecutive_successes >= self.config.success_threshold {
                    info!(
                        "Circuit breaker: closing circuit for '{}' after {} successes",
                        self.boundary, circuit.consecutive_successes
                    );
                    circuit.phase = CircuitPhase::Closed;
                    circuit.consecutive_failures = 0;
                    circuit.consecutive_successes = 0;
                    circuit.half_open_in_flight = 0;
                    circuit.next_eligible = None;
                }
            }
            CircuitPhase::Open => {
                debug!(
                    "Circuit breaker: unexpected success for '{}' in Open state",
                    self.boundary
                );
            }
        }
    }

    fn on_failure(&self, circuit: &mut Circuit, now: DateTime<Utc>, error_message: Option<&str>) {
        circuit.consecutive_successes = 0;
        circuit.consecutive_failures += 1;
        circuit.last_failure = Some(now);
        if let Some(message) = error_message {
            circuit.last_error = Some(message.to_string());
        }

        match circuit.phase {
            CircuitPhase::Closed => {
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    info!(
                        "Circuit breaker: opening circuit for '{}' after {} failures",
                        self.boundary, circuit.consecutive_failures
                    );
                    self.trip(circuit, now);
                } else {
                    debug!(
                        "Circuit breaker: failure for '{}' ({}/{})",
                        self.boundary, circuit.consecutive_failures, self.config.failure_threshold
                    );
                }
            }
            CircuitPhase::HalfOpen => {
                info!(
                    "Circuit breaker: reopening circuit for '{}' after failure in HalfOpen",
                    self.boundary
                );
                self.trip(circuit, now);
            }
            CircuitPhase::Open => {
                debug!(
                    "Circuit breaker: additional failure for '{}' (already open)",
                    self.boundary
                );
            }
        }
    }

    fn trip(&self, circuit: &mut Circuit, now: DateTime<Utc>) {
        circuit.phase = CircuitPhase::Open;
        circuit.consecutive_successes = 0;
        circuit.half_open_in_flight = 0;
        circuit.half_open_since = None;
        circuit.next_eligible = Some(saturating_after(now, self.config.recovery_timeout));
    }

    /// Run `operation` behind the breaker.
    ///
    /// Rejections never run the operation. Operation failures are recorded
    /// and passed through as [`ResilienceError::Operation`].
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let (decision, round) = self.admit();
        if !decision.allowed {
            return Err(match decision.phase {
                CircuitPhase::HalfOpen => ResilienceError::HalfOpenSaturated {
                    boundary: self.boundary.clone(),
                },
                _ => ResilienceError::CircuitOpen {
                    boundary: self.boundary.clone(),
                    retry_in: decision.retry_in.unwrap_or_default(),
                },
            });
        }

        // Frees the trial slot if this future is dropped mid-call.
        let mut slot = TrialSlot {
            breaker: self,
            round,
        };

        let started = self.clock.now();
        let outcome = operation().await;
        let duration = until(started, self.clock.now());
        slot.round = None;

        match outcome {
            Ok(value) => {
                self.record_success(duration);
                Ok(value)
            }
            Err(failure) => {
                self.record_failure(duration, &failure.to_string());
                Err(ResilienceError::Operation(failure))
            }
        }
    }

    /// Current phase, without triggering the lazy Open → HalfOpen transition.
    pub fn phase(&self) -> CircuitPhase {
        self.lock_circuit().phase
    }

    pub fn snapshot(&self) -> CircuitState {
        let now = self.clock.now();
        let mut circuit = self.lock_circuit();

        CircuitState {
            boundary: self.boundary.clone(),
            phase: circuit.phase,
            consecutive_failures: circuit.consecutive_failures,
            consecutive_successes: circuit.consecutive_successes,
            total_calls: circuit.total_calls,
            last_failure_time: circuit.last_failure,
            next_eligible_retry_time: circuit.next_eligible,
            rolling_failure_rate: circuit.window.failure_rate(now),
            window_calls: circuit.window.calls(now),
            average_duration: circuit.window.average_duration(now),
            last_error: circuit.last_error.clone(),
        }
    }

    /// Force the circuit back to Closed with all counters cleared.
    pub fn reset(&self) {
        let mut circuit = self.lock_circuit();
        info!(
            "Circuit breaker: manually resetting circuit for '{}'",
            self.boundary
        );
        *circuit = Circuit::new(self.config.monitoring_window);
    }
}

struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    round: Option<u64>,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if let Some(round) = self.round.take() {
            self.breaker.release_trial(round);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("boundary", &self.boundary)
            .field("config", &self.config)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ManualClock;

    fn config(failure_threshold: u32, success_threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
            monitoring_window: Duration::from_secs(60),
        }
    }

    fn breaker(clock: &Arc<ManualClock>, cfg: CircuitBreakerConfig) -> CircuitBreaker {
        CircuitBreaker::with_clock("TEST_BOUNDARY", cfg, clock.clone()).unwrap()
    }

    fn fail(cb: &CircuitBreaker) {
        assert!(cb.can_execute().allowed);
        cb.record_failure(Duration::from_millis(5), "boom");
    }

    fn succeed(cb: &CircuitBreaker) {
        assert!(cb.can_execute().allowed);
        cb.record_success(Duration::from_millis(5));
    }

    #[test]
    fn test_circuit_starts_closed() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock, CircuitBreakerConfig::default());

        let decision = cb.can_execute();
        assert!(decision.allowed);
        assert_eq!(decision.phase, CircuitPhase::Closed);
    }

    #[test]
    fn test_circuit_opens_after_threshold() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock, config(3, 2));

        fail(&cb);
        fail(&cb);
        assert_eq!(cb.phase(), CircuitPhase::Closed);

        fail(&cb);
        let decision = cb.can_execute();
        assert!(!decision.allowed);
        assert_eq!(decision.phase, CircuitPhase::Open);
        assert_eq!(decision.retry_in, Some(Duration::from_secs(30)));
        assert!(decision.reason.is_some());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock, config(3, 2));

        fail(&cb);
        fail(&cb);
        assert_eq!(cb.snapshot().consecutive_failures, 2);

        succeed(&cb);
        assert_eq!(cb.snapshot().consecutive_failures, 0);

        fail(&cb);
        fail(&cb);
        assert_eq!(cb.phase(), CircuitPhase::Closed);
    }

    #[test]
    fn test_transitions_to_half_open_after_recovery_timeout() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock, config(1, 1));

        fail(&cb);
        assert!(!cb.can_execute().allowed);

        clock.advance(Duration::from_secs(29));
        assert!(!cb.can_execute().allowed);

        clock.advance(Duration::from_secs(1));
        let decision = cb.can_execute();
        assert!(decision.allowed);
        assert_eq!(decision.phase, CircuitPhase::HalfOpen);
        assert_eq!(cb.phase(), CircuitPhase::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_success_threshold() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock, config(1, 2));

        fail(&cb);
        clock.advance(Duration::from_secs(30));

        succeed(&cb);
        assert_eq!(cb.phase(), CircuitPhase::HalfOpen);

        succeed(&cb);
        let state = cb.snapshot();
        assert_eq!(state.phase, CircuitPhase::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.consecutive_successes, 0);
        assert_eq!(state.next_eligible_retry_time, None);
    }

    #[test]
    fn test_half_open_reopens_on_failure_and_restarts_timer() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock, config(1, 2));

        fail(&cb);
        clock.advance(Duration::from_secs(30));
        fail(&cb);

        let state = cb.snapshot();
        assert_eq!(state.phase, CircuitPhase::Open);
        assert_eq!(
            state.next_eligible_retry_time,
            Some(clock.now() + chrono::Duration::seconds(30))
        );
        assert!(!cb.can_execute().allowed);
    }

    #[test]
    fn test_half_open_limits_trial_calls() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock, config(1, 3));

        fail(&cb);
        clock.advance(Duration::from_secs(30));

        assert!(cb.can_execute().allowed);
        let second = cb.can_execute();
        assert!(!second.allowed);
        assert_eq!(second.phase, CircuitPhase::HalfOpen);
        assert_eq!(second.reason.as_deref(), Some("half-open trial limit reached"));

        // Finishing the trial frees the slot.
        cb.record_success(Duration::ZERO);
        assert!(cb.can_execute().allowed);
    }

    #[test]
    fn test_open_never_closes_directly() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock, config(1, 1));

        fail(&cb);
        // A stray success while open must not close the circuit.
        cb.record_success(Duration::ZERO);
        assert_eq!(cb.phase(), CircuitPhase::Open);
    }

    #[test]
    fn test_rolling_failure_rate() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock, config(10, 1));

        fail(&cb);
        succeed(&cb);
        succeed(&cb);
        fail(&cb);
        assert!((cb.snapshot().rolling_failure_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(cb.snapshot().total_calls, 4);

        clock.advance(Duration::from_secs(60));
        let state = cb.snapshot();
        assert_eq!(state.rolling_failure_rate, 0.0);
        assert_eq!(state.window_calls, 0);
        assert_eq!(state.total_calls, 4);
    }

    #[test]
    fn test_manual_reset() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock, config(1, 1));

        fail(&cb);
        assert_eq!(cb.phase(), CircuitPhase::Open);

        cb.reset();
        let state = cb.snapshot();
        assert_eq!(state.phase, CircuitPhase::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.total_calls, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = CircuitBreaker::new("x", config(0, 1));
        assert!(matches!(result, Err(ResilienceError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_execute_rejects_without_running() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock, config(1, 1));

        let first: Result<(), _> = cb.execute(|| async { Err(Failure::http(500, "boom")) }).await;
        assert!(matches!(first, Err(ResilienceError::Operation(_))));

        let mut ran = false;
        let second: Result<(), _> = cb
            .execute(|| {
                ran = true;
                async { Ok(()) }
            })
            .await;

        assert!(!ran);
        assert!(matches!(second, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(cb.snapshot().last_error.as_deref(), Some("[500] boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_frees_its_slot() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock, config(1, 1));

        fail(&cb);
        clock.advance(Duration::from_secs(30));

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            cb.execute(std::future::pending::<Result<(), Failure>>),
        )
        .await;
        assert!(cancelled.is_err());

        let decision = cb.can_execute();
        assert!(decision.allowed);
        assert_eq!(decision.phase, CircuitPhase::HalfOpen);
    }

    #[test]
    fn test_unanswered_trials_expire_after_recovery_timeout() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock, config(1, 1));

        fail(&cb);
        clock.advance(Duration::from_secs(30));

        // Admitted, but the caller never reports back.
        assert!(cb.can_execute().allowed);
        clock.advance(Duration::from_secs(29));
        assert!(!cb.can_execute().allowed);

        clock.advance(Duration::from_secs(1));
        let decision = cb.can_execute();
        assert!(decision.allowed);
        assert_eq!(decision.phase, CircuitPhase::HalfOpen);

        cb.record_success(Duration::ZERO);
        assert_eq!(cb.phase(), CircuitPhase::Closed);
    }
}
