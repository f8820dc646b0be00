//! Retry loop and execution history.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info};

use super::backoff::compute_delay;
use super::policy::RetryPolicy;
use crate::errors::{classify, ErrorClassification, Failure, ResilienceError};
use crate::runtime::{
    lock_or_recover, until, Clock, RandomSource, Sleeper, SystemClock, ThreadRandom, TokioSleeper,
};

/// Default number of attempt records kept for observability.
const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// One attempt made by the executor.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryExecution {
    /// Sequence number of the `execute` call this attempt belongs to.
    pub execution_id: u64,
    /// 1-based attempt number within the execution.
    pub attempt_number: u32,
    /// Time slept before this attempt (zero for the first).
    pub delay_before_attempt: Duration,
    /// Present when the attempt failed.
    pub classification: Option<ErrorClassification>,
    pub succeeded: bool,
    /// Time from the start of the execution to the end of this attempt.
    pub elapsed_since_start: Duration,
}

/// Aggregate counters across all executions.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RetryStats {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_attempts: u64,
}

impl RetryStats {
    pub fn average_attempts(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.total_attempts as f64 / self.executions as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.successes as f64 / self.executions as f64
        }
    }
}

#[derive(Debug, Default)]
struct Ledger {
    records: VecDeque<RetryExecution>,
    stats: RetryStats,
}

/// Runs operations under a [`RetryPolicy`].
///
/// The executor owns its clock, sleeper and random source, and keeps a
/// bounded FIFO log of recent attempts. Share one instance across call sites
/// that should share history.
pub struct RetryExecutor {
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    random: Arc<dyn RandomSource>,
    history_capacity: usize,
    ledger: Mutex<Ledger>,
}

impl RetryExecutor {
    /// Create an executor on the system clock, tokio timer and thread RNG.
    pub fn new() -> Self {
        Self::with_runtime(
            Arc::new(SystemClock),
            Arc::new(TokioSleeper),
            Arc::new(ThreadRandom),
        )
    }

    /// Create an executor with injected time and randomness.
    pub fn with_runtime(
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            clock,
            sleeper,
            random,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Change how many attempt records are retained. Oldest are evicted first.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    fn lock_ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        lock_or_recover(&self.ledger, "Retry ledger")
    }

    /// Run `operation` until it succeeds, fails non-retryably, or the policy's
    /// attempts are exhausted.
    ///
    /// Attempts are strictly sequential. The returned error carries the
    /// classification of the last failure.
    pub async fn execute<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        policy.validate()?;

        let execution_id = {
            let mut ledger = self.lock_ledger();
            ledger.stats.executions += 1;
            ledger.stats.executions
        };

        let started = self.clock.now();
        let mut attempt: u32 = 1;
        let mut delay_before = Duration::ZERO;

        loop {
            let outcome = operation().await;
            let elapsed = until(started, self.clock.now());

            match outcome {
                Ok(value) => {
                    debug!(
                        "Retry executor: execution {} succeeded on attempt {}",
                        execution_id, attempt
                    );
                    self.record(
                        RetryExecution {
                            execution_id,
                            attempt_number: attempt,
                            delay_before_attempt: delay_before,
                            classification: None,
                            succeeded: true,
                            elapsed_since_start: elapsed,
                        },
                        Some(true),
                    );
                    return Ok(value);
                }
                Err(failure) => {
                    let classification = classify(&failure, &policy.retry_conditions);
                    let give_up = !classification.retryable || attempt >= policy.max_attempts;

                    self.record(
                        RetryExecution {
                            execution_id,
                            attempt_number: attempt,
                            delay_before_attempt: delay_before,
                            classification: Some(classification.clone()),
                            succeeded: false,
                            elapsed_since_start: elapsed,
                        },
                        give_up.then_some(false),
                    );

                    if give_up {
                        info!(
                            "Retry executor: giving up on execution {} after {} attempt(s): {}",
                            execution_id, attempt, classification
                        );
                        return Err(ResilienceError::RetriesExhausted {
                            attempts: attempt,
                            classification,
                        });
                    }

                    let previous = (attempt > 1).then_some(delay_before);
                    let mut delay = compute_delay(policy, attempt, previous, self.random.as_ref());
                    if let Some(hint) = classification.retry_after {
                        delay = delay.max(hint);
                    }

                    debug!(
                        "Retry executor: attempt {}/{} failed ({}), retrying in {:?}",
                        attempt, policy.max_attempts, classification, delay
                    );

                    self.sleeper.sleep(delay).await;
                    delay_before = delay;
                    attempt += 1;
                }
            }
        }
    }

    fn record(&self, execution: RetryExecution, finished: Option<bool>) {
        let mut ledger = self.lock_ledger();

        ledger.stats.total_attempts += 1;
        match finished {
            Some(true) => ledger.stats.successes += 1,
            Some(false) => ledger.stats.failures += 1,
            None => {}
        }

        if self.history_capacity == 0 {
            return;
        }
        while ledger.records.len() >= self.history_capacity {
            ledger.records.pop_front();
        }
        ledger.records.push_back(execution);
    }

    /// Recent attempt records, oldest first.
    pub fn history(&self) -> Vec<RetryExecution> {
        self.lock_ledger().records.iter().cloned().collect()
    }

    /// Records belonging to one execution.
    pub fn execution(&self, execution_id: u64) -> Vec<RetryExecution> {
        self.lock_ledger()
            .records
            .iter()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> RetryStats {
        self.lock_ledger().stats
    }

    pub fn clear_history(&self) {
        let mut ledger = self.lock_ledger();
        ledger.records.clear();
        ledger.stats = RetryStats::default();
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::retry::{Backoff, Jitter};
    use crate::runtime::{FixedRandom, ManualClock};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn executor(clock: &Arc<ManualClock>) -> RetryExecutor {
        RetryExecutor::with_runtime(clock.clone(), clock.clone(), Arc::new(FixedRandom(0.5)))
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Backoff::exponential(ms(100), ms(1000), 2.0),
            Jitter::None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let clock = Arc::new(ManualClock::starting_now());
        let executor = executor(&clock);

        let result: Result<u32, _> = executor.execute(&policy(3), || async { Ok(7) }).await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(executor.history().len(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_fails_twice_then_succeeds() {
        let clock = Arc::new(ManualClock::starting_now());
        let executor = executor(&clock);
        let calls = AtomicU32::new(0);

        let result = executor
            .execute(&policy(3), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Failure::http(503, "unavailable"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let history = executor.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].delay_before_attempt, Duration::ZERO);
        assert_eq!(history[1].delay_before_attempt, ms(100));
        assert_eq!(history[2].delay_before_attempt, ms(200));
        assert!(history[2].succeeded);
        assert_eq!(history[2].elapsed_since_start, ms(300));
        assert_eq!(clock.sleeps(), vec![ms(100), ms(200)]);
    }

    #[tokio::test]
    async fn test_non_retryable_attempted_once() {
        let clock = Arc::new(ManualClock::starting_now());
        let executor = executor(&clock);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .execute(&policy(5), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure::http(401, "bad api key")) }
            })
            .await;

        let err = result.unwrap_err();
        let classification = err.classification().unwrap();
        assert_eq!(classification.kind, ErrorKind::Auth);
        assert!(!classification.retryable);
        assert!(matches!(err, ResilienceError::RetriesExhausted { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let clock = Arc::new(ManualClock::starting_now());
        let executor = executor(&clock);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .execute(&policy(4), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure::network("connection refused")) }
            })
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::RetriesExhausted { attempts: 4, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(clock.sleeps(), vec![ms(100), ms(200), ms(400)]);
    }

    #[tokio::test]
    async fn test_single_attempt_policy_never_retries() {
        let clock = Arc::new(ManualClock::starting_now());
        let executor = executor(&clock);
        let calls = AtomicU32::new(0);

        let _: Result<(), _> = executor
            .execute(&policy(1), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure::http(503, "unavailable")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_retry_after_hint_extends_delay() {
        let clock = Arc::new(ManualClock::starting_now());
        let executor = executor(&clock);
        let calls = AtomicU32::new(0);

        let _ = executor
            .execute(&policy(2), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Failure::http(429, "slow down").with_retry_after(ms(750)))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert_eq!(clock.sleeps(), vec![ms(750)]);
    }

    #[tokio::test]
    async fn test_history_is_capped_fifo() {
        let clock = Arc::new(ManualClock::starting_now());
        let executor = executor(&clock).with_history_capacity(3);

        for i in 0..5u32 {
            let _ = executor.execute(&policy(1), || async move { Ok(i) }).await;
        }

        let history = executor.history();
        assert_eq!(history.len(), 3);
        assert_eq!(
            history.iter().map(|r| r.execution_id).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
    }

    #[tokio::test]
    async fn test_stats() {
        let clock = Arc::new(ManualClock::starting_now());
        let executor = executor(&clock);

        let _ = executor.execute(&policy(2), || async { Ok::<_, Failure>(()) }).await;
        let _ = executor
            .execute(&policy(2), || async { Err::<(), _>(Failure::http(500, "boom")) })
            .await;

        let stats = executor.stats();
        assert_eq!(stats.executions, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.total_attempts, 3);
        assert!((stats.average_attempts() - 1.5).abs() < f64::EPSILON);
        assert!((stats.success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_invalid_policy_rejected_before_running() {
        let clock = Arc::new(ManualClock::starting_now());
        let executor = executor(&clock);
        let mut bad = policy(3);
        bad.max_attempts = 0;

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = executor
            .execute(&bad, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::InvalidConfig(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
