//! Clocks and sleepers.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{lock_or_recover, saturating_after};

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Suspends the current task. The only suspension point the engines use.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// The real system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Sleeps on the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// A clock that only moves when told to.
///
/// Also acts as a [`Sleeper`]: sleeping advances the clock by the requested
/// duration immediately and records it, so simulated waits cost no real time.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Start at the current system time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock_or_recover(&self.now, "Manual clock");
        *now = saturating_after(*now, by);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *lock_or_recover(&self.now, "Manual clock") = to;
    }

    /// Every duration passed to [`Sleeper::sleep`], in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        lock_or_recover(&self.sleeps, "Manual clock sleeps").clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_now()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock_or_recover(&self.now, "Manual clock")
    }
}

#[async_trait]
impl Sleeper for ManualClock {
    async fn sleep(&self, duration: Duration) {
        lock_or_recover(&self.sleeps, "Manual clock sleeps").push(duration);
        self.advance(duration);
        // Let other tasks observe the new time before we continue.
        tokio::task::yield_now().await;
    }
}
