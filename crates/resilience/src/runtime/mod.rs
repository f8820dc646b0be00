//! Injectable time, sleeping and randomness.
//!
//! Every engine takes its clock, sleeper and random source as trait objects so
//! tests and simulations can run against fixed times and seeds.

mod clock;
mod random;

pub use clock::{Clock, ManualClock, Sleeper, SystemClock, TokioSleeper};
pub use random::{FixedRandom, RandomSource, SeededRandom, ThreadRandom};

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::warn;

/// Lock a mutex, recovering from poison if necessary.
pub(crate) fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("{} mutex was poisoned, recovering", what);
        poisoned.into_inner()
    })
}

/// Convert a std duration into a chrono delta, saturating on overflow.
pub(crate) fn to_delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

/// `at + by`, or `None` when the result is outside chrono's range.
pub(crate) fn checked_after(at: DateTime<Utc>, by: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
}

/// `at + by`, clamped to the latest representable instant.
pub(crate) fn saturating_after(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    checked_after(at, by).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time from `from` until `to`, zero if `to` is not later.
pub(crate) fn until(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}
