//! Backoff and jitter arithmetic.
//!
//! All math is done in floating point milliseconds, then rounded to a whole
//! millisecond and floored at zero.

use std::time::Duration;

use super::policy::{Backoff, Jitter, RetryPolicy};
use crate::runtime::RandomSource;

fn as_millis_f64(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn from_millis_f64(ms: f64) -> Duration {
    if !ms.is_finite() || ms <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_millis(ms.round() as u64)
}

/// Deterministic delay after attempt number `attempt` (1-based) failed.
pub fn base_delay(backoff: &Backoff, attempt: u32) -> Duration {
    let attempt = attempt.max(1);

    match backoff {
        Backoff::Exponential {
            base,
            max,
            multiplier,
        } => {
            let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
            let ms = as_millis_f64(*base) * multiplier.powi(exponent);
            from_millis_f64(ms.min(as_millis_f64(*max)))
        }
        Backoff::Linear { base, max } => {
            let ms = as_millis_f64(*base) * f64::from(attempt);
            from_millis_f64(ms.min(as_millis_f64(*max)))
        }
        Backoff::Fixed { delay } => *delay,
    }
}

/// Delay to wait after attempt `attempt` failed, jitter included.
///
/// `previous` is the delay used before the current attempt, if any. Only
/// decorrelated jitter depends on it.
pub fn compute_delay(
    policy: &RetryPolicy,
    attempt: u32,
    previous: Option<Duration>,
    random: &dyn RandomSource,
) -> Duration {
    let delay = as_millis_f64(base_delay(&policy.backoff, attempt));

    let ms = match policy.jitter {
        Jitter::None => delay,
        Jitter::Full { factor } => {
            let r = random.next_f64();
            delay * (1.0 + (r - 0.5) * 2.0 * factor)
        }
        Jitter::Equal { factor } => {
            let r = random.next_f64();
            delay * (1.0 - factor / 2.0) + delay * factor * r
        }
        Jitter::Decorrelated { factor } => {
            let r = random.next_f64();
            let base = as_millis_f64(policy.backoff.base());
            let max = as_millis_f64(policy.backoff.max());
            let prev = previous.map(as_millis_f64).unwrap_or(base);
            let upper = (prev * (1.0 + 2.0 * factor)).max(base);
            (base + (upper - base) * r).clamp(base, max)
        }
    };

    from_millis_f64(ms)
}
