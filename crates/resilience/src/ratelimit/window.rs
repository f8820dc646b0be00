//! Per-provider quota window.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::headers::QuotaHeaders;
use crate::runtime::until;

/// Quota bookkeeping for one provider.
///
/// `remaining` never goes up inside a window and never below zero; it returns
/// to `limit` only once `reset_time` has passed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitWindow {
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
    #[serde(with = "crate::config::millis")]
    pub window_duration: Duration,
}

impl RateLimitWindow {
    pub fn new(limit: u64, remaining: u64, reset_time: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            limit,
            remaining: remaining.min(limit),
            reset_time,
            window_duration: until(now, reset_time),
        }
    }

    pub(crate) fn from_headers(quota: &QuotaHeaders, now: DateTime<Utc>) -> Self {
        Self::new(quota.limit, quota.remaining, quota.reset_time, now)
    }

    /// Fold a newer header reading into the window.
    ///
    /// Inside the current window only a lower `remaining` is accepted. Once
    /// the window has expired the reading starts a fresh one.
    pub(crate) fn observe(&mut self, quota: &QuotaHeaders, now: DateTime<Utc>) {
        if now >= self.reset_time {
            *self = Self::from_headers(quota, now);
            return;
        }
        self.remaining = self.remaining.min(quota.remaining);
    }

    /// Refill the window if its reset time has passed, rolling the reset time
    /// forward by whole window lengths.
    pub(crate) fn refresh(&mut self, now: DateTime<Utc>) {
        if now < self.reset_time {
            return;
        }

        self.remaining = self.limit;
        if self.window_duration.is_zero() {
            self.reset_time = now;
            return;
        }

        let Ok(span) = chrono::Duration::from_std(self.window_duration) else {
            self.reset_time = now;
            return;
        };
        while self.reset_time <= now {
            let behind = until(self.reset_time, now);
            let periods = (behind.as_millis() / self.window_duration.as_millis().max(1)).max(1);
            let periods = i32::try_from(periods).unwrap_or(i32::MAX);
            match span
                .checked_mul(periods)
                .and_then(|step| self.reset_time.checked_add_signed(step))
            {
                Some(next) => self.reset_time = next,
                None => {
                    self.reset_time = now;
                    return;
                }
            }
        }
    }

    /// Count one dispatched call against the quota.
    pub(crate) fn consume(&mut self, now: DateTime<Utc>) {
        self.refresh(now);
        self.remaining = self.remaining.saturating_sub(1);
    }

    pub fn time_until_reset(&self, now: DateTime<Utc>) -> Duration {
        until(now, self.reset_time)
    }

    /// Fraction of the quota still available, `0.0..=1.0`.
    pub fn remaining_ratio(&self) -> f64 {
        if self.limit == 0 {
            0.0
        } else {
            self.remaining as f64 / self.limit as f64
        }
    }
}
