//! Sliding window of timestamped call outcomes.
//!
//! An outcome recorded at `t` is inside the window while `t > now - span`.
//! The boundary instant itself is outside.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::runtime::to_delta;

/// Hard cap on retained outcomes, independent of the time span.
const MAX_OUTCOMES: usize = 1000;

#[derive(Clone, Copy, Debug)]
struct Outcome {
    at: DateTime<Utc>,
    success: bool,
    duration: Duration,
}

#[derive(Debug)]
pub(crate) struct OutcomeWindow {
    span: Duration,
    outcomes: VecDeque<Outcome>,
}

impl OutcomeWindow {
    pub(crate) fn new(span: Duration) -> Self {
        Self {
            span,
            outcomes: VecDeque::new(),
        }
    }

    pub(crate) fn record(&mut self, at: DateTime<Utc>, success: bool, duration: Duration) {
        if self.outcomes.len() >= MAX_OUTCOMES {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(Outcome {
            at,
            success,
            duration,
        });
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let horizon = now - to_delta(self.span);
        while self.outcomes.front().is_some_and(|o| o.at <= horizon) {
            self.outcomes.pop_front();
        }
    }

    /// Calls recorded inside the window.
    pub(crate) fn calls(&mut self, now: DateTime<Utc>) -> usize {
        self.evict(now);
        self.outcomes.len()
    }

    pub(crate) fn failures(&mut self, now: DateTime<Utc>) -> usize {
        self.evict(now);
        self.outcomes.iter().filter(|o| !o.success).count()
    }

    /// Failure fraction in `[0, 1]`, zero when the window is empty.
    pub(crate) fn failure_rate(&mut self, now: DateTime<Utc>) -> f64 {
        let calls = self.calls(now);
        if calls == 0 {
            return 0.0;
        }
        self.failures(now) as f64 / calls as f64
    }

    pub(crate) fn average_duration(&mut self, now: DateTime<Utc>) -> Duration {
        let calls = self.calls(now);
        if calls == 0 {
            return Duration::ZERO;
        }
        let total: Duration = self.outcomes.iter().map(|o| o.duration).sum();
        total / u32::try_from(calls).unwrap_or(u32::MAX)
    }
}
