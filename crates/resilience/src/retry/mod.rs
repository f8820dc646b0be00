//! Retry executor.
//!
//! Classifies each failure against the policy's condition table and retries
//! retryable failures under a backoff and jitter policy.
//!
//! # Data Flow
//! ```text
//! attempt N
//!     → operation() succeeds → record, return
//!     → operation() fails → classify (policy.rs conditions)
//!         → not retryable or N == max_attempts → record, propagate
//!         → backoff.rs (base delay + jitter) → sleep → attempt N + 1
//! ```

mod backoff;
mod executor;
mod policy;

pub use backoff::{base_delay, compute_delay};
pub use executor::{RetryExecution, RetryExecutor, RetryStats};
pub use policy::{Backoff, Jitter, RetryPolicy};
