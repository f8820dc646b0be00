//! Resilience Simulation Crate
//!
//! Policy engines that wrap calls to unreliable upstream providers. The crate
//! never performs I/O itself: callers hand in closures that make the real
//! calls and describe failures with [`Failure`].
//!
//! # Overview
//!
//! Four independent engines, meant to be stacked by the caller:
//! - [`RetryExecutor`] - classifies failures and retries under backoff and jitter
//! - [`CircuitBreaker`] - stops calling a failing boundary for a cooldown period
//! - [`FallbackRouter`] - scores providers and fails over in priority order
//! - [`RateLimiter`] - tracks quota headers, throttles and queues calls
//!
//! # Architecture
//!
//! ```text
//! caller
//!   |
//!   v
//! +------------------+
//! |  FallbackRouter  |  (one provider at a time, ascending priority)
//! +------------------+
//!   |
//!   v
//! +------------------+
//! |  CircuitBreaker  |  (per provider boundary, via CircuitRegistry)
//! +------------------+
//!   |
//!   v
//! +------------------+
//! |  RetryExecutor   |  (classify -> backoff -> sleep)
//! +------------------+
//!   |
//!   v
//! +------------------+
//! |   RateLimiter    |  (quota window, adaptive delay, queue)
//! +------------------+
//!   |
//!   v
//! operation()
//! ```
//!
//! # Time and Randomness
//!
//! Every engine takes its [`Clock`], [`Sleeper`] and [`RandomSource`] as
//! trait objects. [`ManualClock`] implements both clock and sleeper, so a
//! whole stack can run against simulated time.
//!
//! # Configuration
//!
//! [`ResilienceConfig`] bundles the four engine configs and loads from JSON
//! (camelCase keys, durations in milliseconds).

pub mod circuit;
pub mod config;
pub mod errors;
pub mod fallback;
pub mod ratelimit;
pub mod retry;
pub mod runtime;

pub use circuit::{
    CircuitBreaker, CircuitBreakerConfig, CircuitPhase, CircuitRegistry, CircuitState,
    ExecutionDecision,
};
pub use config::ResilienceConfig;
pub use errors::{
    classify, ErrorClassification, ErrorKind, Failure, ResilienceError, RetryCondition, Severity,
};
pub use fallback::{
    FallbackDiagnostics, FallbackRouter, HealthStatus, Provider, ProviderHealth, ProviderMetrics,
    ProviderRequirements, RouterConfig, SkipReason,
};
pub use ratelimit::{
    HeaderFormat, RateLimitStatus, RateLimitWindow, RateLimiter, RateLimiterConfig,
};
pub use retry::{Backoff, Jitter, RetryExecution, RetryExecutor, RetryPolicy, RetryStats};
pub use runtime::{
    Clock, FixedRandom, ManualClock, RandomSource, SeededRandom, Sleeper, SystemClock,
    ThreadRandom, TokioSleeper,
};
