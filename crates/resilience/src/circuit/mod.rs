//! Circuit breaking for protected call boundaries.
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= failure_threshold
//! Open → HalfOpen: first can_execute() after recovery_timeout
//! HalfOpen → Closed: consecutive successes >= success_threshold
//! HalfOpen → Open: any failure (timer restarts)
//! ```
//!
//! Open never goes straight to Closed except through an explicit `reset()`.

mod breaker;
mod registry;
mod window;

pub use breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitPhase, CircuitState, ExecutionDecision,
};
pub use registry::CircuitRegistry;
