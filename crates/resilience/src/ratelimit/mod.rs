//! Adaptive rate limiting and queueing per upstream provider.
//!
//! # Delay Rules
//! ```text
//! no window                     → 0
//! remaining == 0                → time until reset
//! remaining < threshold * limit → base_delay * (1 - remaining/limit) * multiplier
//! otherwise                     → 0
//! ```
//! A retry-after hint additionally blocks the provider until it expires.

mod headers;
mod limiter;
mod queue;
mod window;

pub use headers::{parse_headers, HeaderFormat, ParsedHeaders, QuotaHeaders};
pub use limiter::{is_rate_limit_failure, RateLimitStatus, RateLimiter, RateLimiterConfig};
pub use window::RateLimitWindow;
