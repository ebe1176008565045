//! Sliding-window rate limiting against a shared store
//!
//! Every replica counts against the same [`WindowStore`], so a quota holds
//! across the whole deployment rather than per process.
//!
//! [`WindowStore`]: crate::persistence::WindowStore

mod keys;
mod limiter;

pub use keys::{global_key, ip_key, user_key};
pub use limiter::{RateLimitConfig, RateLimitDecision, RateLimiter};
