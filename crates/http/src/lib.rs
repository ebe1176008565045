// HTTP surface for the resilience layer
//
// - Rate-limit middleware turning decisions into 429 responses and X-RateLimit-* headers
// - Environment configuration for the middleware
// - Tracing initialisation for binaries embedding the layer

pub mod config;
pub mod rate_limit;
pub mod telemetry;

pub use config::RateLimitSettings;
pub use rate_limit::{rate_limit, KeyScope, RateLimitError, RateLimitState, RateLimitSubject};
pub use telemetry::init_tracing;
