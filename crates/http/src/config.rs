// Rate Limit Configuration
//
// Settings for the HTTP rate limiter, loaded from environment variables.

use std::env;
use std::time::Duration;

use breakwater_resilience::RateLimitConfig;
use tracing::warn;

use crate::rate_limit::KeyScope;

/// Configuration for the rate limiting middleware
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RateLimitSettings {
    /// Window and request budget applied to every key
    pub limit: RateLimitConfig,

    /// What a key is made of
    pub scope: KeyScope,

    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`
    ///
    /// Only enable behind a reverse proxy that sets these headers; otherwise
    /// clients choose their own key.
    pub trust_proxy: bool,
}

impl RateLimitSettings {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `RATE_LIMIT_MAX_REQUESTS`: Requests per window (default: 100)
    /// - `RATE_LIMIT_WINDOW_MS`: Window length (default: 60000)
    /// - `RATE_LIMIT_SCOPE`: `ip`, `user` or `global` (default: ip)
    /// - `RATE_LIMIT_TRUST_PROXY`: Read the client address from proxy headers (default: false)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Create configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = RateLimitConfig::default();

        let max_requests = lookup("RATE_LIMIT_MAX_REQUESTS")
            .and_then(|v| parse_or_warn("RATE_LIMIT_MAX_REQUESTS", &v))
            .unwrap_or(defaults.max_requests);

        let window = lookup("RATE_LIMIT_WINDOW_MS")
            .and_then(|v| parse_or_warn::<u64>("RATE_LIMIT_WINDOW_MS", &v))
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.window);

        let scope = lookup("RATE_LIMIT_SCOPE")
            .and_then(|v| parse_or_warn("RATE_LIMIT_SCOPE", &v))
            .unwrap_or_default();

        let trust_proxy = lookup("RATE_LIMIT_TRUST_PROXY")
            .map(|v| v.trim().to_lowercase() == "true" || v.trim() == "1")
            .unwrap_or(false);

        Self {
            limit: RateLimitConfig::new(max_requests, window),
            scope,
            trust_proxy,
        }
    }
}

fn parse_or_warn<T>(name: &str, value: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(variable = name, value, error = %e, "Invalid value, using default");
            None
        }
    }
}
