// Rate limiting middleware
// Decision: Every response carries X-RateLimit-Limit/Remaining/Reset (epoch seconds)
// Decision: Store outages never block traffic, the limiter fails open
// Decision: Proxy headers are ignored unless trust_proxy is set; then the rightmost
// X-Forwarded-For hop (appended by our proxy) is the client

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use axum::{
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use breakwater_resilience::rate_limit::{global_key, ip_key, user_key};
use breakwater_resilience::{RateLimitConfig, RateLimitDecision, RateLimiter};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::RateLimitSettings;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Who a request is counted against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyScope {
    /// Client address
    #[default]
    Ip,
    /// Authenticated subject, falling back to the client address
    User,
    /// One shared budget per route
    Global,
}

impl fmt::Display for KeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip => write!(f, "ip"),
            Self::User => write!(f, "user"),
            Self::Global => write!(f, "global"),
        }
    }
}

/// Unrecognised `RATE_LIMIT_SCOPE` value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown rate limit scope: {0}")]
pub struct UnknownScope(pub String);

impl FromStr for KeyScope {
    type Err = UnknownScope;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ip" | "" => Ok(Self::Ip),
            "user" => Ok(Self::User),
            "global" => Ok(Self::Global),
            _ => Err(UnknownScope(s.to_string())),
        }
    }
}

/// Authenticated subject for [`KeyScope::User`]
///
/// Insert it as a request extension from the authentication layer, ahead of
/// the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSubject(pub String);

/// Rate limit state shared across routes
#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: RateLimiter,
    pub config: RateLimitConfig,
    pub scope: KeyScope,
    pub trust_proxy: bool,
}

impl RateLimitState {
    pub fn new(limiter: RateLimiter, settings: RateLimitSettings) -> Self {
        Self {
            limiter,
            config: settings.limit,
            scope: settings.scope,
            trust_proxy: settings.trust_proxy,
        }
    }
}

/// Body of a `429 Too Many Requests` response
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitError {
    pub error: String,
    pub retry_after: u64,
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        let retry_after = HeaderValue::from(self.retry_after);
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(self)).into_response();
        response.headers_mut().insert(header::RETRY_AFTER, retry_after);
        response
    }
}

/// Count the request against its key and reject it once the window is full
///
/// ```ignore
/// let state = RateLimitState::new(RateLimiter::in_memory(), RateLimitSettings::from_env());
/// let app = Router::new()
///     .route("/api/scan", post(scan))
///     .layer(axum::middleware::from_fn_with_state(state, rate_limit));
/// ```
pub async fn rate_limit(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let key = request_key(&request, state.scope, state.trust_proxy);
    let decision = state.limiter.check_rate_limit(&key, &state.config).await;

    if !decision.allowed {
        debug!(key = %key, "Request rejected by rate limiter");
        let mut response = RateLimitError {
            error: "Too many requests".to_string(),
            retry_after: decision.retry_after_secs.unwrap_or(1),
        }
        .into_response();
        apply_headers(response.headers_mut(), &decision);
        return response;
    }

    let mut response = next.run(request).await;
    apply_headers(response.headers_mut(), &decision);
    response
}

fn request_key(request: &Request, scope: KeyScope, trust_proxy: bool) -> String {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(MatchedPath::as_str)
        .unwrap_or_else(|| request.uri().path());

    match scope {
        KeyScope::Global => global_key(route),
        KeyScope::User => match request.extensions().get::<RateLimitSubject>() {
            Some(subject) => user_key(&subject.0, route),
            None => ip_key(&client_ip(request, trust_proxy), route),
        },
        KeyScope::Ip => ip_key(&client_ip(request, trust_proxy), route),
    }
}

fn client_ip(request: &Request, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(ip) = proxied_ip(request.headers()) {
            return ip;
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Client address as reported by the reverse proxy in front of us
fn proxied_ip(headers: &HeaderMap) -> Option<String> {
    // Our proxy appends the peer it saw; anything left of it is client-supplied
    let forwarded = headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.rsplit(',').map(str::trim).find(|ip| !ip.is_empty()));
    if let Some(ip) = forwarded {
        return Some(ip.to_string());
    }

    headers
        .get(X_REAL_IP)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

fn apply_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at_secs()));
}
