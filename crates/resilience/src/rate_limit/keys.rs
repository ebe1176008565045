//! Rate-limit key builders
//!
//! Keys are `ratelimit:<scope>:<components...>`. `:` and `%` inside a component
//! are percent-escaped, so distinct (subject, route) pairs never share a key.

use std::borrow::Cow;

const PREFIX: &str = "ratelimit";

fn escape(component: &str) -> Cow<'_, str> {
    if !component.contains([':', '%']) {
        return Cow::Borrowed(component);
    }
    let mut escaped = String::with_capacity(component.len() + 4);
    for ch in component.chars() {
        match ch {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            other => escaped.push(other),
        }
    }
    Cow::Owned(escaped)
}

/// Key for requests made by an authenticated user against a route
pub fn user_key(user_id: &str, route: &str) -> String {
    format!("{PREFIX}:user:{}:{}", escape(user_id), escape(route))
}

/// Key for requests from a client address against a route
pub fn ip_key(ip: &str, route: &str) -> String {
    format!("{PREFIX}:ip:{}:{}", escape(ip), escape(route))
}

/// Key shared by every caller of a route
pub fn global_key(route: &str) -> String {
    format!("{PREFIX}:global:{}", escape(route))
}
