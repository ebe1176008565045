// Tracing initialisation
//
// Console output filtered by RUST_LOG, falling back to the given default directive.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber
///
/// `default_filter` is used when `RUST_LOG` is unset or invalid, e.g.
/// `"breakwater_resilience=info,breakwater_http=info"`. Returns `false` when a
/// subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(default_filter, "Tracing initialized");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected() {
        // The first call may lose to another test's subscriber; the second never wins
        init_tracing("info");
        assert!(!init_tracing("debug"));
    }
}
