//! Tracing subscriber setup for kiosk hosts.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install a compact stdout subscriber.
///
/// `RUST_LOG` takes precedence; otherwise `default_filter` is used (for
/// example `"info,kiosk_voice=debug"`). Calling this more than once is
/// harmless: later calls leave the first subscriber in place.
pub fn init_tracing(default_filter: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(true)
                .with_thread_names(true),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(default_filter, "Tracing initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        init_tracing("warn");
        init_tracing("debug");
    }
}
