//! Logging setup for hosts and tests.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_DIRECTIVES: &str = "mailsync_core=debug";

/// Install a global `tracing` subscriber with an env filter and fmt output.
///
/// `RUST_LOG` takes precedence over `default_directives`. Returns `false` if a
/// subscriber was already installed, so repeated calls are harmless.
pub fn init_tracing(default_directives: &str) -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directives.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_rejected() {
        let _ = init_tracing(DEFAULT_DIRECTIVES);
        assert!(!init_tracing(DEFAULT_DIRECTIVES));
    }
}
