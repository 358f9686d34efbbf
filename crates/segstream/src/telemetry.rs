//! Logging setup for binaries embedding the engine.

use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Installs a global subscriber. `RUST_LOG` wins over `verbose` when set.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing(verbose: bool) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { Level::DEBUG } else { Level::INFO };
        EnvFilter::default().add_directive(level.into())
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(verbose))
        .try_init()
        .is_ok()
}

/// Test subscriber writing through the libtest capture.
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}
