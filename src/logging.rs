//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! The level filter comes from `SLUICE_LOG` (standard `EnvFilter` syntax,
//! e.g. `info` or `sluice=debug`), defaulting to `info`.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global logging subscriber.
///
/// Safe to call more than once; only the first call installs a subscriber
/// (later calls, e.g. from parallel tests, are no-ops).
pub fn init_logging() {
    let filter = EnvFilter::try_from_env("SLUICE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
