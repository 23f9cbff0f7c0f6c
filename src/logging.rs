//! Logging setup.
//!
//! The library only emits `tracing` events. Hosts that do not install their
//! own subscriber can call [`init`] once at startup; the filter is read from
//! `RUST_LOG` and defaults to `warn`.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "warn";

/// Install a formatted subscriber.
///
/// Does nothing if a global subscriber is already set.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
