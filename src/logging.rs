//! Subscriber setup for binaries and tests embedding the engine.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to the host process.

use tracing_subscriber::EnvFilter;

/// Installs a formatted subscriber. `filter` overrides `RUST_LOG`; the
/// fallback is `info`. Calling this twice is harmless.
pub fn init_tracing(filter: Option<&str>) {
    let env_filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}
