//! Telemetry helpers for structured logging and tracing.

use tracing_subscriber::EnvFilter;

/// Default directive used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Install a default env-based subscriber if none is set.
///
/// Library code never calls this; hosting binaries and tests opt in.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    install(filter);
}

/// Install a subscriber with an explicit filter directive (e.g.
/// `"prometheus_command_bus=debug"`), ignoring `RUST_LOG`.
pub fn init_tracing_with(directive: &str) {
    install(EnvFilter::new(directive));
}

fn install(filter: EnvFilter) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
