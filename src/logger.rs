//! Logging setup for tests and binaries embedding the solver.
//!
//! The library itself only emits `tracing` events (solver progress at
//! INFO, per-iteration detail at DEBUG, throttled projection failures at
//! WARN); hosts that already install their own subscriber should skip
//! this module entirely.

use tracing::Level;

/// Install a compact subscriber at INFO level, overrideable through
/// `RUST_LOG` (e.g. `RUST_LOG=jitter_solver=debug` to watch individual
/// iterations).
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Install a compact subscriber with a custom default level.
///
/// Solver logs are read against the progress of a single solve, so lines
/// are stamped with time elapsed since startup rather than wall-clock
/// time.
pub fn init_logger_with_level(default_level: Level) {
    tracing_subscriber::fmt()
        .compact()
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .init();
}
