//! Development-time tracing.
//!
//! Tracing goes to stderr and is controlled by `RUST_LOG`. It is separate from
//! what flow records for users: job output sections and the per-job files
//! under `<plan>/.logs/` are always written.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn`, or `flow=debug` with `--verbose`.
///
/// # Example
/// ```bash
/// RUST_LOG=flow=debug flow plan run --all
/// ```
pub fn init(verbose: bool) {
    let default = if verbose { "warn,flow=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // Ignore a subscriber that is already installed.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
