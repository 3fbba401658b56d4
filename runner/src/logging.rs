//! Development-time tracing for debugging runs.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of the run's product output.
//!
//! - **Notifications (`io/report`)**: the JSON-lines progress stream on stdout.
//!   Always written, unaffected by `RUST_LOG`.
//!
//! - **Case logs (`io/case_log`)**: the durable audit record of a run.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber for development logging.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset.
/// Output: stderr, compact format. Worker processes call this too, so their
/// diagnostics interleave with the coordinator's on the same stderr.
///
/// # Example
/// ```bash
/// RUST_LOG=codemod_runner=debug codemod-runner run ./src --transform rename.j2
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
