//! Diagnostics for the capture engine itself.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: engine diagnostics via `RUST_LOG`, output to
//!   stderr. Events under the `junit_logging` target are never captured into
//!   reports.
//!
//! - **Captured records (`io/sink`)**: product output. Every other event seen
//!   by the capture layer during a run ends up in the JUnit report.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber for the CLI.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=junit_logging=debug junit-logging merge --report junit.xml --capture capture.json
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
