//! Captures log records emitted during a test run, attributes each record to
//! the tests it belongs to, and embeds them as `<logs>` in a JUnit XML report.
//!
//! - **[`core`]**: Pure, deterministic logic (tagging, distribution, rendering).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting pieces (the `tracing` capture layer, run state,
//!   config files, capture dumps, report files).
//!
//! [`coordinator`] wires host lifecycle hooks to both; [`merge`] implements the
//! offline CLI commands on top of a capture dump.

pub mod coordinator;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod merge;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

#[doc(hidden)]
pub use tracing as __tracing;
