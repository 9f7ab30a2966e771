//! Stable exit codes for `junit-logging` CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid config, report, capture dump, or other errors.
pub const INVALID: i32 = 1;
