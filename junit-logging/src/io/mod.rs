//! I/O side of capture: the `tracing` layer, run state, and files.

pub mod config;
pub mod report;
pub mod run_state;
pub mod sink;
