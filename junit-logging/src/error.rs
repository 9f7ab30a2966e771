//! Typed failures of the capture sink.
//!
//! Render and attribution problems are reported as data by the core
//! ([`crate::core::render::RenderFailure`], [`crate::core::resolver::Unresolved`]);
//! only sink installation has an error type of its own.

/// The capture sink could not be installed or removed.
///
/// Recoverable: the coordinator logs it once and continues the run without
/// captured logs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("capture slot already holds run '{session_id}'")]
    SlotOccupied { session_id: String },
    #[error("capture slot lock poisoned")]
    Poisoned,
}
