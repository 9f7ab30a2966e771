//! Deterministic, pure logic of the capture engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! records and trees and return deterministic outputs suitable for tests.

pub mod render;
pub mod resolver;
pub mod tagger;
pub mod types;
