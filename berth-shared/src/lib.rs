//! berth shared code
//!
//! Error types and wire-format constants used by the orchestration library,
//! the CLI and the test utilities.

pub mod constants;
pub mod errors;

pub use errors::{BerthError, BerthResult};
