//! Engine errors.

use thiserror::Error;

/// Errors surfaced by the debugger engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DebugError {
    /// A command was issued through a pause context that no longer holds
    /// the engine paused.
    #[error("attempt to {0} with an invalid pause context")]
    InvalidContext(&'static str),
}
