//! Debugger engine for build-script interpreters.
//!
//! The interpreter calls [`Debugger::pre_run_hook`] before every statement
//! and [`Debugger::error_hook`] on failures; remote protocol frontends drive
//! the engine from another thread through registry methods and
//! [`PauseContext`]. See the `cmdbg-server` crate for the wire protocols.

mod breakpoint;
mod engine;
mod error;
mod host;
mod listener;
mod pause;
mod script;
mod trace;
mod watch;

pub use breakpoint::{Breakpoint, WatchMask, Watchpoint, LINE_ANY};
pub use engine::{Debugger, DebuggerState};
pub use error::DebugError;
pub use host::DebugHost;
pub use listener::{DebugListener, StateView};
pub use pause::PauseContext;
pub use script::{Backtrace, BacktraceFrame, FrameType, ScriptLocation};
pub use watch::{VariableAccess, VariableWatch, WatchCallback};

#[cfg(test)]
mod tests;
