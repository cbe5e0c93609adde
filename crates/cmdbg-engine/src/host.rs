//! Interpreter-side surface consumed by the engine.

use crate::script::Backtrace;
use crate::watch::VariableWatch;

/// Access to the interpreter the debugger is attached to.
///
/// The interpreter implements this once and hands the engine an
/// `Arc<dyn DebugHost>`. All methods may be called from either the
/// interpreter thread (inside hooks and listener callbacks) or the reactor
/// thread (through a valid pause context), so implementations must be
/// thread-safe. A variable lookup is expected to report the access to the
/// watch registry, exactly as it would for a script-driven read.
pub trait DebugHost: Send + Sync {
    /// Current call stack, most recent frame first.
    fn backtrace(&self) -> Backtrace;

    /// Look up a variable in the current scope.
    fn definition(&self, name: &str) -> Option<String>;

    /// Expand variable references inside `input`.
    fn expand(&self, input: &str) -> String;

    /// The variable-watch registry watchpoints are registered with.
    fn watch(&self) -> &VariableWatch;
}
