//! Listener fan-out.

use crate::engine::{DebuggerShared, DebuggerState, MasterState};
use crate::script::{Backtrace, ScriptLocation};
use crate::watch::VariableAccess;

/// Read-only view of the engine handed to listener callbacks.
///
/// Callbacks run on the interpreter thread while it holds the master mutex,
/// so they cannot acquire a pause context of their own. The view is the
/// permission token that replaces re-locking: it exposes everything a
/// listener may query during a state transition.
pub struct StateView<'a> {
    shared: &'a DebuggerShared,
    master: &'a MasterState,
}

impl<'a> StateView<'a> {
    pub(crate) fn new(shared: &'a DebuggerShared, master: &'a MasterState) -> Self {
        Self { shared, master }
    }

    /// Current engine state.
    #[must_use]
    pub fn state(&self) -> DebuggerState {
        self.shared.state()
    }

    /// Location of the statement the interpreter is stopped at.
    #[must_use]
    pub fn current_line(&self) -> &ScriptLocation {
        &self.master.current_location
    }

    /// Interpreter call stack.
    #[must_use]
    pub fn backtrace(&self) -> Backtrace {
        self.shared.host().backtrace()
    }

    /// Look up a variable in the current scope.
    #[must_use]
    pub fn definition(&self, name: &str) -> Option<String> {
        self.shared.host().definition(name)
    }
}

/// Observer of engine transitions.
///
/// Callbacks fire on the interpreter thread, in order: `on_breakpoint`
/// (when a breakpoint matched) then `on_change_state` for the pause, and
/// `on_change_state` again for the resume. Implementations must not block
/// on the reactor thread.
pub trait DebugListener: Send + Sync {
    /// The engine switched between running and paused.
    fn on_change_state(&self, _view: &StateView<'_>) {}

    /// A breakpoint matched the current statement.
    fn on_breakpoint(&self, _view: &StateView<'_>, _id: u64) {}

    /// A watchpoint fired; a pause follows.
    fn on_watchpoint(
        &self,
        _view: &StateView<'_>,
        _variable: &str,
        _access: VariableAccess,
        _new_value: Option<&str>,
    ) {
    }
}
