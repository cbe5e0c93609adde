//! Pause contexts.

use std::sync::MutexGuard;
use std::thread;
use std::time::{Duration, Instant};

use crate::engine::{DebuggerShared, DebuggerState, MasterState};
use crate::error::DebugError;
use crate::script::{Backtrace, ScriptLocation};

const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(100);
const RETRY_INTERVAL: Duration = Duration::from_millis(2);

/// Scoped capability to inspect and command a paused engine.
///
/// Acquisition try-locks the master mutex, which only succeeds while the
/// interpreter thread is parked inside its condition-variable wait. At most
/// one valid context exists at a time; an invalid one fails every operation
/// with [`DebugError::InvalidContext`]. Dropping the context releases the
/// engine (and wakes the interpreter if a resume command was issued).
pub struct PauseContext<'a> {
    shared: &'a DebuggerShared,
    guard: Option<MutexGuard<'a, MasterState>>,
}

impl<'a> PauseContext<'a> {
    pub(crate) fn acquire(shared: &'a DebuggerShared) -> Self {
        let mut guard = shared.master.try_lock().ok();
        // Losing the race right before the interpreter settles into its
        // wait is common, so a bounded retry keeps commands from spuriously
        // failing while the engine reports Paused.
        if guard.is_none() && shared.state() == DebuggerState::Paused {
            let deadline = Instant::now() + ACQUIRE_TIMEOUT;
            while guard.is_none() && Instant::now() < deadline {
                thread::sleep(RETRY_INTERVAL);
                guard = shared.master.try_lock().ok();
            }
        }
        if shared.state() != DebuggerState::Paused {
            guard = None;
        }
        Self { shared, guard }
    }

    /// Whether the context took control of a paused engine.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.guard.is_some()
    }

    fn locked(&self, op: &'static str) -> Result<&MutexGuard<'a, MasterState>, DebugError> {
        self.guard.as_ref().ok_or(DebugError::InvalidContext(op))
    }

    /// Location the interpreter is paused at.
    pub fn current_line(&self) -> Result<ScriptLocation, DebugError> {
        Ok(self.locked("access the current line")?.current_location.clone())
    }

    /// Call stack of the paused interpreter.
    pub fn backtrace(&self) -> Result<Backtrace, DebugError> {
        self.locked("access the backtrace")?;
        Ok(self.shared.host().backtrace())
    }

    /// Look up a variable in the paused interpreter's scope.
    pub fn definition(&self, name: &str) -> Result<Option<String>, DebugError> {
        self.locked("read a variable")?;
        Ok(self.shared.host().definition(name))
    }

    /// Expand variable references inside `input`.
    pub fn expand(&self, input: &str) -> Result<String, DebugError> {
        self.locked("expand a string")?;
        Ok(self.shared.host().expand(input))
    }

    /// Resume execution.
    pub fn resume(&mut self) -> Result<(), DebugError> {
        let guard = self
            .guard
            .as_mut()
            .ok_or(DebugError::InvalidContext("continue"))?;
        self.shared.continue_locked(guard);
        Ok(())
    }

    /// Run to the next statement at the current stack depth.
    pub fn step_over(&mut self) -> Result<(), DebugError> {
        let depth = {
            self.locked("step")?;
            self.shared.host().backtrace().depth()
        };
        let guard = self.guard.as_mut().ok_or(DebugError::InvalidContext("step"))?;
        guard.break_depth = depth as i32;
        self.shared.continue_locked(guard);
        Ok(())
    }

    /// Pause again at the very next statement, whatever its depth.
    pub fn step_into(&mut self) -> Result<(), DebugError> {
        let guard = self
            .guard
            .as_mut()
            .ok_or(DebugError::InvalidContext("step in"))?;
        self.shared.request_break();
        self.shared.continue_locked(guard);
        Ok(())
    }

    /// Run until the current frame returns to its caller.
    pub fn step_out(&mut self) -> Result<(), DebugError> {
        let depth = {
            self.locked("step out")?;
            self.shared.host().backtrace().depth()
        };
        let guard = self
            .guard
            .as_mut()
            .ok_or(DebugError::InvalidContext("step out"))?;
        guard.break_depth = depth as i32 - 1;
        self.shared.continue_locked(guard);
        Ok(())
    }
}
