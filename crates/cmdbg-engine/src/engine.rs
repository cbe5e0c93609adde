//! The debugger state machine.
//!
//! Two threads touch the engine: the interpreter thread, which calls the
//! hooks, and the reactor thread, which reaches in through registry methods
//! or a [`PauseContext`]. The master mutex plus its condition variable guard
//! pausing and resuming; breakpoints and watchpoints live behind a separate
//! registry mutex so clients can edit them while the interpreter runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use smol_str::SmolStr;

use crate::breakpoint::{Breakpoint, WatchMask, Watchpoint};
use crate::host::DebugHost;
use crate::listener::{DebugListener, StateView};
use crate::pause::PauseContext;
use crate::script::ScriptLocation;
use crate::trace::trace_debug;
use crate::watch::VariableAccess;

/// Execution state of the debugged interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggerState {
    /// No statement has run yet.
    Unknown,
    /// The interpreter is executing statements.
    Running,
    /// The interpreter is parked at a statement boundary.
    Paused,
}

impl DebuggerState {
    /// Wire name used by the JSON protocol.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DebuggerState::Unknown => "Unknown",
            DebuggerState::Running => "Running",
            DebuggerState::Paused => "Paused",
        }
    }

    fn from_u8(value: u8) -> DebuggerState {
        match value {
            1 => DebuggerState::Running,
            2 => DebuggerState::Paused,
            _ => DebuggerState::Unknown,
        }
    }
}

pub(crate) struct MasterState {
    pub(crate) current_location: ScriptLocation,
    pub(crate) continue_pending: bool,
    /// Stack depth at which the next step-style pause fires; -1 is inactive.
    pub(crate) break_depth: i32,
}

struct Registry {
    breakpoints: Vec<Breakpoint>,
    watchpoints: BTreeMap<u64, Weak<WatchpointRecord>>,
    next_id: u64,
}

/// Shared record backing a watchpoint.
///
/// The registry holds it weakly; the watch registry's callback holds it
/// strongly. The record in turn points weakly back at the engine, so a
/// callback that fires after the engine is gone is a no-op.
pub(crate) struct WatchpointRecord {
    pub(crate) id: u64,
    pub(crate) variable: SmolStr,
    pub(crate) mask: WatchMask,
    pub(crate) debugger: Weak<DebuggerShared>,
}

pub(crate) struct DebuggerShared {
    host: Arc<dyn DebugHost>,
    state: AtomicU8,
    break_pending: AtomicBool,
    break_on_error: AtomicBool,
    pub(crate) master: Mutex<MasterState>,
    pub(crate) resumed: Condvar,
    registry: Mutex<Registry>,
    listeners: Mutex<Vec<Arc<dyn DebugListener>>>,
}

impl DebuggerShared {
    pub(crate) fn state(&self) -> DebuggerState {
        DebuggerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: DebuggerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn host(&self) -> &dyn DebugHost {
        self.host.as_ref()
    }

    fn notify(&self, master: &MasterState, f: impl Fn(&dyn DebugListener, &StateView<'_>)) {
        let listeners = self
            .listeners
            .lock()
            .expect("listener set poisoned")
            .clone();
        let view = StateView::new(self, master);
        for listener in &listeners {
            f(listener.as_ref(), &view);
        }
    }

    /// Park the interpreter thread until a resume command arrives.
    ///
    /// The guard is released while waiting, which is the only moment a
    /// pause context can take the master mutex.
    fn pause_execution<'a>(
        &self,
        mut master: MutexGuard<'a, MasterState>,
    ) -> MutexGuard<'a, MasterState> {
        self.break_pending.store(false, Ordering::SeqCst);
        master.break_depth = -1;
        self.set_state(DebuggerState::Paused);
        trace_debug(&format!(
            "paused at {}:{}",
            master.current_location.path, master.current_location.line
        ));
        self.notify(&master, |listener, view| listener.on_change_state(view));

        master.continue_pending = false;
        while !master.continue_pending {
            master = self.resumed.wait(master).expect("master state poisoned");
        }

        self.set_state(DebuggerState::Running);
        self.notify(&master, |listener, view| listener.on_change_state(view));
        master
    }

    pub(crate) fn continue_locked(&self, master: &mut MasterState) {
        master.continue_pending = true;
        self.resumed.notify_all();
    }

    pub(crate) fn request_break(&self) {
        self.break_pending.store(true, Ordering::SeqCst);
    }

    /// A watched variable was accessed with a kind the watchpoint covers.
    ///
    /// When the access comes from the debugger itself inspecting state while
    /// paused, the reactor thread already holds the master mutex, so this
    /// must return before touching it.
    pub(crate) fn watch_hit(
        &self,
        variable: &str,
        access: VariableAccess,
        new_value: Option<&str>,
    ) {
        if self.state() == DebuggerState::Paused {
            return;
        }
        let master = self.master.lock().expect("master state poisoned");
        self.notify(&master, |listener, view| {
            listener.on_watchpoint(view, variable, access, new_value);
        });
        let _master = self.pause_execution(master);
    }
}

impl Drop for DebuggerShared {
    fn drop(&mut self) {
        if let Ok(registry) = self.registry.get_mut() {
            for (id, weak) in &registry.watchpoints {
                if let Some(record) = weak.upgrade() {
                    self.host.watch().remove_watch(&record.variable, *id);
                }
            }
            registry.watchpoints.clear();
        }
    }
}

/// Handle to the debugger engine. Cheap to clone; the engine is torn down
/// when the last handle drops.
#[derive(Clone)]
pub struct Debugger {
    shared: Arc<DebuggerShared>,
}

impl Debugger {
    /// Attach a new engine to an interpreter.
    ///
    /// The engine starts with a break pending, so the first statement after
    /// attach pauses and waits for a client.
    #[must_use]
    pub fn new(host: Arc<dyn DebugHost>) -> Self {
        Self {
            shared: Arc::new(DebuggerShared {
                host,
                state: AtomicU8::new(DebuggerState::Unknown as u8),
                break_pending: AtomicBool::new(true),
                break_on_error: AtomicBool::new(true),
                master: Mutex::new(MasterState {
                    current_location: ScriptLocation::default(),
                    continue_pending: false,
                    break_depth: -1,
                }),
                resumed: Condvar::new(),
                registry: Mutex::new(Registry {
                    breakpoints: Vec::new(),
                    watchpoints: BTreeMap::new(),
                    next_id: 1,
                }),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Current engine state.
    #[must_use]
    pub fn state(&self) -> DebuggerState {
        self.shared.state()
    }

    /// Called by the interpreter before every statement.
    pub fn pre_run_hook(&self, location: ScriptLocation) {
        let shared = &self.shared;
        let mut master = shared.master.lock().expect("master state poisoned");
        shared.set_state(DebuggerState::Running);
        master.current_location = location;

        // Step in / step out logic: pause when the stack returns to the
        // armed depth. Stepping stays ignorant of what the commands do.
        if master.break_depth >= 0 {
            let depth = shared.host.backtrace().depth();
            if depth == master.break_depth as usize {
                shared.break_pending.store(true, Ordering::SeqCst);
                master.break_depth = -1;
            }
        }

        let hit = {
            let registry = shared.registry.lock().expect("registry poisoned");
            registry
                .breakpoints
                .iter()
                .find(|bp| bp.matches_location(&master.current_location))
                .map(|bp| bp.id)
        };
        if let Some(id) = hit {
            shared.break_pending.store(true, Ordering::SeqCst);
            shared.notify(&master, |listener, view| listener.on_breakpoint(view, id));
        }

        if shared.break_pending.load(Ordering::SeqCst) {
            let _master = shared.pause_execution(master);
        }
    }

    /// Called by the interpreter when a statement failed.
    pub fn error_hook(&self, _location: &ScriptLocation) {
        if self.shared.break_on_error.load(Ordering::SeqCst) {
            let master = self.shared.master.lock().expect("master state poisoned");
            let _master = self.shared.pause_execution(master);
        }
    }

    /// Whether an error pauses execution (default: true).
    pub fn set_break_on_error(&self, flag: bool) {
        self.shared.break_on_error.store(flag, Ordering::SeqCst);
    }

    /// Arm a pause at the next statement boundary.
    pub fn break_now(&self) {
        self.shared.request_break();
    }

    /// Let a paused interpreter continue.
    ///
    /// Used by servers during shutdown; clients resume through a
    /// [`PauseContext`]. Harmless while the interpreter is running.
    pub fn resume(&self) {
        let mut master = self.shared.master.lock().expect("master state poisoned");
        self.shared.continue_locked(&mut master);
    }

    /// Try to take control of a paused engine.
    #[must_use]
    pub fn pause_context(&self) -> PauseContext<'_> {
        PauseContext::acquire(&self.shared)
    }

    /// Register a listener. The engine keeps it until teardown.
    pub fn add_listener(&self, listener: Arc<dyn DebugListener>) {
        self.shared
            .listeners
            .lock()
            .expect("listener set poisoned")
            .push(listener);
    }

    /// Drop every registered listener.
    pub fn clear_listeners(&self) {
        self.shared
            .listeners
            .lock()
            .expect("listener set poisoned")
            .clear();
    }

    /// Set a breakpoint; returns its id.
    pub fn set_breakpoint(&self, file: impl Into<String>, line: u64) -> u64 {
        let mut registry = self.shared.registry.lock().expect("registry poisoned");
        let id = registry.next_id;
        registry.next_id += 1;
        let breakpoint = Breakpoint::new(id, file, line);
        trace_debug(&format!(
            "breakpoint {id} at {}:{}",
            breakpoint.file, breakpoint.line
        ));
        registry.breakpoints.push(breakpoint);
        id
    }

    /// Remove the breakpoint with the given id.
    pub fn clear_breakpoint(&self, id: u64) -> bool {
        let mut registry = self.shared.registry.lock().expect("registry poisoned");
        let before = registry.breakpoints.len();
        registry.breakpoints.retain(|bp| bp.id != id);
        registry.breakpoints.len() != before
    }

    /// Remove every breakpoint matching the given path and line; returns the
    /// removed count.
    pub fn clear_breakpoints_at(&self, path: &str, line: u64) -> usize {
        let mut registry = self.shared.registry.lock().expect("registry poisoned");
        let before = registry.breakpoints.len();
        registry.breakpoints.retain(|bp| !bp.matches(path, line));
        before - registry.breakpoints.len()
    }

    /// Remove all breakpoints.
    pub fn clear_all_breakpoints(&self) {
        let mut registry = self.shared.registry.lock().expect("registry poisoned");
        registry.breakpoints.clear();
    }

    /// Snapshot of the breakpoint registry, in insertion order.
    #[must_use]
    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        let registry = self.shared.registry.lock().expect("registry poisoned");
        registry.breakpoints.clone()
    }

    /// Watch a variable; returns the watchpoint id.
    pub fn set_watchpoint(&self, variable: &str, mask: WatchMask) -> u64 {
        let mut registry = self.shared.registry.lock().expect("registry poisoned");
        let id = registry.next_id;
        registry.next_id += 1;
        let record = Arc::new(WatchpointRecord {
            id,
            variable: SmolStr::new(variable),
            mask,
            debugger: Arc::downgrade(&self.shared),
        });
        registry.watchpoints.insert(id, Arc::downgrade(&record));
        trace_debug(&format!("watchpoint {id} on '{variable}' ({mask})"));

        // The closure keeps the record alive inside the watch registry;
        // the engine back-reference stays weak (see WatchpointRecord).
        self.shared.host.watch().add_watch(
            variable,
            id,
            Arc::new(move |name, access, new_value| {
                let Some(debugger) = record.debugger.upgrade() else {
                    return;
                };
                if record.mask.intersects(WatchMask::for_access(access)) {
                    debugger.watch_hit(name, access, new_value);
                }
            }),
        );
        id
    }

    /// Remove the watchpoint with the given id.
    pub fn clear_watchpoint(&self, id: u64) -> bool {
        let mut registry = self.shared.registry.lock().expect("registry poisoned");
        let Some(weak) = registry.watchpoints.remove(&id) else {
            return false;
        };
        match weak.upgrade() {
            Some(record) => {
                self.shared.host.watch().remove_watch(&record.variable, id);
                true
            }
            None => false,
        }
    }

    /// Remove all watchpoints.
    pub fn clear_all_watchpoints(&self) {
        for watchpoint in self.watchpoints() {
            self.clear_watchpoint(watchpoint.id);
        }
    }

    /// Snapshot of the live watchpoints, ordered by id.
    #[must_use]
    pub fn watchpoints(&self) -> Vec<Watchpoint> {
        let registry = self.shared.registry.lock().expect("registry poisoned");
        registry
            .watchpoints
            .values()
            .filter_map(Weak::upgrade)
            .map(|record| Watchpoint {
                id: record.id,
                variable: record.variable.clone(),
                mask: record.mask,
            })
            .collect()
    }
}
