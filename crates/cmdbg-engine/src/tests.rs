//! Engine tests with a scripted interpreter on its own thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::{
    Backtrace, BacktraceFrame, Debugger, DebuggerState, DebugHost, DebugListener, FrameType,
    ScriptLocation, StateView, VariableAccess, VariableWatch, WatchMask,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

const SCRIPT_PATH: &str = "/x/CMakeLists.txt";

struct TestHost {
    watch: VariableWatch,
    vars: Mutex<HashMap<String, String>>,
    depth: AtomicUsize,
}

impl TestHost {
    fn new() -> Arc<TestHost> {
        Arc::new(TestHost {
            watch: VariableWatch::new(),
            vars: Mutex::new(HashMap::new()),
            depth: AtomicUsize::new(1),
        })
    }

    fn set_var(&self, name: &str, value: &str) {
        self.vars
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
        self.watch
            .notify(name, VariableAccess::Modified, Some(value));
    }
}

impl DebugHost for TestHost {
    fn backtrace(&self) -> Backtrace {
        let depth = self.depth.load(Ordering::SeqCst);
        Backtrace::new(
            (0..depth)
                .map(|i| BacktraceFrame {
                    location: ScriptLocation::new(SCRIPT_PATH, (depth - i) as u64, "frame"),
                    frame_type: FrameType::FunctionCall,
                })
                .collect(),
        )
    }

    fn definition(&self, name: &str) -> Option<String> {
        let value = self.vars.lock().unwrap().get(name).cloned();
        match &value {
            Some(value) => self.watch.notify(name, VariableAccess::Read, Some(value)),
            None => self.watch.notify(name, VariableAccess::UnknownRead, None),
        }
        value
    }

    fn expand(&self, input: &str) -> String {
        let mut output = input.to_string();
        let vars = self.vars.lock().unwrap();
        for (name, value) in vars.iter() {
            output = output.replace(&format!("${{{name}}}"), value);
        }
        output
    }

    fn watch(&self) -> &VariableWatch {
        &self.watch
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EngineEvent {
    State(DebuggerState, u64),
    Breakpoint(u64),
    Watchpoint(String, VariableAccess, Option<String>),
}

struct RecordingListener {
    tx: Mutex<Sender<EngineEvent>>,
}

impl RecordingListener {
    fn create(debugger: &Debugger) -> Receiver<EngineEvent> {
        let (tx, rx) = channel();
        debugger.add_listener(Arc::new(RecordingListener { tx: Mutex::new(tx) }));
        rx
    }

    fn send(&self, event: EngineEvent) {
        let _ = self.tx.lock().unwrap().send(event);
    }
}

impl DebugListener for RecordingListener {
    fn on_change_state(&self, view: &StateView<'_>) {
        self.send(EngineEvent::State(view.state(), view.current_line().line));
    }

    fn on_breakpoint(&self, _view: &StateView<'_>, id: u64) {
        self.send(EngineEvent::Breakpoint(id));
    }

    fn on_watchpoint(
        &self,
        _view: &StateView<'_>,
        variable: &str,
        access: VariableAccess,
        new_value: Option<&str>,
    ) {
        self.send(EngineEvent::Watchpoint(
            variable.to_string(),
            access,
            new_value.map(str::to_string),
        ));
    }
}

enum Stmt {
    Run { line: u64, depth: usize },
    Set { line: u64, var: &'static str, value: &'static str },
}

fn run_script(debugger: &Debugger, host: &Arc<TestHost>, script: Vec<Stmt>) -> JoinHandle<()> {
    let debugger = debugger.clone();
    let host = Arc::clone(host);
    thread::spawn(move || {
        for stmt in script {
            match stmt {
                Stmt::Run { line, depth } => {
                    host.depth.store(depth, Ordering::SeqCst);
                    debugger.pre_run_hook(ScriptLocation::new(SCRIPT_PATH, line, "command"));
                }
                Stmt::Set { line, var, value } => {
                    host.depth.store(1, Ordering::SeqCst);
                    debugger.pre_run_hook(ScriptLocation::new(SCRIPT_PATH, line, "set"));
                    host.set_var(var, value);
                }
            }
        }
    })
}

fn expect_event(rx: &Receiver<EngineEvent>) -> EngineEvent {
    rx.recv_timeout(RECV_TIMEOUT).expect("expected engine event")
}

fn expect_state(rx: &Receiver<EngineEvent>, state: DebuggerState, line: u64) {
    assert_eq!(expect_event(rx), EngineEvent::State(state, line));
}

/// Run a command against the engine once it becomes commandable.
fn with_context(debugger: &Debugger, f: impl Fn(&mut crate::PauseContext<'_>)) {
    let deadline = Instant::now() + RECV_TIMEOUT;
    loop {
        let mut ctx = debugger.pause_context();
        if ctx.valid() {
            f(&mut ctx);
            return;
        }
        assert!(Instant::now() < deadline, "engine never became commandable");
        thread::sleep(Duration::from_millis(5));
    }
}

fn resume(debugger: &Debugger) {
    with_context(debugger, |ctx| ctx.resume().unwrap());
}

#[test]
fn pauses_on_attach_and_resumes() {
    let host = TestHost::new();
    let debugger = Debugger::new(host.clone());
    let rx = RecordingListener::create(&debugger);
    assert_eq!(debugger.state(), DebuggerState::Unknown);

    let script = run_script(&debugger, &host, vec![Stmt::Run { line: 1, depth: 1 }]);
    expect_state(&rx, DebuggerState::Paused, 1);

    resume(&debugger);
    expect_state(&rx, DebuggerState::Running, 1);
    script.join().unwrap();
}

#[test]
fn ids_are_unique_across_both_registries() {
    let host = TestHost::new();
    let debugger = Debugger::new(host);

    let mut ids = vec![
        debugger.set_breakpoint("a.txt", 1),
        debugger.set_watchpoint("A", WatchMask::WRITE),
        debugger.set_breakpoint("b.txt", 2),
        debugger.set_watchpoint("B", WatchMask::READ),
        debugger.set_breakpoint("c.txt", 3),
    ];
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 5);
}

#[test]
fn breakpoint_notifies_then_pauses() {
    let host = TestHost::new();
    let debugger = Debugger::new(host.clone());
    let rx = RecordingListener::create(&debugger);
    let id = debugger.set_breakpoint("CMakeLists.txt", 3);

    let script = run_script(
        &debugger,
        &host,
        (1..=4).map(|line| Stmt::Run { line, depth: 1 }).collect(),
    );
    expect_state(&rx, DebuggerState::Paused, 1);
    resume(&debugger);
    expect_state(&rx, DebuggerState::Running, 1);

    assert_eq!(expect_event(&rx), EngineEvent::Breakpoint(id));
    expect_state(&rx, DebuggerState::Paused, 3);
    resume(&debugger);
    expect_state(&rx, DebuggerState::Running, 3);
    script.join().unwrap();
}

#[test]
fn step_over_skips_deeper_frames() {
    let host = TestHost::new();
    let debugger = Debugger::new(host.clone());
    let rx = RecordingListener::create(&debugger);

    let script = run_script(
        &debugger,
        &host,
        vec![
            Stmt::Run { line: 1, depth: 1 },
            Stmt::Run { line: 2, depth: 2 },
            Stmt::Run { line: 3, depth: 2 },
            Stmt::Run { line: 4, depth: 1 },
        ],
    );
    expect_state(&rx, DebuggerState::Paused, 1);
    with_context(&debugger, |ctx| ctx.step_over().unwrap());
    expect_state(&rx, DebuggerState::Running, 1);

    // Lines 2 and 3 run at depth 2 without pausing.
    expect_state(&rx, DebuggerState::Paused, 4);
    resume(&debugger);
    expect_state(&rx, DebuggerState::Running, 4);
    script.join().unwrap();
}

#[test]
fn step_into_pauses_at_next_statement() {
    let host = TestHost::new();
    let debugger = Debugger::new(host.clone());
    let rx = RecordingListener::create(&debugger);

    let script = run_script(
        &debugger,
        &host,
        vec![
            Stmt::Run { line: 1, depth: 1 },
            Stmt::Run { line: 2, depth: 2 },
            Stmt::Run { line: 3, depth: 1 },
        ],
    );
    expect_state(&rx, DebuggerState::Paused, 1);
    with_context(&debugger, |ctx| ctx.step_into().unwrap());
    expect_state(&rx, DebuggerState::Running, 1);

    expect_state(&rx, DebuggerState::Paused, 2);
    resume(&debugger);
    expect_state(&rx, DebuggerState::Running, 2);
    script.join().unwrap();
}

#[test]
fn step_out_pauses_at_caller_depth() {
    let host = TestHost::new();
    let debugger = Debugger::new(host.clone());
    let rx = RecordingListener::create(&debugger);
    let id = debugger.set_breakpoint("CMakeLists.txt", 2);

    let script = run_script(
        &debugger,
        &host,
        vec![
            Stmt::Run { line: 1, depth: 1 },
            Stmt::Run { line: 2, depth: 2 },
            Stmt::Run { line: 3, depth: 2 },
            Stmt::Run { line: 4, depth: 1 },
        ],
    );
    expect_state(&rx, DebuggerState::Paused, 1);
    resume(&debugger);
    expect_state(&rx, DebuggerState::Running, 1);

    assert_eq!(expect_event(&rx), EngineEvent::Breakpoint(id));
    expect_state(&rx, DebuggerState::Paused, 2);
    with_context(&debugger, |ctx| ctx.step_out().unwrap());
    expect_state(&rx, DebuggerState::Running, 2);

    // Line 3 stays at depth 2; line 4 is back at the caller.
    expect_state(&rx, DebuggerState::Paused, 4);
    resume(&debugger);
    expect_state(&rx, DebuggerState::Running, 4);
    script.join().unwrap();
}

#[test]
fn at_most_one_pause_context() {
    let host = TestHost::new();
    let debugger = Debugger::new(host.clone());
    let rx = RecordingListener::create(&debugger);

    let script = run_script(&debugger, &host, vec![Stmt::Run { line: 1, depth: 1 }]);
    expect_state(&rx, DebuggerState::Paused, 1);

    let deadline = Instant::now() + RECV_TIMEOUT;
    let first = loop {
        let ctx = debugger.pause_context();
        if ctx.valid() {
            break ctx;
        }
        assert!(Instant::now() < deadline, "engine never became commandable");
        thread::sleep(Duration::from_millis(5));
    };

    let other = debugger.clone();
    let second_valid = thread::spawn(move || other.pause_context().valid())
        .join()
        .unwrap();
    assert!(first.valid());
    assert!(!second_valid);

    drop(first);
    resume(&debugger);
    script.join().unwrap();
}

#[test]
fn watchpoint_write_pauses_with_value() {
    let host = TestHost::new();
    let debugger = Debugger::new(host.clone());
    let rx = RecordingListener::create(&debugger);
    debugger.set_watchpoint("FOO", WatchMask::WRITE);

    let script = run_script(
        &debugger,
        &host,
        vec![
            Stmt::Run { line: 1, depth: 1 },
            Stmt::Set { line: 2, var: "FOO", value: "bar" },
        ],
    );
    expect_state(&rx, DebuggerState::Paused, 1);
    resume(&debugger);
    expect_state(&rx, DebuggerState::Running, 1);

    assert_eq!(
        expect_event(&rx),
        EngineEvent::Watchpoint(
            "FOO".to_string(),
            VariableAccess::Modified,
            Some("bar".to_string())
        )
    );
    expect_state(&rx, DebuggerState::Paused, 2);
    resume(&debugger);
    expect_state(&rx, DebuggerState::Running, 2);
    script.join().unwrap();
}

#[test]
fn read_watch_during_pause_does_not_re_pause() {
    let host = TestHost::new();
    let debugger = Debugger::new(host.clone());
    let rx = RecordingListener::create(&debugger);
    debugger.set_watchpoint("FOO", WatchMask::ALL);
    host.vars
        .lock()
        .unwrap()
        .insert("FOO".to_string(), "bar".to_string());

    let script = run_script(&debugger, &host, vec![Stmt::Run { line: 1, depth: 1 }]);
    expect_state(&rx, DebuggerState::Paused, 1);

    // Inspecting the variable fires the read watch on this thread; a paused
    // engine must swallow it instead of pausing again.
    with_context(&debugger, |ctx| {
        assert_eq!(ctx.definition("FOO").unwrap().as_deref(), Some("bar"));
    });
    assert_eq!(debugger.state(), DebuggerState::Paused);

    resume(&debugger);
    expect_state(&rx, DebuggerState::Running, 1);
    script.join().unwrap();

    // The swallowed hit produced no watchpoint notification.
    let leftover: Vec<EngineEvent> = rx.try_iter().collect();
    assert!(leftover
        .iter()
        .all(|event| !matches!(event, EngineEvent::Watchpoint(..))));
}

#[test]
fn watch_callback_after_teardown_is_noop() {
    let host = TestHost::new();
    let debugger = Debugger::new(host.clone());
    debugger.set_watchpoint("FOO", WatchMask::WRITE);
    assert_eq!(host.watch.watch_count("FOO"), 1);

    let callbacks = host.watch.callbacks_for("FOO");
    drop(debugger);
    assert_eq!(host.watch.watch_count("FOO"), 0);

    // The watch system may still hold the callback; firing it now must do
    // nothing.
    for callback in callbacks {
        callback("FOO", VariableAccess::Modified, Some("bar"));
    }
}

#[test]
fn commands_fail_without_a_paused_engine() {
    let host = TestHost::new();
    let debugger = Debugger::new(host);

    let mut ctx = debugger.pause_context();
    assert!(!ctx.valid());
    assert!(ctx.current_line().is_err());
    assert!(ctx.backtrace().is_err());
    assert!(ctx.resume().is_err());
    assert!(ctx.step_over().is_err());
    assert!(ctx.step_into().is_err());
    assert!(ctx.step_out().is_err());
}

#[test]
fn clearing_registries_reports_removals() {
    let host = TestHost::new();
    let debugger = Debugger::new(host.clone());

    let bp = debugger.set_breakpoint("foo.txt", 10);
    debugger.set_breakpoint("foo.txt", 11);
    let wp = debugger.set_watchpoint("FOO", WatchMask::READ);

    assert!(debugger.clear_breakpoint(bp));
    assert!(!debugger.clear_breakpoint(bp));
    assert_eq!(debugger.clear_breakpoints_at("/a/foo.txt", 11), 1);
    assert!(debugger.breakpoints().is_empty());

    assert!(debugger.clear_watchpoint(wp));
    assert!(!debugger.clear_watchpoint(wp));
    assert_eq!(host.watch.watch_count("FOO"), 0);
    assert!(debugger.watchpoints().is_empty());
}

#[test]
fn error_hook_honors_break_on_error() {
    let host = TestHost::new();
    let debugger = Debugger::new(host.clone());
    let rx = RecordingListener::create(&debugger);

    debugger.set_break_on_error(false);
    debugger.error_hook(&ScriptLocation::new(SCRIPT_PATH, 7, "bad"));
    assert_eq!(debugger.state(), DebuggerState::Unknown);

    debugger.set_break_on_error(true);
    let worker = {
        let debugger = debugger.clone();
        thread::spawn(move || {
            debugger.pre_run_hook(ScriptLocation::new(SCRIPT_PATH, 7, "bad"));
            debugger.error_hook(&ScriptLocation::new(SCRIPT_PATH, 7, "bad"));
        })
    };
    expect_state(&rx, DebuggerState::Paused, 7);
    resume(&debugger);
    expect_state(&rx, DebuggerState::Running, 7);
    expect_state(&rx, DebuggerState::Paused, 7);
    resume(&debugger);
    expect_state(&rx, DebuggerState::Running, 7);
    worker.join().unwrap();
}
