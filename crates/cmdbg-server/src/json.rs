//! JSON request/response protocol with pushed state updates.

use std::sync::Arc;

use cmdbg_engine::{Backtrace, Debugger, DebuggerState, DebugListener, StateView, WatchMask};
use serde::Serialize;
use serde_json::Value;

use crate::connection::Connection;
use crate::error::ServerError;
#[cfg(unix)]
use crate::framing::EnvelopeStrategy;
use crate::framing::JsonStrategy;
use crate::handle::{wake_channel, EventSender};
use crate::server::{DebugServer, ServerHandler};

const ERR_RUNNING_CONTEXT: &str = "Improper command for running context";

/// The JSON frontend: one request object per balanced-brace frame.
pub struct JsonProtocol {
    debugger: Debugger,
}

impl JsonProtocol {
    /// Serve JSON over TCP with balanced-brace framing.
    pub fn serve_tcp(debugger: &Debugger, port: u16) -> Result<DebugServer, ServerError> {
        Self::serve(debugger, Connection::tcp(port, Box::new(JsonStrategy)))
    }

    /// Serve JSON over a named pipe, framed by server envelopes.
    #[cfg(unix)]
    pub fn serve_pipe(
        debugger: &Debugger,
        path: impl Into<std::path::PathBuf>,
    ) -> Result<DebugServer, ServerError> {
        Self::serve(
            debugger,
            Connection::pipe(path, Box::new(EnvelopeStrategy::default())),
        )
    }

    /// Serve JSON over an arbitrary connection. The framing strategy must
    /// only ever hand back complete JSON objects.
    pub fn serve(debugger: &Debugger, connection: Connection) -> Result<DebugServer, ServerError> {
        let (events, queue) = wake_channel();
        debugger.add_listener(Arc::new(JsonListener {
            events: events.clone(),
        }));
        let handler = Arc::new(JsonProtocol {
            debugger: debugger.clone(),
        });
        DebugServer::serve(debugger.clone(), handler, vec![connection], events, queue)
    }
}

impl ServerHandler for JsonProtocol {
    fn process_request(&self, connection: &mut Connection, request: &str) {
        let Ok(value) = serde_json::from_str::<Value>(request) else {
            return;
        };
        let Some(command) = value.get("Command").and_then(Value::as_str) else {
            return;
        };
        let debugger = &self.debugger;

        match command {
            "Break" => {
                debugger.break_now();
                connection.write_data(&state_update(debugger));
            }
            "ClearBreakpoints" => debugger.clear_all_breakpoints(),
            "AddBreakpoint" => {
                if let (Some(file), Some(line)) = (
                    value.get("File").and_then(Value::as_str),
                    value.get("Line").and_then(Value::as_u64),
                ) {
                    debugger.set_breakpoint(file, line);
                }
            }
            "RemoveBreakpoint" => {
                if let (Some(file), Some(line)) = (
                    value.get("File").and_then(Value::as_str),
                    value.get("Line").and_then(Value::as_u64),
                ) {
                    debugger.clear_breakpoints_at(file, line);
                }
            }
            "AddWatchpoint" => {
                if let Some(expr) = value.get("Expr").and_then(Value::as_str) {
                    let mask = match value.get("Type").and_then(Value::as_str) {
                        Some("Read") => WatchMask::READ,
                        Some("All") => WatchMask::ALL,
                        _ => WatchMask::WRITE,
                    };
                    debugger.set_watchpoint(expr, mask);
                }
            }
            "RemoveWatchpoint" => {
                if let Some(expr) = value.get("Expr").and_then(Value::as_str) {
                    for watchpoint in debugger.watchpoints() {
                        if watchpoint.variable == expr {
                            debugger.clear_watchpoint(watchpoint.id);
                        }
                    }
                }
            }
            "ClearWatchpoints" => debugger.clear_all_watchpoints(),
            "Continue" | "StepIn" | "StepOut" | "StepOver" | "Evaluate" => {
                let mut ctx = debugger.pause_context();
                if !ctx.valid() {
                    let report = serde_json::json!({ "Error": ERR_RUNNING_CONTEXT });
                    connection.write_data(&report.to_string());
                    return;
                }
                match command {
                    "Continue" => {
                        let _ = ctx.resume();
                    }
                    "StepIn" => {
                        let _ = ctx.step_into();
                    }
                    "StepOut" => {
                        let _ = ctx.step_out();
                    }
                    "StepOver" => {
                        let _ = ctx.step_over();
                    }
                    _ => {
                        // Evaluate: a quoted request is expanded, anything
                        // else is looked up as a variable.
                        let request_text =
                            value.get("Request").and_then(Value::as_str).unwrap_or("");
                        let quoted = request_text.len() >= 2
                            && request_text.starts_with('"')
                            && request_text.ends_with('"');
                        let result = if quoted {
                            ctx.expand(request_text).ok()
                        } else {
                            ctx.definition(request_text).ok().flatten()
                        };

                        let mut echo = value.as_object().cloned().unwrap_or_default();
                        echo.remove("Command");
                        echo.insert(
                            "Response".to_string(),
                            result.map_or(Value::Bool(false), Value::String),
                        );
                        connection.write_data(&Value::Object(echo).to_string());
                    }
                }
            }
            _ => {}
        }
    }

    fn on_connected(&self, connection: &mut Connection) {
        connection.write_data(&state_update(&self.debugger));
    }

    fn on_signal(&self, signum: i32) -> bool {
        if signum == 2 {
            self.debugger.break_now();
            return true;
        }
        false
    }
}

/// Listener side: every state transition pushes a fresh update.
struct JsonListener {
    events: EventSender,
}

impl DebugListener for JsonListener {
    fn on_change_state(&self, view: &StateView<'_>) {
        self.events.broadcast(state_update_from_view(view));
    }
}

#[derive(Serialize)]
struct StateUpdate {
    #[serde(rename = "PID")]
    pid: u32,
    #[serde(rename = "State")]
    state: &'static str,
    #[serde(rename = "Backtrace", skip_serializing_if = "Option::is_none")]
    backtrace: Option<Vec<StackEntry>>,
}

#[derive(Serialize)]
struct StackEntry {
    #[serde(rename = "ID")]
    id: u64,
    #[serde(rename = "File")]
    file: String,
    #[serde(rename = "Line")]
    line: u64,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Type")]
    frame_type: &'static str,
}

fn backtrace_entries(backtrace: &Backtrace) -> Vec<StackEntry> {
    backtrace
        .frames()
        .iter()
        .filter(|frame| frame.location.line != 0)
        .enumerate()
        .map(|(id, frame)| StackEntry {
            id: id as u64,
            file: frame.location.path.clone(),
            line: frame.location.line,
            name: frame.location.name.to_string(),
            frame_type: frame.frame_type.as_str(),
        })
        .collect()
}

fn render(update: &StateUpdate) -> String {
    serde_json::to_string(update).unwrap_or_else(|_| String::from("{}"))
}

/// State update built on the reactor thread.
fn state_update(debugger: &Debugger) -> String {
    let state = debugger.state();
    let backtrace = if state == DebuggerState::Paused {
        let ctx = debugger.pause_context();
        ctx.backtrace().ok().map(|bt| backtrace_entries(&bt))
    } else {
        None
    };
    render(&StateUpdate {
        pid: std::process::id(),
        state: state.as_str(),
        backtrace,
    })
}

/// State update built inside a listener callback, where the interpreter
/// thread already owns the engine.
fn state_update_from_view(view: &StateView<'_>) -> String {
    let state = view.state();
    let backtrace =
        (state == DebuggerState::Paused).then(|| backtrace_entries(&view.backtrace()));
    render(&StateUpdate {
        pid: std::process::id(),
        state: state.as_str(),
        backtrace,
    })
}
