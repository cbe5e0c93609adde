//! Line-oriented console protocol.

use std::sync::Arc;

use cmdbg_engine::{Debugger, DebuggerState, DebugListener, StateView, VariableAccess, WatchMask};

use crate::connection::Connection;
use crate::error::ServerError;
use crate::framing::LineStrategy;
use crate::handle::{wake_channel, EventSender};
use crate::server::{DebugServer, ServerHandler};

/// Prompt written after every command when prompting is enabled.
pub const PROMPT: &str = "(debugger) > ";

/// The gdb-flavoured console frontend.
pub struct ConsoleProtocol {
    debugger: Debugger,
    print_prompt: bool,
}

impl ConsoleProtocol {
    /// Serve the console over the inherited standard streams.
    pub fn serve_stdio(debugger: &Debugger) -> Result<DebugServer, ServerError> {
        Self::serve(debugger, Connection::stdio(Box::new(LineStrategy)), true)
    }

    /// Serve the console over TCP.
    pub fn serve_tcp(debugger: &Debugger, port: u16) -> Result<DebugServer, ServerError> {
        Self::serve(debugger, Connection::tcp(port, Box::new(LineStrategy)), true)
    }

    /// Serve the console over a named pipe.
    #[cfg(unix)]
    pub fn serve_pipe(
        debugger: &Debugger,
        path: impl Into<std::path::PathBuf>,
    ) -> Result<DebugServer, ServerError> {
        Self::serve(debugger, Connection::pipe(path, Box::new(LineStrategy)), true)
    }

    /// Serve the console over an arbitrary line-framed connection.
    pub fn serve(
        debugger: &Debugger,
        connection: Connection,
        print_prompt: bool,
    ) -> Result<DebugServer, ServerError> {
        let (events, queue) = wake_channel();
        debugger.add_listener(Arc::new(ConsoleListener {
            events: events.clone(),
            print_prompt,
        }));
        let handler = Arc::new(ConsoleProtocol {
            debugger: debugger.clone(),
            print_prompt,
        });
        DebugServer::serve(debugger.clone(), handler, vec![connection], events, queue)
    }

    fn write_prompt(&self, connection: &mut Connection) {
        if self.print_prompt {
            connection.write_data(PROMPT);
        }
    }
}

impl ServerHandler for ConsoleProtocol {
    fn process_request(&self, connection: &mut Connection, request: &str) {
        let debugger = &self.debugger;
        if request == "b" {
            debugger.break_now();
        } else if request == "q" {
            std::process::exit(0);
        } else if let Some(variable) = request.strip_prefix("watch ") {
            debugger.set_watchpoint(variable, WatchMask::WRITE);
            connection.write_data(&format!("Set watchpoint on write '{variable}'\n"));
        } else if let Some(variable) = request.strip_prefix("rwatch ") {
            debugger.set_watchpoint(variable, WatchMask::READ);
            connection.write_data(&format!("Set watchpoint on read '{variable}'\n"));
        } else if let Some(variable) = request.strip_prefix("awatch ") {
            debugger.set_watchpoint(variable, WatchMask::ALL);
            connection.write_data(&format!("Set watchpoint on read/write '{variable}'\n"));
        } else if request.starts_with("info br") {
            let mut listing = String::new();
            for breakpoint in debugger.breakpoints() {
                listing.push_str(&format!(
                    "{} \tbreakpoint \t{}:{}\n",
                    breakpoint.id, breakpoint.file, breakpoint.line
                ));
            }
            for watchpoint in debugger.watchpoints() {
                listing.push_str(&format!(
                    "{} \twatchpoint \t{} \t({})\n",
                    watchpoint.id, watchpoint.variable, watchpoint.mask
                ));
            }
            connection.write_data(&listing);
        } else if request == "clear" {
            debugger.clear_all_breakpoints();
            debugger.clear_all_watchpoints();
            connection.write_data("Cleared all breakpoints and watchpoints\n");
        } else if let Some(id) = request.strip_prefix("clear ") {
            match id.trim().parse::<u64>() {
                Ok(id) => {
                    if debugger.clear_breakpoint(id) {
                        connection.write_data(&format!("Cleared breakpoint {id}\n"));
                    } else if debugger.clear_watchpoint(id) {
                        connection.write_data(&format!("Cleared watchpoint {id}\n"));
                    } else {
                        connection.write_data(&format!(
                            "Could not find breakpoint or watchpoint with ID of {id}\n"
                        ));
                    }
                }
                Err(_) => {
                    connection.write_data("clear: expected a breakpoint or watchpoint id\n");
                }
            }
        } else if let Some(target) = request.strip_prefix("br ") {
            // The file:line form works in any state; a bare line number
            // needs the paused file and is handled below.
            if let Some((file, line)) = target.rsplit_once(':') {
                if let Ok(line) = line.parse::<u64>() {
                    debugger.set_breakpoint(file, line);
                    connection.write_data(&format!("Break at {file}:{line}\n"));
                }
            }
        }

        let mut ctx = debugger.pause_context();
        if ctx.valid() {
            if request.starts_with("fin") {
                let _ = ctx.step_out();
            } else if request == "c" {
                let _ = ctx.resume();
            } else if request == "n" {
                let _ = ctx.step_over();
            } else if request == "s" {
                let _ = ctx.step_into();
            } else if request == "l" {
                if let Ok(location) = ctx.current_line() {
                    let listing = file_lines(&location.path, location.line);
                    connection.write_data(&format!("{listing}\n"));
                }
            } else if request == "bt" {
                if let (Ok(location), Ok(backtrace)) = (ctx.current_line(), ctx.backtrace()) {
                    connection.write_data(&format!(
                        "Paused at {}:{} ({})\n",
                        location.path, location.line, location.name
                    ));
                    connection.write_data(&backtrace.to_string());
                }
            } else if let Some(expr) = request.strip_prefix("print ") {
                match ctx.definition(expr) {
                    Ok(Some(value)) => {
                        connection.write_data(&format!("$ {expr} = {value}\n"));
                    }
                    _ => connection.write_data(&format!("{expr} isn't set.\n")),
                }
            } else if let Some(target) = request.strip_prefix("br ") {
                if !target.contains(':') && target.starts_with(|c: char| c.is_ascii_digit()) {
                    if let (Ok(line), Ok(location)) = (target.parse::<u64>(), ctx.current_line()) {
                        debugger.set_breakpoint(location.path.clone(), line);
                        connection.write_data(&format!("Break at {}:{line}\n", location.path));
                    }
                }
            }
        }
        drop(ctx);

        self.write_prompt(connection);
    }

    fn on_signal(&self, signum: i32) -> bool {
        if signum == 2 {
            self.debugger.break_now();
            return true;
        }
        false
    }
}

/// Listener side of the console: turns engine transitions into broadcasts.
///
/// Runs on the interpreter thread, so output goes through the wake queue
/// rather than straight to the sockets.
struct ConsoleListener {
    events: EventSender,
    print_prompt: bool,
}

impl DebugListener for ConsoleListener {
    fn on_change_state(&self, view: &StateView<'_>) {
        let mut message = match view.state() {
            DebuggerState::Running => "Running...\n".to_string(),
            DebuggerState::Paused => {
                let location = view.current_line();
                format!(
                    "Paused at {}:{} ({})\n",
                    location.path, location.line, location.name
                )
            }
            DebuggerState::Unknown => "Unknown state\n".to_string(),
        };
        if self.print_prompt && view.state() != DebuggerState::Running {
            message.push_str(PROMPT);
        }
        self.events.broadcast(message);
    }

    fn on_breakpoint(&self, _view: &StateView<'_>, id: u64) {
        self.events.broadcast(format!("# Breakpoint {id} hit\n"));
    }

    fn on_watchpoint(
        &self,
        _view: &StateView<'_>,
        variable: &str,
        access: VariableAccess,
        new_value: Option<&str>,
    ) {
        self.events.broadcast(format!(
            "Watchpoint '{variable}' hit -- '{}' ({})\n",
            new_value.unwrap_or_default(),
            access.as_str()
        ));
    }
}

/// Lines around `center` in the listing format `LINE\t|text`.
fn file_lines(path: &str, center: u64) -> String {
    let Ok(content) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let start = center.saturating_sub(10).max(1);
    let end = center.saturating_add(10);
    let mut listing = String::new();
    for (idx, text) in content.lines().enumerate() {
        let line = idx as u64 + 1;
        if line < start {
            continue;
        }
        if line > end {
            break;
        }
        listing.push_str(&format!("{line}\t|{text}\n"));
    }
    listing
}
