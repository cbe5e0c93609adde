//! Server base: the reactor thread and its event queue.
//!
//! Protocol handlers implement [`ServerHandler`] and never touch sockets
//! directly: transports feed bytes in as events, the reactor frames them
//! and hands complete requests to the handler, and every write — replies
//! and broadcasts alike — happens on the reactor thread. Serialising
//! broadcasts through the queue keeps their order deterministic no matter
//! which thread produced them.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cmdbg_engine::Debugger;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::ServerError;
use crate::handle::{EventSender, SignalGuard};

/// Index of a connection within its server.
pub type ConnectionId = u64;

/// Events drained by the reactor loop.
pub enum ServerEvent {
    /// A transport accepted a client; here is its write half.
    Accepted(ConnectionId, Box<dyn Write + Send>),
    /// Raw bytes arrived on a connection.
    Data(ConnectionId, Vec<u8>),
    /// A connection's peer went away.
    Disconnected(ConnectionId, i32),
    /// Queue a message for every open connection.
    Broadcast(String),
    /// An interrupt-style signal reached the process.
    Signal(i32),
    /// Stop serving.
    Shutdown,
}

/// Protocol hook invoked by the reactor for every framed request.
pub trait ServerHandler: Send + Sync {
    /// Handle one complete request from a client.
    fn process_request(&self, connection: &mut Connection, request: &str);

    /// A client attached to the connection.
    fn on_connected(&self, _connection: &mut Connection) {}

    /// A signal arrived; return true when consumed.
    fn on_signal(&self, _signum: i32) -> bool {
        false
    }
}

/// Lifecycle of a server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Initialising,
    Serving,
    ShuttingDown,
    Stopped,
}

impl ServerState {
    fn from_u8(value: u8) -> ServerState {
        match value {
            1 => ServerState::Serving,
            2 => ServerState::ShuttingDown,
            3 => ServerState::Stopped,
            _ => ServerState::Initialising,
        }
    }
}

const START_TIMEOUT: Duration = Duration::from_secs(5);
const SERVE_WAIT: Duration = Duration::from_secs(30);

static SERVING: AtomicBool = AtomicBool::new(false);

/// Claim the process-wide serving slot, waiting briefly for a previous
/// server to stop.
fn acquire_serving_slot() -> Result<(), ServerError> {
    let deadline = Instant::now() + SERVE_WAIT;
    while SERVING
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        if Instant::now() >= deadline {
            return Err(ServerError::AlreadyServing);
        }
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

/// A running debug server: reactor thread, connections, wake handle.
pub struct DebugServer {
    debugger: Debugger,
    events: EventSender,
    reactor: Option<JoinHandle<()>>,
    state: Arc<AtomicU8>,
    local_addr: Option<SocketAddr>,
    _signal: SignalGuard,
}

impl DebugServer {
    /// Start serving the given connections with a protocol handler.
    ///
    /// `events`/`queue` come from [`crate::handle::wake_channel`]; the
    /// caller registers its listeners with clones of `events` before
    /// serving. Transport errors at serve start abort and are returned.
    pub fn serve(
        debugger: Debugger,
        handler: Arc<dyn ServerHandler>,
        connections: Vec<Connection>,
        events: EventSender,
        queue: Receiver<ServerEvent>,
    ) -> Result<DebugServer, ServerError> {
        acquire_serving_slot()?;
        let state = Arc::new(AtomicU8::new(ServerState::Initialising as u8));
        let signal = SignalGuard::install(events.clone());

        let (ready_tx, ready_rx) = channel();
        let reactor = {
            let events = events.clone();
            thread::spawn(move || reactor_loop(handler, connections, events, queue, &ready_tx))
        };

        match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(local_addr)) => {
                state.store(ServerState::Serving as u8, Ordering::SeqCst);
                Ok(DebugServer {
                    debugger,
                    events,
                    reactor: Some(reactor),
                    state,
                    local_addr,
                    _signal: signal,
                })
            }
            Ok(Err(err)) => {
                let _ = reactor.join();
                events.reset();
                SERVING.store(false, Ordering::SeqCst);
                Err(err)
            }
            Err(_) => {
                events.reset();
                SERVING.store(false, Ordering::SeqCst);
                Err(ServerError::Transport("server start timed out".to_string()))
            }
        }
    }

    /// Address of the listening transport, if any.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Queue a message for every open connection, from any thread.
    pub fn broadcast(&self, message: impl Into<String>) {
        self.events.broadcast(message);
    }

    /// Stop serving: resume the interpreter, drain the reactor, join.
    pub fn shutdown(&mut self) {
        let Some(reactor) = self.reactor.take() else {
            return;
        };
        self.state
            .store(ServerState::ShuttingDown as u8, Ordering::SeqCst);
        // Never leave the interpreter parked on the condition variable.
        self.debugger.resume();
        self.events.send(ServerEvent::Shutdown);
        let _ = reactor.join();
        self.events.reset();
        self.state.store(ServerState::Stopped as u8, Ordering::SeqCst);
        SERVING.store(false, Ordering::SeqCst);
    }
}

impl Drop for DebugServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reactor_loop(
    handler: Arc<dyn ServerHandler>,
    mut connections: Vec<Connection>,
    events: EventSender,
    queue: Receiver<ServerEvent>,
    ready: &Sender<Result<Option<SocketAddr>, ServerError>>,
) {
    let mut local_addr = None;
    let mut failure = None;
    for (id, connection) in connections.iter_mut().enumerate() {
        match connection.serve_start(id as ConnectionId, &events) {
            Ok(addr) => local_addr = local_addr.or(addr),
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }
    if let Some(err) = failure {
        for connection in connections.iter_mut() {
            connection.shutdown();
        }
        let _ = ready.send(Err(err));
        return;
    }
    let _ = ready.send(Ok(local_addr));

    // Standard-stream connections are open before the first event.
    for connection in connections.iter_mut() {
        if connection.is_open() {
            handler.on_connected(connection);
        }
    }

    while let Ok(event) = queue.recv() {
        match event {
            ServerEvent::Accepted(id, writer) => {
                if let Some(connection) = connections.get_mut(id as usize) {
                    connection.attach_client(writer);
                    handler.on_connected(connection);
                }
            }
            ServerEvent::Data(id, bytes) => {
                let Some(connection) = connections.get_mut(id as usize) else {
                    continue;
                };
                if let Err(err) = connection.read_data(&bytes) {
                    warn!("dropping unparsable input: {err}");
                    connection.recover();
                    let report = serde_json::json!({ "Error": err.to_string() });
                    connection.write_data(&report.to_string());
                }
                while let Some(request) = connection.next_request() {
                    handler.process_request(connection, &request);
                }
            }
            ServerEvent::Disconnected(id, code) => {
                if let Some(connection) = connections.get_mut(id as usize) {
                    connection.on_disconnect(code);
                }
            }
            ServerEvent::Broadcast(message) => {
                for connection in connections.iter_mut() {
                    if connection.is_open() {
                        connection.write_data(&message);
                    }
                }
            }
            ServerEvent::Signal(signum) => {
                if !handler.on_signal(signum) {
                    debug!("ignoring signal {signum}");
                }
            }
            ServerEvent::Shutdown => break,
        }
    }

    for connection in connections.iter_mut() {
        connection.shutdown();
    }
}
