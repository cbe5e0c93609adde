//! Connection transports.
//!
//! A connection pairs one transport (standard streams, TCP, named pipe)
//! with one framing strategy and a request queue. Transports run their
//! blocking I/O on scoped worker threads and only ever post events; the
//! reactor owns the connection itself and performs all writes.

use std::collections::VecDeque;
use std::io::{self, IsTerminal, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::thread;

use tracing::{debug, warn};

use crate::error::ServerError;
use crate::framing::BufferStrategy;
use crate::handle::{EventSender, ScopedThread, POLL_INTERVAL};
use crate::server::{ConnectionId, ServerEvent};

/// What a transport produced at serve start.
pub struct ServeOutcome {
    /// Bound address, for listening transports.
    pub local_addr: Option<SocketAddr>,
    /// Write half, when the peer exists immediately (standard streams).
    pub writer: Option<Box<dyn Write + Send>>,
}

/// How bytes arrive and leave. Implementations deliver inbound data as
/// [`ServerEvent`]s and must stop their workers on `shutdown`.
pub trait Transport: Send {
    /// Bind resources and start pumping. Runs on the reactor thread.
    fn serve_start(
        &mut self,
        id: ConnectionId,
        events: &EventSender,
    ) -> Result<ServeOutcome, ServerError>;

    /// Stop workers and release resources. Must be idempotent.
    fn shutdown(&mut self);
}

/// One duplex client connection owned by a server.
pub struct Connection {
    raw: Vec<u8>,
    strategy: Box<dyn BufferStrategy>,
    queue: VecDeque<String>,
    writer: Option<Box<dyn Write + Send>>,
    transport: Box<dyn Transport>,
}

impl Connection {
    /// Combine a transport with a framing strategy.
    #[must_use]
    pub fn new(transport: Box<dyn Transport>, strategy: Box<dyn BufferStrategy>) -> Connection {
        Connection {
            raw: Vec::new(),
            strategy,
            queue: VecDeque::new(),
            writer: None,
            transport,
        }
    }

    /// Connection over the inherited standard streams.
    #[must_use]
    pub fn stdio(strategy: Box<dyn BufferStrategy>) -> Connection {
        Connection::new(Box::new(StdioTransport { reader: None }), strategy)
    }

    /// Connection listening on `0.0.0.0:port`. Port 0 picks an ephemeral
    /// port, reported through the server once serving.
    #[must_use]
    pub fn tcp(port: u16, strategy: Box<dyn BufferStrategy>) -> Connection {
        Connection::new(Box::new(TcpTransport { port, pump: None }), strategy)
    }

    /// Connection listening on a named pipe path.
    #[cfg(unix)]
    #[must_use]
    pub fn pipe(path: impl Into<PathBuf>, strategy: Box<dyn BufferStrategy>) -> Connection {
        Connection::new(
            Box::new(PipeTransport {
                path: path.into(),
                pump: None,
            }),
            strategy,
        )
    }

    pub(crate) fn serve_start(
        &mut self,
        id: ConnectionId,
        events: &EventSender,
    ) -> Result<Option<SocketAddr>, ServerError> {
        let outcome = self.transport.serve_start(id, events)?;
        if outcome.writer.is_some() {
            self.writer = outcome.writer;
        }
        Ok(outcome.local_addr)
    }

    pub(crate) fn attach_client(&mut self, writer: Box<dyn Write + Send>) {
        self.writer = Some(writer);
    }

    /// Buffer inbound bytes and frame complete requests onto the queue.
    pub(crate) fn read_data(&mut self, data: &[u8]) -> Result<(), ServerError> {
        self.raw.extend_from_slice(data);
        while let Some(message) = self.strategy.buffer_message(&mut self.raw)? {
            self.queue.push_back(message);
        }
        Ok(())
    }

    pub(crate) fn next_request(&mut self) -> Option<String> {
        self.queue.pop_front()
    }

    /// Drop partial frames after a framing error.
    pub(crate) fn recover(&mut self) {
        self.strategy.clear();
        self.raw.clear();
    }

    /// Write a payload through the strategy's outbound transform.
    pub fn write_data(&mut self, data: &str) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let payload = self.strategy.buffer_out_message(data);
        if let Err(err) = writer
            .write_all(payload.as_bytes())
            .and_then(|()| writer.flush())
        {
            warn!("connection write failed: {err}");
            self.writer = None;
        }
    }

    /// Whether a client is attached.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    pub(crate) fn on_disconnect(&mut self, code: i32) {
        debug!("client disconnected ({code})");
        self.writer = None;
    }

    pub(crate) fn shutdown(&mut self) {
        self.transport.shutdown();
        self.writer = None;
    }
}

/// Read loop for an interruptible stream (sockets with a read timeout).
fn spawn_reader(
    id: ConnectionId,
    mut stream: impl Read + Send + 'static,
    events: EventSender,
) -> ScopedThread {
    ScopedThread::spawn(true, move |stop| {
        let mut buf = [0u8; 4096];
        while !stop.load(Ordering::SeqCst) {
            match stream.read(&mut buf) {
                Ok(0) => {
                    events.send(ServerEvent::Disconnected(id, 0));
                    break;
                }
                Ok(n) => {
                    if !events.send(ServerEvent::Data(id, buf[..n].to_vec())) {
                        break;
                    }
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(err) => {
                    events.send(ServerEvent::Disconnected(
                        id,
                        err.raw_os_error().unwrap_or(-1),
                    ));
                    break;
                }
            }
        }
    })
}

struct StdioTransport {
    reader: Option<ScopedThread>,
}

impl Transport for StdioTransport {
    fn serve_start(
        &mut self,
        id: ConnectionId,
        events: &EventSender,
    ) -> Result<ServeOutcome, ServerError> {
        debug!(
            "serving on standard streams ({} input)",
            if io::stdin().is_terminal() {
                "terminal"
            } else {
                "piped"
            }
        );
        let events = events.clone();
        // Reading stdin cannot be interrupted, so this worker is detached
        // rather than joined; for file input it drains to EOF and reports
        // the disconnect.
        self.reader = Some(ScopedThread::spawn(false, move |stop| {
            let mut stdin = io::stdin();
            let mut buf = [0u8; 4096];
            while !stop.load(Ordering::SeqCst) {
                match stdin.read(&mut buf) {
                    Ok(0) => {
                        events.send(ServerEvent::Disconnected(id, 0));
                        break;
                    }
                    Ok(n) => {
                        if !events.send(ServerEvent::Data(id, buf[..n].to_vec())) {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        events.send(ServerEvent::Disconnected(
                            id,
                            err.raw_os_error().unwrap_or(-1),
                        ));
                        break;
                    }
                }
            }
        }));
        Ok(ServeOutcome {
            local_addr: None,
            writer: Some(Box::new(io::stdout())),
        })
    }

    fn shutdown(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            reader.reset();
        }
    }
}

struct TcpTransport {
    port: u16,
    pump: Option<ScopedThread>,
}

impl Transport for TcpTransport {
    fn serve_start(
        &mut self,
        id: ConnectionId,
        events: &EventSender,
    ) -> Result<ServeOutcome, ServerError> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).map_err(|err| {
            ServerError::Transport(format!("bind 0.0.0.0:{}: {err}", self.port))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| ServerError::Transport(format!("local addr: {err}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|err| ServerError::Transport(format!("listen on {local_addr}: {err}")))?;
        debug!("listening on {local_addr}");

        let events = events.clone();
        self.pump = Some(ScopedThread::spawn(true, move |stop| {
            let mut reader: Option<ScopedThread> = None;
            let mut have_client = false;
            while !stop.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        // One client per server; late arrivals are closed.
                        if have_client {
                            debug!("refusing extra client {peer}");
                            continue;
                        }
                        match tcp_client_streams(stream) {
                            Ok((read_half, write_half)) => {
                                debug!("client connected from {peer}");
                                have_client = true;
                                if !events.send(ServerEvent::Accepted(id, write_half)) {
                                    break;
                                }
                                reader = Some(spawn_reader(id, read_half, events.clone()));
                            }
                            Err(err) => warn!("client setup failed: {err}"),
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(POLL_INTERVAL);
                    }
                    Err(err) => {
                        warn!("accept failed: {err}");
                        break;
                    }
                }
            }
            if let Some(mut reader) = reader {
                reader.reset();
            }
        }));
        Ok(ServeOutcome {
            local_addr: Some(local_addr),
            writer: None,
        })
    }

    fn shutdown(&mut self) {
        if let Some(mut pump) = self.pump.take() {
            pump.reset();
        }
    }
}

fn tcp_client_streams(stream: TcpStream) -> io::Result<(TcpStream, Box<dyn Write + Send>)> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    let writer = stream.try_clone()?;
    Ok((stream, Box::new(writer)))
}

#[cfg(unix)]
struct PipeTransport {
    path: PathBuf,
    pump: Option<ScopedThread>,
}

#[cfg(unix)]
impl Transport for PipeTransport {
    fn serve_start(
        &mut self,
        id: ConnectionId,
        events: &EventSender,
    ) -> Result<ServeOutcome, ServerError> {
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
        let listener = UnixListener::bind(&self.path).map_err(|err| {
            ServerError::Transport(format!("bind {}: {err}", self.path.display()))
        })?;
        listener.set_nonblocking(true).map_err(|err| {
            ServerError::Transport(format!("listen on {}: {err}", self.path.display()))
        })?;
        debug!("listening on pipe {}", self.path.display());

        let events = events.clone();
        self.pump = Some(ScopedThread::spawn(true, move |stop| {
            let mut reader: Option<ScopedThread> = None;
            let mut have_client = false;
            while !stop.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        if have_client {
                            debug!("refusing extra pipe client");
                            continue;
                        }
                        match pipe_client_streams(stream) {
                            Ok((read_half, write_half)) => {
                                debug!("pipe client connected");
                                have_client = true;
                                if !events.send(ServerEvent::Accepted(id, write_half)) {
                                    break;
                                }
                                reader = Some(spawn_reader(id, read_half, events.clone()));
                            }
                            Err(err) => warn!("pipe client setup failed: {err}"),
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(POLL_INTERVAL);
                    }
                    Err(err) => {
                        warn!("pipe accept failed: {err}");
                        break;
                    }
                }
            }
            if let Some(mut reader) = reader {
                reader.reset();
            }
        }));
        Ok(ServeOutcome {
            local_addr: None,
            writer: None,
        })
    }

    fn shutdown(&mut self) {
        if let Some(mut pump) = self.pump.take() {
            pump.reset();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn pipe_client_streams(stream: UnixStream) -> io::Result<(UnixStream, Box<dyn Write + Send>)> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    let writer = stream.try_clone()?;
    Ok((stream, Box::new(writer)))
}
