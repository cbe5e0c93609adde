//! Remote debug servers for the cmdbg engine.
//!
//! Two wire protocols over three transports: a line-oriented console
//! (stdio, TCP, named pipe) and a JSON request/response protocol with
//! pushed state updates (TCP with balanced-brace framing, named pipe with
//! envelope framing). All protocol work happens on a single reactor
//! thread; the interpreter thread only ever runs engine hooks.

pub mod connection;
pub mod console;
pub mod framing;
pub mod json;
pub mod server;

mod error;
mod handle;

pub use connection::{Connection, ServeOutcome, Transport};
pub use console::{ConsoleProtocol, PROMPT};
pub use error::ServerError;
pub use framing::{
    BufferStrategy, EnvelopeStrategy, JsonStrategy, LineStrategy, ENVELOPE_CLOSE, ENVELOPE_OPEN,
};
pub use handle::{wake_channel, EventSender};
pub use json::JsonProtocol;
pub use server::{ConnectionId, DebugServer, ServerEvent, ServerHandler, ServerState};
