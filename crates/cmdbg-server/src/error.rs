//! Server errors.

use thiserror::Error;

/// Errors surfaced by connections and servers.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Bind/listen/accept failure at serve start. Fatal for the server.
    #[error("transport error: {0}")]
    Transport(String),

    /// A framing strategy rejected the byte stream. The connection
    /// survives; the client is told.
    #[error("framing error: {0}")]
    Framing(String),

    /// Another server is already serving in this process.
    #[error("another debug server is already serving in this process")]
    AlreadyServing,

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
