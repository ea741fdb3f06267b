//! Error taxonomy for the connection layer.
//!
//! Protocol violations are always fatal to the one affected socket, never
//! to the listener or sibling sockets. Errors raised by the host dispatcher
//! are [`crate::dispatch::DispatchError`] and only terminate a connection
//! when marked fatal.

/// Why a connection was refused at the door.
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// The listener has been stopped and accepts no new connections.
    #[error("listener is stopped")]
    Stopped,
    /// The configured connection ceiling is already reached.
    #[error("connection ceiling of {0} reached")]
    AtCapacity(usize),
    /// The connection declared an origin outside the allow-list.
    #[error("origin {0:?} is not allowed")]
    OriginNotAllowed(String),
}

/// Fatal, per-socket protocol violations.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] wire::CodecError),
    #[error("handshake violation: {0}")]
    Handshake(&'static str),
    #[error("expected a binary frame")]
    NonBinaryFrame,
}
