use std::io;

use thiserror::Error;

use mqttd_core::{ConnectReturnCode, DecodeError};

/// Errors surfaced by the runtime.
///
/// The policy is per-connection containment: a handler translates whatever
/// goes wrong into one of these kinds at its boundary, and nothing here is
/// ever allowed to propagate into another connection.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed packet, illegal state transition, or topic/string violation.
    /// The offending connection is shut down.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The server refused the CONNECT with the given return code.
    #[error("connect refused: {0}")]
    ConnectRefused(ConnectReturnCode),

    /// Authentication or authorization was refused.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// A wait-reply or connect attempt exceeded its window.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Socket-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// A quota or limit was reached; the operation is rejected but the
    /// connection stays up.
    #[error("resource limit reached: {0}")]
    Resource(String),

    /// The connection is already closed.
    #[error("connection closed")]
    Closed,

    /// Unexpected condition; logged and contained to the connection.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the connection this error occurred on must be shut down.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Protocol(_) | Error::Transport(_) | Error::Internal(_) | Error::Closed => true,
            Error::ConnectRefused(_)
            | Error::NotAuthorized(_)
            | Error::Timeout(_)
            | Error::Resource(_) => false,
        }
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::Protocol(err.to_string())
    }
}

/// Convenience alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, Error>;
