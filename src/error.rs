//! Error types for the server.
//!
//! Errors are explicit and typed. Per-connection failures never take the
//! server down: I/O and protocol errors close the offending connection,
//! database errors degrade to a 500-class response, and `ShuttingDown` makes
//! every loop exit at its next safe point.

use std::io;

use thiserror::Error;

use crate::http::HttpError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ServerError>;

/// The main error type for server operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A kernel call failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer sent a malformed request.
    #[error("protocol error: {0}")]
    Protocol(#[from] HttpError),

    /// A capacity limit was hit (connection cap, full queue).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// The database rejected an operation.
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// A connection sat idle past its deadline.
    #[error("connection timed out")]
    Timeout,

    /// The server is shutting down.
    #[error("server is shutting down")]
    ShuttingDown,

    /// Configuration was rejected before startup.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ServerError {
    /// Returns true if the underlying cause is a would-block I/O condition.
    #[must_use]
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_detection() {
        let err = ServerError::from(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(err.is_would_block());

        let err = ServerError::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(!err.is_would_block());

        assert!(!ServerError::Timeout.is_would_block());
    }

    #[test]
    fn display_messages() {
        assert_eq!(ServerError::Timeout.to_string(), "connection timed out");
        assert_eq!(
            ServerError::ShuttingDown.to_string(),
            "server is shutting down"
        );
        assert_eq!(
            ServerError::ResourceExhausted("connection cap").to_string(),
            "resource exhausted: connection cap"
        );
    }
}
