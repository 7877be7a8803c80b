//! Error types for the Scarf library

use scarf_proto::ProtocolError;
use std::time::Duration;
use thiserror::Error;

/// Main error type for Scarf operations
#[derive(Debug, Error)]
pub enum ScarfError {
    /// Method name did not resolve to a handler
    #[error("Invalid method: \"{0}\"")]
    MethodNotFound(String),

    /// Handler fault, message passed through verbatim
    #[error("{0}")]
    Handler(String),

    /// Protocol-related errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection closed or reset while work was outstanding
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout errors
    #[error("Timeout after {duration:?}")]
    Timeout {
        /// Duration that was exceeded
        duration: Duration,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Reply did not have the expected shape
    #[error("Expected {expected} reply, got {found}")]
    UnexpectedReply {
        /// Shape asked for
        expected: &'static str,
        /// Shape received
        found: &'static str,
    },
}

impl ScarfError {
    /// Error used when the connection is gone
    pub(crate) fn closed() -> Self {
        Self::Connection("connection closed".to_string())
    }

    /// Check if this error tore down the connection
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Connection(_) | Self::Io(_))
    }
}
