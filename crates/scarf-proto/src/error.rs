//! Wire-level errors

use thiserror::Error;

/// Errors raised while encoding, decoding or routing frames
///
/// Every variant is fatal to the connection it was raised on.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid frame format
    #[error("Invalid frame format")]
    InvalidFrame,

    /// Frame too large
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Frame addressed to a stream that is not open
    #[error("Unknown stream ID: {0}")]
    UnknownStream(u32),

    /// Stream ID registered twice
    #[error("Duplicate stream ID: {0}")]
    DuplicateStream(u32),

    /// Data frame for a stream this side is producing
    #[error("Unexpected data on outbound stream {0}")]
    UnexpectedData(u32),

    /// Chunk sent to a stream without an available credit
    #[error("Flow control violation on stream {0}")]
    FlowControlViolation(u32),

    /// Terminal frame for an invocation that is not pending
    #[error("Unknown invocation ID: {0}")]
    UnknownInvocation(u32),

    /// Call ID reused while the previous call is still in flight
    #[error("Duplicate invocation ID: {0}")]
    DuplicateInvocation(u32),

    /// Frame type not valid for the receiving side
    #[error("Unexpected {kind} frame (id {id})")]
    UnexpectedFrame {
        /// Frame type name
        kind: &'static str,
        /// Correlation id carried by the frame
        id: u32,
    },

    /// Stream closed
    #[error("Stream closed")]
    StreamClosed,

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(format!("MessagePack encode error: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(format!("MessagePack decode error: {}", err))
    }
}
