//! Frame structure and serialization

use crate::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Direction of a stream relative to the handler that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamDirection {
    /// Handler emits data, caller reads it
    Readable,
    /// Caller writes data, handler consumes it
    Writable,
}

/// Reason carried by an `error` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// The method name did not resolve to a handler
    MethodNotFound,
    /// The handler faulted or returned an error
    HandlerFailed,
}

/// Protocol frame
///
/// Every frame carries the correlation id of the invocation it belongs to.
/// Stream frames reuse the id of the invocation that opened the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Frame {
    /// Invoke a method
    Call {
        /// Correlation id
        id: u32,
        /// Dotted method name
        name: String,
        /// Positional arguments
        args: Vec<Value>,
    },

    /// Plain result of an invocation
    Reply {
        /// Correlation id
        id: u32,
        /// Result value
        value: Value,
    },

    /// Failed invocation
    Error {
        /// Correlation id
        id: u32,
        /// Failure class
        code: ErrorCode,
        /// Human-readable message
        message: String,
    },

    /// The invocation resolved to a stream
    StreamStart {
        /// Correlation id, also the stream id
        id: u32,
        /// Which way the data flows
        direction: StreamDirection,
    },

    /// One stream chunk
    StreamData {
        /// Stream id
        id: u32,
        /// Chunk value
        value: Value,
    },

    /// Stream completed
    StreamEnd {
        /// Stream id
        id: u32,
    },

    /// Stream faulted
    StreamError {
        /// Stream id
        id: u32,
        /// Fault message
        message: String,
    },

    /// Window update from the consuming side of a stream
    StreamCredit {
        /// Stream id
        id: u32,
        /// Number of further chunks the producer may send
        credits: u32,
    },
}

impl Frame {
    /// Create a call frame
    pub fn call(id: u32, name: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Call {
            id,
            name: name.into(),
            args,
        }
    }

    /// Create a reply frame
    pub fn reply(id: u32, value: Value) -> Self {
        Self::Reply { id, value }
    }

    /// Create an error frame
    pub fn error(id: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a stream-start frame
    pub fn stream_start(id: u32, direction: StreamDirection) -> Self {
        Self::StreamStart { id, direction }
    }

    /// Create a stream-data frame
    pub fn stream_data(id: u32, value: Value) -> Self {
        Self::StreamData { id, value }
    }

    /// Create a stream-end frame
    pub fn stream_end(id: u32) -> Self {
        Self::StreamEnd { id }
    }

    /// Create a stream-error frame
    pub fn stream_error(id: u32, message: impl Into<String>) -> Self {
        Self::StreamError {
            id,
            message: message.into(),
        }
    }

    /// Create a stream-credit frame
    pub fn stream_credit(id: u32, credits: u32) -> Self {
        Self::StreamCredit { id, credits }
    }

    /// Get the correlation id
    pub fn id(&self) -> u32 {
        match self {
            Self::Call { id, .. } => *id,
            Self::Reply { id, .. } => *id,
            Self::Error { id, .. } => *id,
            Self::StreamStart { id, .. } => *id,
            Self::StreamData { id, .. } => *id,
            Self::StreamEnd { id } => *id,
            Self::StreamError { id, .. } => *id,
            Self::StreamCredit { id, .. } => *id,
        }
    }

    /// Wire name of the frame type
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Call { .. } => "call",
            Self::Reply { .. } => "reply",
            Self::Error { .. } => "error",
            Self::StreamStart { .. } => "stream-start",
            Self::StreamData { .. } => "stream-data",
            Self::StreamEnd { .. } => "stream-end",
            Self::StreamError { .. } => "stream-error",
            Self::StreamCredit { .. } => "stream-credit",
        }
    }

    /// Check if this frame belongs to an already started stream
    pub fn is_stream_frame(&self) -> bool {
        matches!(
            self,
            Self::StreamData { .. }
                | Self::StreamEnd { .. }
                | Self::StreamError { .. }
                | Self::StreamCredit { .. }
        )
    }

    /// Serialize frame to MessagePack bytes
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize frame from MessagePack bytes
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Build the error a peer sees when this frame arrives where it should not
    pub fn unexpected(&self) -> ProtocolError {
        ProtocolError::UnexpectedFrame {
            kind: self.kind(),
            id: self.id(),
        }
    }
}
