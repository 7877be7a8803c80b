//! # Scarf Protocol
//!
//! Frame definitions, the length-delimited wire codec, and the stream
//! multiplexer shared by both ends of a Scarf connection.

#![warn(missing_docs)]

/// Frame structure and serialization
pub mod frame;

/// Frame codec for async streams
pub mod codec;

/// Stream multiplexing and management
pub mod stream;

/// Error types for protocol operations
pub mod error;

pub use frame::{ErrorCode, Frame, StreamDirection};
pub use codec::{FrameCodec, MAX_FRAME_SIZE};
pub use stream::{StreamEvent, StreamHandle, StreamMultiplexer, StreamState};
pub use error::ProtocolError;

/// Structured value carried by calls, replies and stream chunks
pub use serde_json::Value;
