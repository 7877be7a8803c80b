//! # Scarf
//!
//! A minimal RPC framework. A [`Server`] exposes a table of named handlers,
//! a [`Client`] invokes them over one byte-stream connection and receives a
//! plain value, an error, or a live stream proxied across the connection.
//!
//! Many invocations and streams share a connection. Frames are correlated
//! by id, written by a single writer task and read by a single reader task.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use scarf_proto as proto;
pub use scarf_proto::Value;

/// Error types for the Scarf library
pub mod error;

/// Client and server configuration
pub mod config;

/// Handler contract and invocation outcomes
pub mod handler;

/// Method table with dotted-name lookup
pub mod methods;

/// Connection management: single reader, single writer
pub mod connection;

/// Server-side call dispatch
pub mod dispatcher;

/// Client-side invocation tracking
pub mod registry;

/// Client-side stream proxies
pub mod proxy;

/// TCP server
pub mod server;

/// TCP client
pub mod client;

pub use client::Client;
pub use config::{ClientConfig, ConnectionConfig, ServerConfig};
pub use connection::{Connection, Role};
pub use error::ScarfError;
pub use handler::{handler_fn, Handler, HandlerError, Outcome, StreamSink};
pub use methods::MethodTable;
pub use proxy::{ReadableStream, WritableStream};
pub use registry::{PendingCall, Reply};
pub use server::{Server, ServerHandle};

/// Result type alias for Scarf operations
pub type Result<T> = std::result::Result<T, ScarfError>;
