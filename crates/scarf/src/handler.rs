//! Handler contract and invocation outcomes
//!
//! A handler resolves to exactly one [`Outcome`] or fails with a
//! [`HandlerError`]. Whether the result is streamed is decided by the
//! handler author through the variant it returns, never inferred from the
//! value.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use scarf_proto::Value;
use std::any::Any;
use std::fmt;
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error raised by a handler or a handler-provided stream
///
/// The message reaches the caller unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Create a handler error with the given message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Get the message sent to the caller
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Stream of chunks produced by a readable outcome
pub type ChunkStream = BoxStream<'static, Result<Value, HandlerError>>;

/// Destination for chunks written by the caller into a writable outcome
#[async_trait]
pub trait StreamSink: Send {
    /// Accept one chunk; the next chunk is not delivered until this returns
    async fn write(&mut self, chunk: Value) -> Result<(), HandlerError>;

    /// Called once after the last chunk; the caller's `end` resolves after it
    async fn finish(&mut self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Called instead of `finish` when the stream is torn down early
    async fn abort(&mut self, _reason: &str) {}
}

#[async_trait]
impl StreamSink for mpsc::Sender<Value> {
    async fn write(&mut self, chunk: Value) -> Result<(), HandlerError> {
        self.send(chunk)
            .await
            .map_err(|_| HandlerError::new("stream sink closed"))
    }
}

/// Result of a successful handler invocation
pub enum Outcome {
    /// Plain value, sent as a single reply
    Value(Value),
    /// Handler produces chunks, the caller reads them
    Readable(ChunkStream),
    /// Caller writes chunks, the handler's sink consumes them
    Writable(Box<dyn StreamSink>),
}

impl Outcome {
    /// Plain value outcome
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    /// Readable stream outcome from any fallible chunk stream
    pub fn readable<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, HandlerError>> + Send + 'static,
    {
        Self::Readable(stream.boxed())
    }

    /// Readable stream outcome fed by a channel; ends when every sender is dropped
    pub fn from_receiver(receiver: mpsc::Receiver<Value>) -> Self {
        Self::readable(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|chunk| (Ok(chunk), receiver))
        }))
    }

    /// Writable stream outcome
    pub fn writable<S>(sink: S) -> Self
    where
        S: StreamSink + 'static,
    {
        Self::Writable(Box::new(sink))
    }

    /// Short name of the variant, for logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Value(_) => "value",
            Self::Readable(_) => "readable",
            Self::Writable(_) => "writable",
        }
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Readable(_) => f.write_str("Readable(..)"),
            Self::Writable(_) => f.write_str("Writable(..)"),
        }
    }
}

/// Handler trait for processing calls
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle a call and produce its outcome
    async fn call(&self, args: Vec<Value>) -> Result<Outcome, HandlerError>;
}

/// Handler backed by an async function or closure
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async function or closure as a [`Handler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, HandlerError>> + Send + 'static,
{
    async fn call(&self, args: Vec<Value>) -> Result<Outcome, HandlerError> {
        (self.f)(args).await
    }
}

/// Extract the message of a caught panic
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
