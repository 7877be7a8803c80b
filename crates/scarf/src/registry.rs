//! Client-side invocation registry
//!
//! Allocates correlation ids, remembers every call that has not been
//! answered yet and settles it exactly once: from the peer's `reply`,
//! `error` or `stream-start` frame, or from connection teardown.

use crate::connection::{FrameHandler, Outbound};
use crate::proxy::{ReadableStream, WritableStream};
use crate::{Result, ScarfError};
use async_trait::async_trait;
use scarf_proto::{ErrorCode, Frame, ProtocolError, StreamDirection, StreamMultiplexer, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Settled result of a remote call
pub enum Reply {
    /// Plain value
    Value(Value),
    /// Chunks produced by the remote handler
    Readable(ReadableStream),
    /// Chunk sink consumed by the remote handler
    Writable(WritableStream),
}

impl Reply {
    /// Short name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Value(_) => "value",
            Self::Readable(_) => "readable",
            Self::Writable(_) => "writable",
        }
    }

    /// Take the plain value
    pub fn into_value(self) -> Result<Value> {
        match self {
            Self::Value(value) => Ok(value),
            other => Err(other.mismatch("value")),
        }
    }

    /// Take the readable stream
    pub fn into_readable(self) -> Result<ReadableStream> {
        match self {
            Self::Readable(stream) => Ok(stream),
            other => Err(other.mismatch("readable")),
        }
    }

    /// Take the writable stream
    pub fn into_writable(self) -> Result<WritableStream> {
        match self {
            Self::Writable(stream) => Ok(stream),
            other => Err(other.mismatch("writable")),
        }
    }

    fn mismatch(&self, expected: &'static str) -> ScarfError {
        ScarfError::UnexpectedReply {
            expected,
            found: self.kind(),
        }
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Readable(stream) => f.debug_tuple("Readable").field(&stream.id()).finish(),
            Self::Writable(stream) => f.debug_tuple("Writable").field(&stream.id()).finish(),
        }
    }
}

/// Outstanding call, settled once
///
/// Await it directly, or hand it a callback with [`PendingCall::on_complete`].
#[must_use = "a pending call does nothing unless awaited or given a callback"]
pub struct PendingCall {
    id: u32,
    receiver: oneshot::Receiver<Result<Reply>>,
}

impl PendingCall {
    /// Correlation id of the call
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Wait for the call to settle
    pub async fn wait(self) -> Result<Reply> {
        self.await
    }

    /// Run `callback` with the result once the call settles
    pub fn on_complete<F>(self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        tokio::spawn(async move { callback(self.await) })
    }
}

impl Future for PendingCall {
    type Output = Result<Reply>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|settled| settled.unwrap_or_else(|_| Err(ScarfError::closed())))
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall").field("id", &self.id).finish()
    }
}

struct PendingInvocation {
    method: String,
    responder: oneshot::Sender<Result<Reply>>,
}

impl PendingInvocation {
    fn settle(self, id: u32, result: Result<Reply>) {
        if self.responder.send(result).is_err() {
            debug!("Call {} ({}) settled after its caller went away", id, self.method);
        }
    }
}

#[derive(Default)]
struct RegistryState {
    pending: HashMap<u32, PendingInvocation>,
    /// Set on teardown; later calls fail immediately with it
    closed: Option<String>,
}

/// Pending calls of one client connection
#[derive(Clone)]
pub(crate) struct InvocationRegistry {
    state: Arc<Mutex<RegistryState>>,
    streams: StreamMultiplexer,
    outbound: Outbound,
}

impl InvocationRegistry {
    pub(crate) fn new(outbound: Outbound) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState::default())),
            streams: StreamMultiplexer::new(),
            outbound,
        }
    }

    /// Register a call and send its `call` frame
    pub(crate) async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<PendingCall> {
        let (responder, receiver) = oneshot::channel();

        let id = {
            let mut state = self.state.lock().await;
            if let Some(reason) = &state.closed {
                return Err(ScarfError::Connection(reason.clone()));
            }

            // Skip ids still held by an unanswered call or a live stream after wrap-around
            let mut id = self.streams.allocate_id();
            while state.pending.contains_key(&id) || self.streams.is_open(id).await {
                id = self.streams.allocate_id();
            }

            state.pending.insert(
                id,
                PendingInvocation {
                    method: method.to_string(),
                    responder,
                },
            );
            id
        };

        debug!("Calling method: id={}, name={}", id, method);

        if let Err(e) = self.outbound.send(Frame::call(id, method, args)).await {
            self.state.lock().await.pending.remove(&id);
            return Err(e);
        }

        Ok(PendingCall { id, receiver })
    }

    /// Number of calls waiting for their first response frame
    pub(crate) async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    async fn take(&self, id: u32) -> std::result::Result<PendingInvocation, ProtocolError> {
        self.state
            .lock()
            .await
            .pending
            .remove(&id)
            .ok_or(ProtocolError::UnknownInvocation(id))
    }

    async fn start_stream(
        &self,
        id: u32,
        direction: StreamDirection,
    ) -> std::result::Result<(), ProtocolError> {
        let invocation = self.take(id).await?;

        let opened = match direction {
            StreamDirection::Readable => self
                .streams
                .open_inbound(id, direction)
                .await
                .map(|handle| Reply::Readable(ReadableStream::new(handle))),
            StreamDirection::Writable => self
                .streams
                .open_outbound(id, direction)
                .await
                .map(|handle| Reply::Writable(WritableStream::new(handle, self.outbound.clone()))),
        };

        match opened {
            Ok(reply) => {
                invocation.settle(id, Ok(reply));
                Ok(())
            }
            Err(e) => {
                invocation.settle(id, Err(ScarfError::Connection(e.to_string())));
                Err(e)
            }
        }
    }
}

#[async_trait]
impl FrameHandler for InvocationRegistry {
    async fn handle_frame(&self, frame: Frame) -> std::result::Result<(), ProtocolError> {
        match frame {
            Frame::Reply { id, value } => {
                self.take(id).await?.settle(id, Ok(Reply::Value(value)));
                Ok(())
            }
            Frame::Error { id, code, message } => {
                let invocation = self.take(id).await?;
                let error = match code {
                    ErrorCode::MethodNotFound => {
                        ScarfError::MethodNotFound(invocation.method.clone())
                    }
                    ErrorCode::HandlerFailed => ScarfError::Handler(message),
                };
                invocation.settle(id, Err(error));
                Ok(())
            }
            Frame::StreamStart { id, direction } => self.start_stream(id, direction).await,
            frame if frame.is_stream_frame() => self.streams.route_frame(frame).await,
            other => Err(other.unexpected()),
        }
    }

    async fn connection_closed(&self, reason: &str) {
        let pending = {
            let mut state = self.state.lock().await;
            state.closed.get_or_insert_with(|| reason.to_string());
            std::mem::take(&mut state.pending)
        };

        if !pending.is_empty() {
            warn!("Rejecting {} pending call(s): {}", pending.len(), reason);
        }
        for (id, invocation) in pending {
            invocation.settle(id, Err(ScarfError::Connection(reason.to_string())));
        }

        self.streams.abort_all(reason).await;
    }
}
