//! Server-side call dispatch
//!
//! Each `call` frame runs in its own task. Whatever the handler does, the
//! invocation ends in exactly one of `reply`, `error` or `stream-start`, and
//! a started stream ends in exactly one of `stream-end` or `stream-error`.
//!
//! Writable streams are flow controlled: the caller starts with
//! `stream_window` credits and gets one back per chunk the sink has taken.

use crate::connection::{FrameHandler, Outbound};
use crate::handler::{panic_message, ChunkStream, HandlerError, Outcome, StreamSink};
use crate::methods::MethodTable;
use crate::ScarfError;
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use scarf_proto::{
    ErrorCode, Frame, ProtocolError, StreamDirection, StreamEvent, StreamMultiplexer, Value,
};
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-connection dispatcher
#[derive(Clone)]
pub struct Dispatcher {
    /// Shared, read-only method table
    methods: Arc<MethodTable>,
    /// Write path of the connection
    outbound: Outbound,
    /// Streams opened by handlers on this connection
    streams: StreamMultiplexer,
    /// Call ids whose invocation has not finished yet
    in_flight: Arc<Mutex<HashSet<u32>>>,
    /// Initial credit granted on every writable stream
    stream_window: u32,
    /// Connection teardown signal
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Create a dispatcher for one connection
    pub(crate) fn new(
        methods: Arc<MethodTable>,
        outbound: Outbound,
        stream_window: u32,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            methods,
            outbound,
            streams: StreamMultiplexer::new(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            stream_window: stream_window.max(1),
            shutdown,
        }
    }

    /// Start an invocation
    ///
    /// Fails only when `id` is still in use on this connection.
    pub async fn dispatch(
        &self,
        id: u32,
        name: String,
        args: Vec<Value>,
    ) -> Result<(), ProtocolError> {
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(id) {
                return Err(ProtocolError::DuplicateInvocation(id));
            }
        }

        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.run_invocation(id, &name, args).await;
            dispatcher.in_flight.lock().await.remove(&id);
        });

        Ok(())
    }

    /// Number of invocations still running
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Number of streams still open
    pub async fn stream_count(&self) -> usize {
        self.streams.stream_count().await
    }

    async fn run_invocation(&self, id: u32, name: &str, args: Vec<Value>) {
        let handler = match self.methods.resolve(name) {
            Ok(handler) => handler,
            Err(e) => {
                warn!("Call {} for unknown method {:?}", id, name);
                self.emit(Frame::error(id, ErrorCode::MethodNotFound, e.to_string()))
                    .await;
                return;
            }
        };

        debug!("Invoking method: id={}, name={}", id, name);

        let result = tokio::select! {
            _ = self.shutdown.cancelled() => {
                debug!("Invocation {} abandoned by connection teardown", id);
                return;
            }
            result = guarded(handler.call(args)) => result,
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(message) => {
                debug!("Method {} failed: id={}, error={}", name, id, message);
                self.emit(Frame::error(id, ErrorCode::HandlerFailed, message))
                    .await;
                return;
            }
        };

        debug!("Method {} resolved: id={}, outcome={}", name, id, outcome.kind());

        match outcome {
            Outcome::Value(value) => self.send_reply(id, value).await,
            Outcome::Readable(source) => self.relay_readable(id, source).await,
            Outcome::Writable(sink) => self.relay_writable(id, sink).await,
        }
    }

    async fn send_reply(&self, id: u32, value: Value) {
        match self.outbound.send(Frame::reply(id, value)).await {
            Ok(()) => {}
            Err(ScarfError::Protocol(e)) => {
                warn!("Reply {} could not be encoded: {}", id, e);
                self.emit(Frame::error(id, ErrorCode::HandlerFailed, e.to_string()))
                    .await;
            }
            Err(e) => debug!("Dropping reply {}: {}", id, e),
        }
    }

    /// Forward a handler-produced stream chunk by chunk
    async fn relay_readable(&self, id: u32, mut source: ChunkStream) {
        let mut handle = match self.streams.open_outbound(id, StreamDirection::Readable).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Cannot open stream {}: {}", id, e);
                self.emit(Frame::error(id, ErrorCode::HandlerFailed, e.to_string()))
                    .await;
                return;
            }
        };

        if self.emit(Frame::stream_start(id, StreamDirection::Readable)).await {
            loop {
                tokio::select! {
                    biased;

                    event = handle.recv() => {
                        if let Some(StreamEvent::Credit(_)) = event {
                            continue;
                        }
                        debug!("Readable stream {} stopped: {:?}", id, event);
                        break;
                    }

                    _ = self.shutdown.cancelled() => break,

                    item = AssertUnwindSafe(source.next()).catch_unwind() => {
                        let frame = match item {
                            Ok(Some(Ok(chunk))) => Frame::stream_data(id, chunk),
                            Ok(Some(Err(e))) => Frame::stream_error(id, e.message()),
                            Ok(None) => Frame::stream_end(id),
                            Err(payload) => Frame::stream_error(id, panic_message(payload)),
                        };
                        let terminal = !matches!(frame, Frame::StreamData { .. });

                        match self.outbound.send(frame).await {
                            Ok(()) if terminal => break,
                            Ok(()) => {}
                            Err(ScarfError::Protocol(e)) => {
                                warn!("Chunk on stream {} could not be encoded: {}", id, e);
                                self.emit(Frame::stream_error(id, e.to_string())).await;
                                break;
                            }
                            Err(e) => {
                                debug!("Readable stream {} interrupted: {}", id, e);
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.streams.close_stream(id).await;
    }

    /// Feed caller-written chunks into the handler's sink
    async fn relay_writable(&self, id: u32, mut sink: Box<dyn StreamSink>) {
        let mut handle = match self
            .streams
            .open_inbound_windowed(id, StreamDirection::Writable)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Cannot open stream {}: {}", id, e);
                self.emit(Frame::error(id, ErrorCode::HandlerFailed, e.to_string()))
                    .await;
                return;
            }
        };

        if !self.emit(Frame::stream_start(id, StreamDirection::Writable)).await
            || !self.grant(id, self.stream_window).await
        {
            self.streams.close_stream(id).await;
            abort_sink(sink.as_mut(), "connection closed").await;
            return;
        }

        // After a sink fault the remaining chunks are drained until the caller's terminal frame
        let mut failed = false;

        loop {
            let event = tokio::select! {
                biased;
                event = handle.recv() => event,
                _ = self.shutdown.cancelled() => None,
            };

            match event {
                Some(StreamEvent::Data(chunk)) => {
                    if failed {
                        continue;
                    }
                    match guarded(sink.write(chunk)).await {
                        Ok(()) => {
                            self.grant(id, 1).await;
                        }
                        Err(message) => {
                            debug!("Sink for stream {} failed: {}", id, message);
                            failed = true;
                            self.emit(Frame::stream_error(id, message)).await;
                        }
                    }
                }
                Some(StreamEvent::End) => {
                    if !failed {
                        let ack = match guarded(sink.finish()).await {
                            Ok(()) => Frame::stream_end(id),
                            Err(message) => Frame::stream_error(id, message),
                        };
                        self.emit(ack).await;
                    }
                    break;
                }
                Some(StreamEvent::Error(reason)) => {
                    if !failed {
                        debug!("Writable stream {} aborted by caller: {}", id, reason);
                        abort_sink(sink.as_mut(), &reason).await;
                        // The caller keeps the id reserved until this arrives
                        self.emit(Frame::stream_error(id, reason)).await;
                    }
                    break;
                }
                Some(StreamEvent::Aborted(reason)) => {
                    if !failed {
                        abort_sink(sink.as_mut(), &reason).await;
                    }
                    break;
                }
                Some(StreamEvent::Credit(_)) => {}
                None => {
                    if !failed {
                        abort_sink(sink.as_mut(), "connection closed").await;
                    }
                    break;
                }
            }
        }

        self.streams.close_stream(id).await;
    }

    /// Open the caller's window on a writable stream by `credits` chunks
    async fn grant(&self, id: u32, credits: u32) -> bool {
        if !self.streams.grant_credits(id, credits).await {
            return false;
        }
        self.emit(Frame::stream_credit(id, credits)).await
    }

    /// Send a frame, logging instead of failing
    async fn emit(&self, frame: Frame) -> bool {
        let kind = frame.kind();
        let id = frame.id();
        match self.outbound.send(frame).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropping {} frame for {}: {}", kind, id, e);
                false
            }
        }
    }
}

/// Run handler code, turning both returned errors and panics into a message
async fn guarded<F, T>(future: F) -> Result<T, String>
where
    F: Future<Output = Result<T, HandlerError>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.message().to_string()),
        Err(payload) => {
            let message = panic_message(payload);
            warn!("Handler panicked: {}", message);
            Err(message)
        }
    }
}

async fn abort_sink(sink: &mut dyn StreamSink, reason: &str) {
    if AssertUnwindSafe(sink.abort(reason)).catch_unwind().await.is_err() {
        warn!("Sink panicked while aborting");
    }
}

#[async_trait]
impl FrameHandler for Dispatcher {
    async fn handle_frame(&self, frame: Frame) -> Result<(), ProtocolError> {
        match frame {
            Frame::Call { id, name, args } => self.dispatch(id, name, args).await,
            frame if frame.is_stream_frame() => self.streams.route_frame(frame).await,
            other => Err(other.unexpected()),
        }
    }

    async fn connection_closed(&self, reason: &str) {
        let aborted = self.streams.abort_all(reason).await;
        if aborted > 0 {
            info!("Aborted {} open stream(s): {}", aborted, reason);
        }
    }
}
