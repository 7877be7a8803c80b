//! Per-connection stream registry
//!
//! Both connection roles keep one [`StreamMultiplexer`]. A stream is keyed by
//! the correlation id of the invocation that opened it and is registered on
//! each side either *inbound* (this side receives the chunks) or *outbound*
//! (this side produces the chunks and only waits for a terminal signal).
//!
//! Per-stream order needs no reordering buffer: frames for one id arrive
//! through a single reader loop and are forwarded into a FIFO. Inbound
//! streams opened with a window accept only as many chunks as the local side
//! has granted through `stream-credit` frames, which keeps that FIFO bounded.

use crate::{Frame, ProtocolError, StreamDirection};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Lifecycle of a stream as seen by its local handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Stream is open and may carry data
    Open,
    /// Stream completed normally
    Ended,
    /// Stream faulted, remotely or through connection teardown
    Errored,
}

impl StreamState {
    /// Check if no further events can follow
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

/// Event delivered to the local end of a stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// One chunk, in wire order
    Data(Value),
    /// The remote side ended the stream
    End,
    /// The remote side reported a fault
    Error(String),
    /// The connection went away before the stream terminated
    Aborted(String),
    /// The consumer granted room for this many further chunks
    Credit(u32),
}

impl StreamEvent {
    /// Check if the stream is over once this event is delivered
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End | Self::Error(_) | Self::Aborted(_))
    }
}

/// Registration of one open stream
#[derive(Debug)]
struct StreamInfo {
    /// Data flow direction
    direction: StreamDirection,
    /// Whether data frames are accepted for this stream
    inbound: bool,
    /// Sender feeding the local handle
    event_sender: mpsc::UnboundedSender<StreamEvent>,
    /// Local handle was dropped, swallow frames until the terminal one
    detached: bool,
    /// Chunks the peer may still send; `None` when not flow controlled
    recv_window: Option<u32>,
}

/// Stream multiplexer for managing the logical streams of one connection
#[derive(Debug, Clone)]
pub struct StreamMultiplexer {
    /// Next id handed out by [`StreamMultiplexer::allocate_id`]
    next_id: Arc<AtomicU32>,
    /// Active streams
    streams: Arc<Mutex<HashMap<u32, StreamInfo>>>,
}

/// Local end of one stream
#[derive(Debug)]
pub struct StreamHandle {
    /// Stream ID
    stream_id: u32,
    /// Data flow direction
    direction: StreamDirection,
    /// Event receiver for this stream
    event_receiver: mpsc::UnboundedReceiver<StreamEvent>,
    /// Stream state as observed by this handle
    state: StreamState,
}

impl StreamMultiplexer {
    /// Create an empty multiplexer
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU32::new(1)),
            streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Allocate a fresh correlation id
    ///
    /// Ids start at 1 and wrap around, skipping 0.
    pub fn allocate_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            if id != 0 {
                return id;
            }
        }
    }

    /// Register a stream whose data this side receives
    pub async fn open_inbound(
        &self,
        stream_id: u32,
        direction: StreamDirection,
    ) -> Result<StreamHandle, ProtocolError> {
        self.open(stream_id, direction, true, None).await
    }

    /// Register a flow-controlled stream whose data this side receives
    ///
    /// The window starts closed. Every chunk consumes one credit granted
    /// through [`StreamMultiplexer::grant_credits`]; a chunk arriving
    /// without one is a protocol violation.
    pub async fn open_inbound_windowed(
        &self,
        stream_id: u32,
        direction: StreamDirection,
    ) -> Result<StreamHandle, ProtocolError> {
        self.open(stream_id, direction, true, Some(0)).await
    }

    /// Register a stream whose data this side produces
    ///
    /// Only credit and terminal frames are accepted from the peer for it.
    pub async fn open_outbound(
        &self,
        stream_id: u32,
        direction: StreamDirection,
    ) -> Result<StreamHandle, ProtocolError> {
        self.open(stream_id, direction, false, None).await
    }

    async fn open(
        &self,
        stream_id: u32,
        direction: StreamDirection,
        inbound: bool,
        recv_window: Option<u32>,
    ) -> Result<StreamHandle, ProtocolError> {
        let (event_sender, event_receiver) = mpsc::unbounded_channel();

        let mut streams = self.streams.lock().await;
        if streams.contains_key(&stream_id) {
            return Err(ProtocolError::DuplicateStream(stream_id));
        }
        streams.insert(
            stream_id,
            StreamInfo {
                direction,
                inbound,
                event_sender,
                detached: false,
                recv_window,
            },
        );
        debug!("Opened stream: id={}, direction={:?}, inbound={}", stream_id, direction, inbound);

        Ok(StreamHandle {
            stream_id,
            direction,
            event_receiver,
            state: StreamState::Open,
        })
    }

    /// Route an incoming stream frame to the appropriate stream
    ///
    /// Terminal frames remove the stream, so anything arriving for the same
    /// id afterwards is reported as an unknown stream.
    pub async fn route_frame(&self, frame: Frame) -> Result<(), ProtocolError> {
        let (stream_id, event) = match frame {
            Frame::StreamData { id, value } => (id, StreamEvent::Data(value)),
            Frame::StreamEnd { id } => (id, StreamEvent::End),
            Frame::StreamError { id, message } => (id, StreamEvent::Error(message)),
            Frame::StreamCredit { id, credits } => (id, StreamEvent::Credit(credits)),
            other => return Err(other.unexpected()),
        };

        let mut streams = self.streams.lock().await;

        let stream_info = streams
            .get_mut(&stream_id)
            .ok_or(ProtocolError::UnknownStream(stream_id))?;

        match &event {
            StreamEvent::Data(_) if !stream_info.inbound => {
                return Err(ProtocolError::UnexpectedData(stream_id));
            }
            StreamEvent::Data(_) => {
                if let Some(window) = stream_info.recv_window.as_mut() {
                    *window = window
                        .checked_sub(1)
                        .ok_or(ProtocolError::FlowControlViolation(stream_id))?;
                }
            }
            StreamEvent::Credit(_) if stream_info.inbound => {
                return Err(ProtocolError::UnexpectedFrame {
                    kind: "stream-credit",
                    id: stream_id,
                });
            }
            _ => {}
        }

        let terminal = event.is_terminal();

        if !stream_info.detached && stream_info.event_sender.send(event).is_err() {
            debug!("Stream {} receiver dropped, discarding until terminal frame", stream_id);
            stream_info.detached = true;
        }

        if terminal {
            streams.remove(&stream_id);
            debug!("Stream {} terminated by peer", stream_id);
        }

        Ok(())
    }

    /// Open the receive window of an inbound stream by `credits` chunks
    ///
    /// Returns `false` when the stream is gone or not flow controlled; the
    /// caller then has nothing to announce to the peer.
    pub async fn grant_credits(&self, stream_id: u32, credits: u32) -> bool {
        let mut streams = self.streams.lock().await;
        match streams.get_mut(&stream_id).and_then(|info| info.recv_window.as_mut()) {
            Some(window) => {
                *window = window.saturating_add(credits);
                true
            }
            None => false,
        }
    }

    /// Forget a stream without notifying its handle
    pub async fn close_stream(&self, stream_id: u32) -> bool {
        let mut streams = self.streams.lock().await;
        streams.remove(&stream_id).is_some()
    }

    /// Fault every open stream, used on connection teardown
    ///
    /// Returns how many streams were still open.
    pub async fn abort_all(&self, reason: &str) -> usize {
        let mut streams = self.streams.lock().await;
        let count = streams.len();
        for (stream_id, stream_info) in streams.drain() {
            debug!("Aborting stream {} ({:?}): {}", stream_id, stream_info.direction, reason);
            let _ = stream_info
                .event_sender
                .send(StreamEvent::Aborted(reason.to_string()));
        }
        count
    }

    /// Number of registered streams
    pub async fn stream_count(&self) -> usize {
        let streams = self.streams.lock().await;
        streams.len()
    }

    /// Check if a stream is registered
    pub async fn is_open(&self, stream_id: u32) -> bool {
        let streams = self.streams.lock().await;
        streams.contains_key(&stream_id)
    }
}

impl Default for StreamMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamHandle {
    /// Get the stream ID
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Get the data flow direction
    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    /// State as last observed by this handle
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Receive the next event on this stream
    ///
    /// Returns `None` once a terminal event has been observed.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        std::future::poll_fn(|cx| self.poll_recv(cx)).await
    }

    /// Take an already delivered event without waiting
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        if self.state.is_terminal() {
            return None;
        }
        let event = self.event_receiver.try_recv().ok()?;
        self.observe(&event);
        Some(event)
    }

    /// Poll for the next event on this stream
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        if self.state.is_terminal() {
            return Poll::Ready(None);
        }
        match self.event_receiver.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                self.observe(&event);
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                // Sender gone without a terminal event
                self.state = StreamState::Errored;
                Poll::Ready(Some(StreamEvent::Aborted("stream closed".to_string())))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn observe(&mut self, event: &StreamEvent) {
        self.state = match event {
            StreamEvent::Data(_) | StreamEvent::Credit(_) => StreamState::Open,
            StreamEvent::End => StreamState::Ended,
            StreamEvent::Error(_) | StreamEvent::Aborted(_) => StreamState::Errored,
        };
    }
}
