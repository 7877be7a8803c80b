//! Caller-side stream proxies

use crate::connection::Outbound;
use crate::{Result, ScarfError};
use futures::stream::{Stream, TryStreamExt};
use scarf_proto::{Frame, ProtocolError, StreamEvent, StreamHandle, StreamState, Value};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tracing::debug;

/// Chunks produced by a remote readable handler
///
/// Yields chunks in the order the handler produced them and ends after the
/// handler's end signal. A remote fault or a lost connection is yielded as
/// the final `Err` item.
#[derive(Debug)]
pub struct ReadableStream {
    handle: StreamHandle,
}

impl ReadableStream {
    pub(crate) fn new(handle: StreamHandle) -> Self {
        Self { handle }
    }

    /// Stream id, equal to the id of the call that opened it
    pub fn id(&self) -> u32 {
        self.handle.stream_id()
    }

    /// Current stream state
    pub fn state(&self) -> StreamState {
        self.handle.state()
    }

    /// Receive the next chunk; `None` after the end
    pub async fn next_chunk(&mut self) -> Option<Result<Value>> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Read every remaining chunk
    pub async fn collect_all(self) -> Result<Vec<Value>> {
        self.try_collect().await
    }
}

impl Stream for ReadableStream {
    type Item = Result<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let item = match ready!(self.handle.poll_recv(cx)) {
                Some(StreamEvent::Data(chunk)) => Some(Ok(chunk)),
                Some(StreamEvent::End) | None => None,
                Some(StreamEvent::Error(message)) => Some(Err(ScarfError::Handler(message))),
                Some(StreamEvent::Aborted(reason)) => Some(Err(ScarfError::Connection(reason))),
                Some(StreamEvent::Credit(_)) => continue,
            };
            return Poll::Ready(item);
        }
    }
}

/// Sink for chunks consumed by a remote writable handler
///
/// Call [`WritableStream::end`] to finish; it resolves once the handler has
/// processed every chunk. Dropping the stream without ending it aborts the
/// remote sink.
#[derive(Debug)]
pub struct WritableStream {
    handle: StreamHandle,
    outbound: Outbound,
    /// Chunks the handler has room for
    credits: u32,
    /// Local end already sent its terminal frame
    ended: bool,
    /// Terminal event received before `end`
    terminal: Option<StreamEvent>,
}

impl WritableStream {
    pub(crate) fn new(handle: StreamHandle, outbound: Outbound) -> Self {
        Self {
            handle,
            outbound,
            credits: 0,
            ended: false,
            terminal: None,
        }
    }

    /// Stream id, equal to the id of the call that opened it
    pub fn id(&self) -> u32 {
        self.handle.stream_id()
    }

    /// Send one chunk
    ///
    /// Waits until the handler's sink has room for another chunk and the
    /// connection's outgoing queue accepts it. Fails once the remote handler
    /// has faulted the stream.
    pub async fn write(&mut self, chunk: impl Into<Value>) -> Result<()> {
        self.drain_delivered();
        while self.terminal.is_none() && self.credits == 0 {
            match self.handle.recv().await {
                Some(event) => self.absorb(event),
                None => return Err(ScarfError::closed()),
            }
        }
        if let Some(event) = &self.terminal {
            return Err(self.terminal_error(event));
        }

        self.outbound
            .send(Frame::stream_data(self.id(), chunk.into()))
            .await?;
        self.credits -= 1;
        Ok(())
    }

    /// Signal the end of the stream and wait for the handler to finish
    pub async fn end(mut self) -> Result<()> {
        self.ended = true;
        let id = self.id();
        debug!("Ending writable stream {}", id);

        self.drain_delivered();
        if let Some(StreamEvent::Aborted(reason)) = &self.terminal {
            return Err(ScarfError::Connection(reason.clone()));
        }

        // The peer keeps draining after a fault until it sees this frame
        self.outbound.send(Frame::stream_end(id)).await?;

        while self.terminal.is_none() {
            match self.handle.recv().await {
                Some(event) => self.absorb(event),
                None => return Err(ScarfError::closed()),
            }
        }
        match self.terminal.take() {
            Some(StreamEvent::End) => Ok(()),
            Some(event) => Err(self.terminal_error(&event)),
            None => Err(ScarfError::closed()),
        }
    }

    /// Apply events that already arrived, without waiting
    fn drain_delivered(&mut self) {
        while self.terminal.is_none() {
            match self.handle.try_recv() {
                Some(event) => self.absorb(event),
                None => break,
            }
        }
    }

    fn absorb(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Credit(credits) => self.credits = self.credits.saturating_add(credits),
            event => {
                self.terminal.get_or_insert(event);
            }
        }
    }

    fn terminal_error(&self, event: &StreamEvent) -> ScarfError {
        match event {
            StreamEvent::Error(message) => ScarfError::Handler(message.clone()),
            StreamEvent::Aborted(reason) => ScarfError::Connection(reason.clone()),
            StreamEvent::End => ScarfError::Protocol(ProtocolError::StreamClosed),
            StreamEvent::Data(_) | StreamEvent::Credit(_) => {
                ScarfError::Protocol(ProtocolError::UnexpectedData(self.id()))
            }
        }
    }
}

impl Drop for WritableStream {
    fn drop(&mut self) {
        if self.ended || matches!(self.terminal, Some(StreamEvent::Aborted(_))) {
            return;
        }

        // The registration stays until the handler's terminal frame arrives;
        // frames in between are discarded by the multiplexer
        let id = self.id();
        debug!("Writable stream {} dropped before end", id);
        self.outbound
            .send_detached(Frame::stream_error(id, "stream dropped before end"));
    }
}
