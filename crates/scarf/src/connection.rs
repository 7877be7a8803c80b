//! Connection management: single reader, single writer
//!
//! Every frame leaves through one bounded queue drained by one writer task,
//! so frames are never interleaved on the socket. One reader task decodes
//! incoming frames and hands them, in arrival order, to the role's
//! [`FrameHandler`]: the dispatcher on a server, the invocation registry on
//! a client.

use crate::config::ConnectionConfig;
use crate::{Result, ScarfError};
use async_trait::async_trait;
use bytes::Bytes;
use scarf_proto::{Frame, FrameCodec, ProtocolError};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Which end of the protocol a connection plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Issues calls, receives replies
    Client,
    /// Receives calls, runs handlers
    Server,
}

/// Cloneable handle onto a connection's single write path
#[derive(Debug, Clone)]
pub(crate) struct Outbound {
    /// Encoded frames waiting for the writer task
    frame_tx: mpsc::Sender<Bytes>,
    /// Encoder enforcing the frame size limit
    codec: Arc<FrameCodec>,
}

impl Outbound {
    /// Create the write path and the receiving end for the writer task
    pub(crate) fn channel(config: &ConnectionConfig) -> (Self, mpsc::Receiver<Bytes>) {
        let (frame_tx, frame_rx) = mpsc::channel(config.write_buffer.max(1));
        let outbound = Self {
            frame_tx,
            codec: Arc::new(FrameCodec::with_max_frame_size(config.max_frame_size)),
        };
        (outbound, frame_rx)
    }

    /// Encode a frame and queue it, waiting while the queue is full
    ///
    /// Encoding failures are returned to the caller and never reach the wire.
    pub(crate) async fn send(&self, frame: Frame) -> Result<()> {
        let encoded = self.codec.encode_frame(&frame)?;
        self.frame_tx
            .send(encoded)
            .await
            .map_err(|_| ScarfError::closed())?;
        debug!("Queued frame: type={}, id={}", frame.kind(), frame.id());
        Ok(())
    }

    /// Queue a frame from synchronous code such as `Drop`
    ///
    /// While the queue is full the frame is handed to a spawned task, so it
    /// still goes out after everything already queued.
    pub(crate) fn send_detached(&self, frame: Frame) {
        let (kind, id) = (frame.kind(), frame.id());
        let encoded = match self.codec.encode_frame(&frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Dropping {} frame for {}: {}", kind, id, e);
                return;
            }
        };

        match self.frame_tx.try_send(encoded) {
            Ok(()) => debug!("Queued frame: type={}, id={}", kind, id),
            Err(TrySendError::Full(encoded)) => match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let frame_tx = self.frame_tx.clone();
                    runtime.spawn(async move {
                        if frame_tx.send(encoded).await.is_err() {
                            debug!("Write path closed before {} frame for {}", kind, id);
                        }
                    });
                }
                Err(_) => warn!("No runtime to queue {} frame for {}", kind, id),
            },
            Err(TrySendError::Closed(_)) => {
                debug!("Write path closed, dropping {} frame for {}", kind, id)
            }
        }
    }
}

/// Receiver of decoded frames for one role
#[async_trait]
pub(crate) trait FrameHandler: Send + Sync + 'static {
    /// Process one incoming frame; an error tears the connection down
    async fn handle_frame(&self, frame: Frame) -> std::result::Result<(), ProtocolError>;

    /// Fault everything still outstanding on the connection
    async fn connection_closed(&self, reason: &str);
}

/// One live connection
///
/// Cloning yields another handle onto the same connection.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Unique connection ID, used in logs
    id: Uuid,
    /// Role of this end
    role: Role,
    /// Cancelled to start teardown
    shutdown: CancellationToken,
    /// Cancelled once teardown has faulted all outstanding work
    terminated: CancellationToken,
}

impl Connection {
    /// Spawn the reader and writer tasks for `socket`
    ///
    /// `build` receives the write path and the shutdown token and returns
    /// the role's frame handler.
    pub(crate) fn start<S, H, F>(
        socket: S,
        role: Role,
        config: &ConnectionConfig,
        shutdown: CancellationToken,
        build: F,
    ) -> (Self, Arc<H>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        H: FrameHandler,
        F: FnOnce(Outbound, CancellationToken) -> H,
    {
        let id = Uuid::new_v4();
        let (outbound, frame_rx) = Outbound::channel(config);
        let handler = Arc::new(build(outbound, shutdown.clone()));
        let terminated = CancellationToken::new();
        let (reader, writer) = tokio::io::split(socket);

        info!("Connection {} opened as {:?}", id, role);

        tokio::spawn(write_loop(id, writer, frame_rx, shutdown.clone()));
        tokio::spawn(read_loop(
            id,
            reader,
            FrameCodec::with_max_frame_size(config.max_frame_size),
            Arc::clone(&handler),
            shutdown.clone(),
            terminated.clone(),
        ));

        let connection = Self {
            id,
            role,
            shutdown,
            terminated,
        };
        (connection, handler)
    }

    /// Get the connection ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the role of this end
    pub fn role(&self) -> Role {
        self.role
    }

    /// Start tearing the connection down
    ///
    /// Outstanding invocations and streams are faulted; nothing is sent or
    /// received afterwards. Calling this more than once has no further effect.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("Closing connection {}", self.id);
        }
        self.shutdown.cancel();
    }

    /// Check if teardown has started
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait until teardown has completed
    pub async fn closed(&self) {
        self.terminated.cancelled().await;
    }
}

/// Drain the outgoing queue onto the socket, one whole frame at a time
async fn write_loop<W>(
    id: Uuid,
    mut writer: W,
    mut frame_rx: mpsc::Receiver<Bytes>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let codec = FrameCodec::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            encoded = frame_rx.recv() => {
                let Some(encoded) = encoded else {
                    debug!("Connection {} write path released", id);
                    break;
                };
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = codec.write_encoded(&mut writer, &encoded) => {
                        if let Err(e) = result {
                            error!("Failed to write frame on connection {}: {}", id, e);
                            break;
                        }
                    }
                }
            }
        }
    }

    shutdown.cancel();
    frame_rx.close();
    let _ = writer.shutdown().await;
    debug!("Connection {} writer stopped", id);
}

/// Decode frames and hand them to the role handler until the connection ends
async fn read_loop<R, H>(
    id: Uuid,
    mut reader: R,
    mut codec: FrameCodec,
    handler: Arc<H>,
    shutdown: CancellationToken,
    terminated: CancellationToken,
) where
    R: AsyncRead + Unpin,
    H: FrameHandler,
{
    let reason = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break "connection closed".to_string(),

            result = codec.read_frame(&mut reader) => match result {
                Ok(Some(frame)) => {
                    debug!("Connection {} received frame: type={}, id={}", id, frame.kind(), frame.id());
                    if let Err(e) = handler.handle_frame(frame).await {
                        error!("Protocol violation on connection {}: {}", id, e);
                        break format!("protocol error: {}", e);
                    }
                }
                Ok(None) => {
                    info!("Connection {} closed by peer", id);
                    break "connection closed by peer".to_string();
                }
                Err(ProtocolError::Io(e)) => {
                    error!("Failed to read from connection {}: {}", id, e);
                    break format!("connection reset: {}", e);
                }
                Err(e) => {
                    error!("Failed to decode frame on connection {}: {}", id, e);
                    break format!("protocol error: {}", e);
                }
            }
        }
    };

    shutdown.cancel();
    handler.connection_closed(&reason).await;
    terminated.cancel();
    info!("Connection {} terminated: {}", id, reason);
}
