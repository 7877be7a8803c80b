//! Length-prefixed frame codec

use crate::{Frame, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default upper bound on a frame body, 16 MiB
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix width in bytes
const LENGTH_PREFIX: usize = 4;

/// Initial capacity of the read buffer
const READ_CAPACITY: usize = 8 * 1024;

/// Encoder and incremental decoder for length-prefixed frames
///
/// Each frame is a big-endian `u32` length followed by the MessagePack body.
#[derive(Debug)]
pub struct FrameCodec {
    /// Bytes received but not decoded yet
    read_buf: BytesMut,
    /// Largest body accepted in either direction
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec with the default size limit
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Codec with a custom size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(READ_CAPACITY),
            max_frame_size,
        }
    }

    /// Maximum body size this codec accepts
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Serialize a frame and prepend its length
    pub fn encode_frame(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        let body = frame.to_msgpack()?;

        if body.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                max: self.max_frame_size,
            });
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + body.len());
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);

        Ok(buf.freeze())
    }

    /// Write already encoded frame bytes to an async writer
    ///
    /// The whole frame goes out in one `write_all`, so callers that own the
    /// writer exclusively never interleave two frames.
    pub async fn write_encoded<W>(&self, writer: &mut W, encoded: &[u8]) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Encode and write one frame
    pub async fn write_frame<W>(&self, writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let wire = self.encode_frame(frame)?;
        self.write_encoded(writer, &wire).await
    }

    /// Read the next complete frame
    ///
    /// Returns `Ok(None)` on a clean EOF between frames.
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<Frame>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(frame) = self.try_decode_frame()? {
                return Ok(Some(frame));
            }

            let n = reader.read_buf(&mut self.read_buf).await?;

            if n == 0 {
                // EOF inside a frame is a truncated frame
                return if self.read_buf.is_empty() {
                    Ok(None)
                } else {
                    Err(ProtocolError::InvalidFrame)
                };
            }
        }
    }

    /// Append raw bytes to the internal buffer
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.read_buf.extend_from_slice(data);
    }

    /// Decode one frame if a complete one is buffered
    pub fn try_decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.read_buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        // Peek at the length prefix without consuming it
        let frame_len = (&self.read_buf[..LENGTH_PREFIX]).get_u32() as usize;

        if frame_len > self.max_frame_size {
            // Reject before buffering an oversized body
            return Err(ProtocolError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }

        if self.read_buf.len() < LENGTH_PREFIX + frame_len {
            self.read_buf.reserve(LENGTH_PREFIX + frame_len - self.read_buf.len());
            return Ok(None);
        }

        self.read_buf.advance(LENGTH_PREFIX);
        let body = self.read_buf.split_to(frame_len);
        Frame::from_msgpack(&body).map(Some)
    }

    /// Number of buffered, undecoded bytes
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }

    /// Discard buffered bytes
    pub fn clear_buffer(&mut self) {
        self.read_buf.clear();
    }
}
