//! Length-prefixed framing of replication messages over a byte stream
//!
//! Each frame is a `u32` little-endian payload length followed by one encoded
//! [`Message`]. The reader keeps partially received frames in its buffer, so
//! [`FrameReader::read_message`] is cancel-safe and can sit in a
//! `tokio::select!` next to timers.

use super::codec::{self, ProtocolError};
use super::message::Message;
use super::types::{ReplicationError, ReplicationResult};
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_HEADER_LEN: usize = 4;

/// Default upper bound on a single frame payload (64 MB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
    max_frame_bytes: usize,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(8 * 1024),
            max_frame_bytes,
            bytes_read: 0,
        }
    }

    /// Read the next message
    ///
    /// Returns `Ok(None)` on a clean end of stream between frames.
    pub async fn read_message(&mut self) -> ReplicationResult<Option<Message>> {
        loop {
            if let Some(msg) = self.parse_frame()? {
                return Ok(Some(msg));
            }

            let n = self.reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                // Peer went away in the middle of a frame
                let available = self.buffer.len();
                return Err(ProtocolError::Truncated {
                    needed: self.pending_frame_len().unwrap_or(FRAME_HEADER_LEN),
                    available,
                }
                .into());
            }
            self.bytes_read += n as u64;
        }
    }

    /// Total bytes received so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn pending_frame_len(&self) -> Option<usize> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return None;
        }
        let mut header = &self.buffer[..FRAME_HEADER_LEN];
        Some(FRAME_HEADER_LEN + header.get_u32_le() as usize)
    }

    fn parse_frame(&mut self) -> ReplicationResult<Option<Message>> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = &self.buffer[..FRAME_HEADER_LEN];
        let length = header.get_u32_le() as usize;
        if length > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: length,
            }
            .into());
        }

        if self.buffer.len() < FRAME_HEADER_LEN + length {
            // Partial frame, wait for the rest
            self.buffer.reserve(FRAME_HEADER_LEN + length - self.buffer.len());
            return Ok(None);
        }

        self.buffer.advance(FRAME_HEADER_LEN);
        let payload = self.buffer.split_to(length).freeze();
        let msg = codec::decode(payload)?;
        Ok(Some(msg))
    }
}

pub struct FrameWriter<W> {
    writer: W,
    buffer: BytesMut,
    max_frame_bytes: usize,
    bytes_written: u64,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            buffer: BytesMut::with_capacity(8 * 1024),
            max_frame_bytes,
            bytes_written: 0,
        }
    }

    /// Write one framed message and flush it to the transport
    pub async fn write_message(&mut self, msg: &Message) -> ReplicationResult<usize> {
        let len = encode_frame(msg, self.max_frame_bytes, &mut self.buffer)?;
        self.writer.write_all(&self.buffer).await?;
        self.writer.flush().await?;
        self.buffer.clear();
        self.bytes_written += len as u64;
        Ok(len)
    }

    /// Total bytes sent so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Shut the write side down, signalling end of stream to the peer
    pub async fn shutdown(&mut self) -> ReplicationResult<()> {
        self.writer.shutdown().await.map_err(ReplicationError::from)
    }
}

/// Encode `msg` as a frame into `buf`, returning the frame length
pub fn encode_frame(
    msg: &Message,
    max_frame_bytes: usize,
    buf: &mut BytesMut,
) -> Result<usize, ProtocolError> {
    let payload_len = codec::encoded_len(msg);
    if payload_len > max_frame_bytes || payload_len > u32::MAX as usize {
        return Err(ProtocolError::FrameTooLarge {
            max_frame_bytes,
            got_bytes: payload_len,
        });
    }

    buf.clear();
    buf.reserve(FRAME_HEADER_LEN + payload_len);
    buf.put_u32_le(payload_len as u32);
    codec::encode_into(msg, buf)?;
    Ok(buf.len())
}
