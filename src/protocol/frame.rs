//! Length-prefixed framing for the inter-proxy link.
//!
//! Wire format: `[u32 big-endian length][payload]`. No magic, version or
//! checksum. A reader rejects lengths above its configured maximum and the
//! link is considered corrupt from then on.

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default upper bound for a frame payload (16 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    /// Payload length exceeds the configured maximum.
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },

    /// Peer closed the link on a frame boundary.
    #[error("link closed")]
    Closed,

    /// Peer closed the link in the middle of a frame.
    #[error("link closed mid-frame")]
    Truncated,

    #[error("link I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Whether the peer closed the link cleanly between frames.
    pub fn is_orderly_close(&self) -> bool {
        matches!(self, FrameError::Closed)
    }
}

/// Frame encoder/decoder bound to a maximum payload size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Encode one frame into a contiguous buffer.
    pub fn encode(&self, payload: &[u8]) -> Result<BytesMut, FrameError> {
        self.check_len(payload.len())?;
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        Ok(buf)
    }

    /// Write one complete frame and flush.
    ///
    /// The prefix and payload go out in a single `write_all` so that a
    /// writer holding exclusive access never leaves a partial frame behind
    /// except on I/O failure.
    pub async fn write_frame<W>(&self, writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode(payload)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read exactly one frame and return its payload.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Vec<u8>, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        let mut filled = 0;
        while filled < LENGTH_PREFIX_LEN {
            let n = reader.read(&mut prefix[filled..]).await?;
            if n == 0 {
                return Err(if filled == 0 {
                    FrameError::Closed
                } else {
                    FrameError::Truncated
                });
            }
            filled += n;
        }

        let len = u32::from_be_bytes(prefix) as usize;
        self.check_len(len)?;

        let mut payload = vec![0u8; len];
        match reader.read_exact(&mut payload).await {
            Ok(_) => Ok(payload),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FrameError::Truncated),
            Err(e) => Err(FrameError::Io(e)),
        }
    }

    fn check_len(&self, len: usize) -> Result<(), FrameError> {
        if len > self.max_frame_bytes || len > u32::MAX as usize {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}
