//! Length-prefixed framing shared by the server and the client.
//!
//! Every frame on the wire is a 4-byte big-endian length `N` followed by
//! exactly `N` payload bytes. Frames may be pipelined back to back on one
//! stream, so the reader never consumes more than the current frame.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest payload accepted by [`read_frame`].
///
/// A prefix above this is treated as a corrupt stream rather than an
/// allocation request.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Failure while moving a frame across a stream.
///
/// Every variant means the stream is no longer usable.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),
}

impl FrameError {
    /// True when the peer closed the stream cleanly before a new frame started.
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameError::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Prefixes `payload` with its big-endian length.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Writes one frame and flushes it.
///
/// The prefix and payload go out as a single buffer; a short write surfaces
/// as an error and is not retried.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads exactly one frame.
///
/// Waits for the first header byte, then reads the remaining header and
/// `len` payload bytes across however many socket reads they take. A zero
/// length yields an empty payload.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}
