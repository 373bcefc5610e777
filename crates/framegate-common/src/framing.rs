//! Framegate Frame Codec
//!
//! The length-prefixed wire format spoken on worker pipes.
//!
//! # Wire Format
//!
//! ```text
//! [4-byte length prefix as u32 big-endian] + [JSON data]
//! ```
//!
//! Frames larger than [`MAX_FRAME_LEN`] and zero-length frames are refused
//! before any payload allocation; both are reported as an unexpected end of
//! stream, which callers treat the same way as a closed pipe (the worker is
//! marked dead).
//!
//! The functions are generic over tokio's async I/O traits so the same codec
//! runs against child-process pipes and in-memory duplex streams in tests.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{GateError, Result};

/// Hard upper bound on a single frame's payload (10 MiB).
pub const MAX_FRAME_LEN: u32 = 10 * 1024 * 1024;

/// Writes one frame: length prefix, then payload, then a flush.
///
/// A short write on either part surfaces as the underlying I/O error.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame and returns its payload bytes.
///
/// # Errors
///
/// - [`GateError::UnexpectedEof`] if the declared length is 0 or exceeds
///   [`MAX_FRAME_LEN`]
/// - the underlying I/O error if the stream ends mid-frame
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf);
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(GateError::UnexpectedEof);
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}
