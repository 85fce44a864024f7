//! Length-prefixed framing over pipe descriptors.
//!
//! Every frame is a 4-byte signed little-endian length followed by that many
//! payload bytes:
//!
//! ```text
//! [i32 length][payload, 1..=MAX_PAYLOAD bytes]
//! ```
//!
//! Pipes deliver small writes atomically, so the reader takes the header and
//! then exactly `length` bytes. There is no resynchronisation: a short or
//! oversized frame leaves the stream in an unknown state and the caller must
//! close the channel.

use std::io::{self, Read, Write};
use std::sync::Arc;

use thiserror::Error;

/// Size of the fixed receive buffer a frame must fit into.
pub const MAX_FRAME: usize = 8192;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD: usize = MAX_FRAME - 1;

const HEADER_LEN: usize = 4;

/// Errors raised while reading or writing frames.
#[derive(Debug, Clone, Error)]
pub enum FramingError {
    /// The underlying descriptor failed.
    #[error("frame I/O failed: {0}")]
    Io(#[source] Arc<io::Error>),

    /// A frame exceeded [`MAX_PAYLOAD`].
    #[error("frame of {len} bytes exceeds the {MAX_PAYLOAD} byte limit")]
    Oversized {
        /// Declared or attempted payload length.
        len: usize,
    },

    /// The stream ended part way through a frame.
    #[error("truncated frame: expected {expected} bytes, received {received}")]
    Truncated {
        /// Bytes the frame declared.
        expected: usize,
        /// Bytes actually read.
        received: usize,
    },
}

impl From<io::Error> for FramingError {
    fn from(error: io::Error) -> Self {
        Self::Io(Arc::new(error))
    }
}

/// Result of a single [`read_frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// One complete payload.
    Frame(Vec<u8>),
    /// The peer closed its end, or sent a non-positive length.
    EndOfStream,
}

/// Writes one frame and flushes the writer.
///
/// Header and payload go out in a single `write_all` so that concurrent
/// writers serialised by a mutex never interleave partial frames.
///
/// # Errors
///
/// Returns [`FramingError::Oversized`] before writing anything when the
/// payload is too large, or [`FramingError::Io`] when the write fails.
pub fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FramingError>
where
    W: Write + ?Sized,
{
    let len = payload.len();
    if len > MAX_PAYLOAD {
        return Err(FramingError::Oversized { len });
    }
    let declared = i32::try_from(len).map_err(|_| FramingError::Oversized { len })?;
    #[expect(
        clippy::little_endian_bytes,
        reason = "the length prefix has a fixed little-endian wire layout"
    )]
    let prefix = declared.to_le_bytes();
    let mut frame = Vec::with_capacity(HEADER_LEN + len);
    frame.extend_from_slice(&prefix);
    frame.extend_from_slice(payload);
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame, blocking until it is complete.
///
/// # Errors
///
/// Returns [`FramingError::Oversized`] for a declared length above
/// [`MAX_PAYLOAD`], [`FramingError::Truncated`] when the stream ends inside a
/// frame, and [`FramingError::Io`] for descriptor failures.
pub fn read_frame<R>(reader: &mut R) -> Result<ReadOutcome, FramingError>
where
    R: Read + ?Sized,
{
    let mut header = [0_u8; HEADER_LEN];
    let header_read = read_fully(reader, &mut header)?;
    if header_read == 0 {
        return Ok(ReadOutcome::EndOfStream);
    }
    if header_read < HEADER_LEN {
        return Err(FramingError::Truncated {
            expected: HEADER_LEN,
            received: header_read,
        });
    }

    #[expect(
        clippy::little_endian_bytes,
        reason = "the length prefix has a fixed little-endian wire layout"
    )]
    let declared = i32::from_le_bytes(header);
    let len = match usize::try_from(declared) {
        Ok(0) | Err(_) => return Ok(ReadOutcome::EndOfStream),
        Ok(len) => len,
    };
    if len > MAX_PAYLOAD {
        return Err(FramingError::Oversized { len });
    }

    let mut payload = vec![0_u8; len];
    let payload_read = read_fully(reader, &mut payload)?;
    if payload_read < len {
        return Err(FramingError::Truncated {
            expected: len,
            received: payload_read,
        });
    }
    Ok(ReadOutcome::Frame(payload))
}

/// Fills `buf` until it is full or the reader reports end of stream.
fn read_fully<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: Read + ?Sized,
{
    let mut filled = 0;
    while let Some(rest) = buf.get_mut(filled..) {
        if rest.is_empty() {
            break;
        }
        match reader.read(rest) {
            Ok(0) => break,
            Ok(count) => filled += count,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
    Ok(filled)
}
