//! Incremental header framing.
//!
//! Reads raw bytes off a stream into a bounded buffer until the CRLFCRLF
//! terminator appears, never consuming a byte past it. The caller owns the
//! buffer, so a timed-out read can be resumed with a longer timeout without
//! losing partial bytes, and the keep-alive probe byte is pre-seeded
//! explicitly instead of hiding in reader state.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time;

use crate::error::FrameError;

/// Maximum header block size. Matches the limit common servers enforce.
pub const MAX_HEADER_SIZE: usize = 8192;

/// Reads header bytes from `reader` into `buf` until the last four buffered
/// bytes are `\r\n\r\n`.
///
/// `buf` may be pre-seeded with the carry-over byte from keep-alive probing,
/// or with the partial bytes of a previous call that failed with
/// [`FrameError::Timeout`]. On success `buf` holds the raw header block
/// including the terminator and the stream is positioned exactly one byte
/// past it.
pub async fn read_header<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    timeout: Duration,
) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    if ends_with_terminator(buf) {
        return Ok(());
    }

    let mut byte = [0u8; 1];
    loop {
        if buf.len() >= MAX_HEADER_SIZE {
            return Err(FrameError::HeaderTooLarge {
                limit: MAX_HEADER_SIZE,
            });
        }

        let read = time::timeout(timeout, reader.read(&mut byte))
            .await
            .map_err(|_| FrameError::Timeout)??;
        if read == 0 {
            return Err(FrameError::PeerClosed);
        }
        buf.push(byte[0]);

        if ends_with_terminator(buf) {
            return Ok(());
        }
    }
}

fn ends_with_terminator(buf: &[u8]) -> bool {
    buf.len() >= 4 && buf[buf.len() - 4..] == *b"\r\n\r\n"
}
