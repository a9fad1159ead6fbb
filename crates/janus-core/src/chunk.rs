//! Chunked transfer-encoding decoder.
//!
//! Consumes a chunked body one chunk at a time, keeping both the decoded
//! payload and the verbatim wire bytes: relaying forwards the wire form
//! untouched, while caching and tests want the reassembled payload.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time;

use crate::error::ChunkError;

/// Scratch limit for a single chunk size or trailer line.
pub const CHUNK_LINE_LIMIT: usize = 1024;

/// One chunk: its declared size, the raw size line, and the data bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkExtent {
    /// Decoded hex size.
    pub size: usize,
    /// Verbatim size line including any `;` extensions and the CRLF.
    pub size_line: Vec<u8>,
    /// Exactly `size` data bytes.
    pub data: Vec<u8>,
}

impl ChunkExtent {
    /// Appends this chunk's wire form (size line, data, CRLF).
    pub fn write_wire(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.size_line);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(b"\r\n");
    }
}

/// A fully consumed chunked body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedBody {
    /// The data chunks, in wire order.
    pub extents: Vec<ChunkExtent>,
    /// Verbatim terminal bytes: the zero-size line, any trailer lines, and
    /// the final CRLF.
    pub trailer: Vec<u8>,
}

impl ChunkedBody {
    /// The reassembled payload: chunk data concatenated in order.
    pub fn decoded(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.decoded_len());
        for extent in &self.extents {
            out.extend_from_slice(&extent.data);
        }
        out
    }

    /// Total decoded payload length.
    pub fn decoded_len(&self) -> usize {
        self.extents.iter().map(|e| e.size).sum()
    }

    /// The verbatim wire form, byte-for-byte as read.
    pub fn wire(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for extent in &self.extents {
            extent.write_wire(&mut out);
        }
        out.extend_from_slice(&self.trailer);
        out
    }
}

/// Reads a complete chunked body from `reader`, which must be positioned
/// right after a header that declared `Transfer-Encoding: chunked`.
///
/// Stops after the terminal zero-size chunk and its trailers; the stream is
/// positioned exactly one byte past the final CRLF.
pub async fn read_chunked_body<R>(
    reader: &mut R,
    timeout: Duration,
) -> Result<ChunkedBody, ChunkError>
where
    R: AsyncRead + Unpin,
{
    let mut extents: Vec<ChunkExtent> = Vec::new();
    loop {
        let size_line = read_metadata_line(reader, timeout).await?;
        let size = parse_chunk_size(&size_line)?;

        if size == 0 {
            let mut trailer = size_line;
            // Trailer lines run through a terminating blank line.
            loop {
                let line = read_metadata_line(reader, timeout).await?;
                let blank = line == b"\r\n";
                trailer.extend_from_slice(&line);
                if blank {
                    break;
                }
            }
            let total: usize = extents.iter().map(|e| e.size).sum();
            tracing::trace!(chunks = extents.len(), bytes = total, "chunked body complete");
            return Ok(ChunkedBody { extents, trailer });
        }

        let mut data = vec![0u8; size];
        read_exact_timed(reader, &mut data, timeout).await?;

        let mut crlf = [0u8; 2];
        read_exact_timed(reader, &mut crlf, timeout).await?;
        if crlf != *b"\r\n" {
            return Err(ChunkError::InvalidChunkSize(
                "chunk data not terminated by CRLF".to_string(),
            ));
        }

        extents.push(ChunkExtent {
            size,
            size_line,
            data,
        });
    }
}

/// Reads one CRLF-terminated line, byte at a time, bounded by
/// [`CHUNK_LINE_LIMIT`]. Returns the line including its CRLF.
async fn read_metadata_line<R>(reader: &mut R, timeout: Duration) -> Result<Vec<u8>, ChunkError>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if line.len() >= CHUNK_LINE_LIMIT {
            return Err(ChunkError::BufferExceeded {
                limit: CHUNK_LINE_LIMIT,
            });
        }
        let read = time::timeout(timeout, reader.read(&mut byte))
            .await
            .map_err(|_| ChunkError::Timeout)??;
        if read == 0 {
            return Err(ChunkError::PeerClosed);
        }
        line.push(byte[0]);
        if line.len() >= 2 && line[line.len() - 2..] == *b"\r\n" {
            return Ok(line);
        }
    }
}

/// Decodes the hex size from a size line; `;` extension parameters are
/// discarded.
fn parse_chunk_size(line: &[u8]) -> Result<usize, ChunkError> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim_end_matches("\r\n");
    let size_text = text.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(size_text, 16)
        .map_err(|_| ChunkError::InvalidChunkSize(size_text.to_string()))
}

async fn read_exact_timed<R>(
    reader: &mut R,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<(), ChunkError>
where
    R: AsyncRead + Unpin,
{
    match time::timeout(timeout, reader.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ChunkError::PeerClosed),
        Ok(Err(e)) => Err(ChunkError::Io(e)),
        Err(_) => Err(ChunkError::Timeout),
    }
}
