//! Error types for the protocol core.

use thiserror::Error;

/// Errors raised while framing a request or response off the wire.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The CRLFCRLF terminator did not appear within the buffer limit.
    #[error("header exceeds {limit} bytes without a terminator")]
    HeaderTooLarge {
        /// The buffer limit that was reached.
        limit: usize,
    },

    /// The peer closed the stream before the terminator.
    #[error("peer closed the connection mid-header")]
    PeerClosed,

    /// No byte arrived within the read timeout.
    #[error("timed out waiting for header bytes")]
    Timeout,

    /// The start line did not contain a method, target, and version.
    #[error("malformed start line: {0:?}")]
    MalformedStartLine(String),

    /// The target is relative and no Host field exists.
    #[error("request target cannot be resolved to a URL")]
    UnresolvableTarget,

    /// IO error from the underlying stream.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while decoding a chunked transfer-encoded body.
#[derive(Debug, Error)]
pub enum ChunkError {
    /// A chunk size line was not valid hex, or the chunk framing broke.
    #[error("invalid chunk framing: {0}")]
    InvalidChunkSize(String),

    /// A size or trailer line exceeded the scratch buffer.
    #[error("chunk metadata line exceeds {limit} bytes")]
    BufferExceeded {
        /// The scratch buffer limit that was reached.
        limit: usize,
    },

    /// The peer closed the stream mid-body.
    #[error("peer closed the connection mid-chunk")]
    PeerClosed,

    /// No byte arrived within the read timeout.
    #[error("timed out reading chunked body")]
    Timeout,

    /// IO error from the underlying stream.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
