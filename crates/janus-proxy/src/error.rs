//! Error types for the proxy.

use janus_core::{ChunkError, FrameError};
use janus_storage::StorageError;
use thiserror::Error;

/// Proxy error type.
///
/// The variant decides what the client sees: framing errors become 4xx
/// responses, upstream errors become 502 or a silent drop, and everything
/// storage-related is recovered before it ever reaches a handler exit.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Client-side framing error.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Client-side chunked body error.
    #[error(transparent)]
    Chunk(#[from] ChunkError),

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The upstream closed or reset mid-exchange; dropped without response.
    #[error("upstream connection closed")]
    UpstreamClosed,

    /// The upstream never produced a response header within the retry budget.
    #[error("upstream response timed out")]
    UpstreamTimeout,

    /// The upstream sent something unusable.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// IO error on the client side.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
