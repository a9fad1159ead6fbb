//! Janus protocol core.
//!
//! Wire-level building blocks for the Janus forward proxy:
//!
//! - Incremental header framing with a hard size cap ([`frame`])
//! - A header model with conditional-request support ([`header`])
//! - A chunked transfer-encoding decoder ([`chunk`])
//! - A TLS ClientHello sniffer that extracts SNI hostnames without
//!   terminating TLS ([`sniff`])
//! - Canned error responses and the shared retry policy
//!
//! All readers here are byte-precise: they never consume past the structure
//! they frame, so the same stream continues cleanly into the next protocol
//! element (persistent connections, tunneled bytes).

pub mod chunk;
pub mod error;
pub mod frame;
pub mod header;
pub mod response;
pub mod retry;
pub mod sniff;

pub use chunk::{read_chunked_body, ChunkExtent, ChunkedBody, CHUNK_LINE_LIMIT};
pub use error::{ChunkError, FrameError};
pub use frame::{read_header, MAX_HEADER_SIZE};
pub use header::{FieldMap, RequestHeader, ResponseHead};
pub use response::{error_response, ProxyStatus, SERVER_NAME};
pub use retry::RetryPolicy;
pub use sniff::{sniff_client_hello, ClientHelloView, SniffedHello};
