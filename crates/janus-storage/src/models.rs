//! Storage data models.

use serde::{Deserialize, Serialize};

/// One entry of the host block-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedHost {
    /// Normalized hostname (`www.` and port stripped, lowercase).
    pub hostname: String,
    /// Resolved address at block time; empty when resolution failed.
    pub ip: String,
}

/// One entry of the cache index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Percent-encoded `host+path` cache key.
    pub key: String,
    /// The `Last-Modified` freshness token recorded at write time.
    pub last_modified: String,
}
