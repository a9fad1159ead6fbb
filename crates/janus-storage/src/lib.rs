//! Janus Storage - persistence and audit layer.
//!
//! This crate provides everything the proxy persists or records:
//!
//! - Host block-list (SQLite)
//! - Response cache: freshness-token index (SQLite) + body files on disk,
//!   with a single-writer-per-key lock table
//! - Append-only per-client audit log
//!
//! # Example
//!
//! ```no_run
//! use janus_storage::Storage;
//!
//! let storage = Storage::open("/var/lib/janus").unwrap();
//! storage.block_address("tracker.example").unwrap();
//! assert!(storage.is_blocked("www.tracker.example:443").unwrap());
//! ```

pub mod audit;
pub mod error;
pub mod models;
mod pool;
pub mod repository;
mod schema;
mod storage;

pub use audit::AuditLog;
pub use error::{Result, StorageError};
pub use models::{BlockedHost, CacheEntry};
pub use pool::ConnectionPool;
pub use storage::{normalize_host, CacheWriter, Storage};
