//! High-level storage interface: block-list, cache index, cache files.
//!
//! One `Storage` value is constructed at startup and cloned (cheap handles)
//! into every connection handler. Index and block-list writes serialize
//! through the connection pool; cache body files are guarded by a
//! single-writer-per-key lock table.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use directories::ProjectDirs;
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Result, StorageError};
use crate::models::BlockedHost;
use crate::pool::ConnectionPool;
use crate::repository::{BlocklistRepo, CacheIndexRepo};

/// High-level storage interface for Janus.
#[derive(Clone)]
pub struct Storage {
    pool: ConnectionPool,
    cache_dir: PathBuf,
    cache_locks: Arc<Mutex<HashSet<String>>>,
}

impl Storage {
    /// Open (or create) storage under the given data directory.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        let cache_dir = data_dir.join("cache");
        std::fs::create_dir_all(&cache_dir)?;

        let db_path = data_dir.join("janus.db");
        info!("Opening database at: {:?}", db_path);
        let pool = ConnectionPool::new(&db_path)?;

        Ok(Self {
            pool,
            cache_dir,
            cache_locks: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Open storage under the default app data directory.
    pub fn open_default() -> Result<Self> {
        Self::open(Self::default_data_dir()?)
    }

    /// The default data directory.
    pub fn default_data_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("org", "janus", "janus")
            .ok_or_else(|| StorageError::Config("Could not determine app data directory".into()))?;

        Ok(proj_dirs.data_dir().to_path_buf())
    }

    // === Block-list ===

    /// True if the host (or literal IP) is on the block-list.
    pub fn is_blocked(&self, host_or_ip: &str) -> Result<bool> {
        let normalized = normalize_host(host_or_ip);
        let conn = self.pool.get()?;
        BlocklistRepo::contains(&conn, &normalized)
    }

    /// Adds an address to the block-list.
    ///
    /// The hostname is normalized before storing; its address is resolved
    /// best-effort so literal-IP requests to the same origin match too.
    pub fn block_address(&self, address: &str) -> Result<BlockedHost> {
        let hostname = normalize_host(address);
        if hostname.is_empty() {
            return Err(StorageError::Config("empty host".into()));
        }
        let ip = resolve_ip(&hostname).unwrap_or_default();

        let entry = BlockedHost { hostname, ip };
        let conn = self.pool.get()?;
        BlocklistRepo::insert(&conn, &entry)?;
        info!(hostname = %entry.hostname, ip = %entry.ip, "host blocked");
        Ok(entry)
    }

    /// Removes hosts from the block-list. Returns the number removed.
    pub fn unblock_hosts<I, S>(&self, hosts: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let conn = self.pool.get()?;
        let mut removed = 0;
        for host in hosts {
            if BlocklistRepo::remove(&conn, &normalize_host(host.as_ref()))? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// All block-list entries.
    pub fn list_blocked(&self) -> Result<Vec<BlockedHost>> {
        let conn = self.pool.get()?;
        BlocklistRepo::get_all(&conn)
    }

    // === Response cache ===

    /// The cache key for an origin resource: percent-encoded `host+path`.
    pub fn cache_key(host: &str, path: &str) -> String {
        utf8_percent_encode(&format!("{host}{path}"), NON_ALPHANUMERIC).to_string()
    }

    /// Looks up a cached response. Returns the stored body file and the
    /// freshness token recorded when it was written.
    pub async fn cache_lookup(&self, key: &str) -> Result<Option<(File, String)>> {
        let token = {
            let conn = self.pool.get()?;
            CacheIndexRepo::get(&conn, key)?
        };
        let Some(token) = token else {
            return Ok(None);
        };

        match File::open(self.cache_file_path(key)).await {
            Ok(file) => Ok(Some((file, token))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Index says cached but the body is gone; drop the entry.
                warn!(key, "cache body missing, evicting index entry");
                let conn = self.pool.get()?;
                CacheIndexRepo::remove(&conn, key)?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Attempts to open a cache file for writing.
    ///
    /// Returns `None` when another writer already holds the key; the caller
    /// must then skip caching for this response. The returned writer holds
    /// the key until it is committed or discarded.
    pub async fn acquire_cache_writer(&self, key: &str) -> Result<Option<CacheWriter>> {
        if !self.cache_locks.lock().insert(key.to_string()) {
            debug!(key, "cache writer denied, another writer active");
            return Ok(None);
        }

        let path = self.cache_file_path(key);
        match File::create(&path).await {
            Ok(file) => Ok(Some(CacheWriter {
                key: key.to_string(),
                path,
                file,
                locks: Arc::clone(&self.cache_locks),
                finished: false,
            })),
            Err(e) => {
                self.cache_locks.lock().remove(key);
                Err(e.into())
            }
        }
    }

    /// Commits a completed cache write: flushes the body file and records
    /// the freshness token in the index. Releases the writer's key.
    pub async fn commit_cache(&self, mut writer: CacheWriter, token: &str) -> Result<()> {
        writer.file.flush().await?;
        {
            let conn = self.pool.get()?;
            CacheIndexRepo::upsert(&conn, &writer.key, token)?;
        }
        debug!(key = %writer.key, token, "cache entry committed");
        writer.finished = true;
        self.cache_locks.lock().remove(&writer.key);
        Ok(())
    }

    /// Discards a cache write: the partial file is deleted and the writer's
    /// key released. Used after a mid-stream write error.
    pub fn discard_cache(&self, writer: CacheWriter) {
        debug!(key = %writer.key, "cache entry discarded");
        drop(writer);
    }

    fn cache_file_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{key}.data"))
    }
}

/// An exclusive byte sink onto one cache file.
///
/// Dropping an uncommitted writer deletes the partial file and releases the
/// key, so an error path can never leave a stale lock or a half-written
/// entry behind.
pub struct CacheWriter {
    key: String,
    path: PathBuf,
    file: File,
    locks: Arc<Mutex<HashSet<String>>>,
    finished: bool,
}

impl CacheWriter {
    /// The cache key this writer holds.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Appends bytes to the cache file.
    pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.file.write_all(buf).await
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = std::fs::remove_file(&self.path);
            self.locks.lock().remove(&self.key);
        }
    }
}

/// Normalizes a host for block-list matching: port and `www.` stripped,
/// lowercase.
pub fn normalize_host(host: &str) -> String {
    let host = host.split(':').next().unwrap_or(host);
    let host = host.strip_prefix("www.").unwrap_or(host);
    host.to_ascii_lowercase()
}

/// Best-effort forward resolution of a hostname.
fn resolve_ip(host: &str) -> Option<String> {
    use std::net::ToSocketAddrs;
    (host, 0u16)
        .to_socket_addrs()
        .ok()?
        .next()
        .map(|addr| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn test_storage() -> (TempDir, Storage) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        (dir, storage)
    }

    #[test]
    fn normalize_strips_port_www_and_case() {
        assert_eq!(normalize_host("www.Example.com:443"), "example.com");
        assert_eq!(normalize_host("example.com"), "example.com");
        assert_eq!(normalize_host("EXAMPLE.COM"), "example.com");
    }

    #[test]
    fn cache_key_is_percent_encoded() {
        let key = Storage::cache_key("example.com", "/index.html");
        assert!(!key.contains('/'));
        assert!(key.starts_with("example"));
    }

    #[test]
    fn block_list_round_trips() {
        let (_dir, storage) = test_storage();

        storage.block_address("www.example.com").unwrap();
        assert!(storage.is_blocked("example.com").unwrap());
        assert!(storage.is_blocked("www.example.com:443").unwrap());
        assert!(!storage.is_blocked("other.example").unwrap());

        let listed = storage.list_blocked().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].hostname, "example.com");

        assert_eq!(storage.unblock_hosts(["example.com"]).unwrap(), 1);
        assert!(!storage.is_blocked("example.com").unwrap());
    }

    #[test]
    fn block_list_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let storage = Storage::open(dir.path()).unwrap();
            storage.block_address("example.com").unwrap();
        }
        let storage = Storage::open(dir.path()).unwrap();
        assert!(storage.is_blocked("example.com").unwrap());
    }

    #[tokio::test]
    async fn cache_write_then_lookup() {
        let (_dir, storage) = test_storage();
        let key = Storage::cache_key("example.com", "/index.html");

        assert!(storage.cache_lookup(&key).await.unwrap().is_none());

        let mut writer = storage.acquire_cache_writer(&key).await.unwrap().unwrap();
        writer.write_all(b"HTTP/1.1 200 OK\r\n\r\nhello").await.unwrap();
        storage
            .commit_cache(writer, "Mon, 01 Jan 2024 00:00:00 GMT")
            .await
            .unwrap();

        let (mut file, token) = storage.cache_lookup(&key).await.unwrap().unwrap();
        assert_eq!(token, "Mon, 01 Jan 2024 00:00:00 GMT");

        let mut stored = Vec::new();
        file.read_to_end(&mut stored).await.unwrap();
        assert_eq!(stored, b"HTTP/1.1 200 OK\r\n\r\nhello");
    }

    #[tokio::test]
    async fn second_writer_is_denied_until_release() {
        let (_dir, storage) = test_storage();
        let key = Storage::cache_key("example.com", "/");

        let writer = storage.acquire_cache_writer(&key).await.unwrap().unwrap();
        assert!(storage.acquire_cache_writer(&key).await.unwrap().is_none());

        storage.commit_cache(writer, "t").await.unwrap();
        assert!(storage.acquire_cache_writer(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn discarded_writer_leaves_no_trace() {
        let (_dir, storage) = test_storage();
        let key = Storage::cache_key("example.com", "/partial");

        let mut writer = storage.acquire_cache_writer(&key).await.unwrap().unwrap();
        writer.write_all(b"half a respo").await.unwrap();
        storage.discard_cache(writer);

        assert!(storage.cache_lookup(&key).await.unwrap().is_none());
        // The key is free again.
        assert!(storage.acquire_cache_writer(&key).await.unwrap().is_some());
    }
}
