//! Cache coordination for GET/HEAD exchanges.
//!
//! Decides when a request should carry a revalidation validator, when a 304
//! can be answered from the stored body, and when a response streams into
//! the cache alongside the client. Caching is best-effort throughout: a
//! denied writer lock or a failed write downgrades the exchange to a plain
//! relay and never reaches the client.

use janus_core::{RequestHeader, ResponseHead};
use janus_storage::{CacheWriter, Storage};
use tokio::fs::File;
use tracing::{debug, warn};

/// Coordinates the response cache for one connection handler.
pub struct CacheCoordinator {
    storage: Storage,
}

/// The outgoing request plus the stored response when revalidating.
pub struct CachePlan {
    /// Bytes to send upstream: the raw request as received, or a rebuilt one
    /// carrying `If-Modified-Since`.
    pub request: Vec<u8>,
    /// The stored body file, present only when revalidating. A 304 from the
    /// origin streams this to the client instead of an upstream body.
    pub stored: Option<File>,
}

impl CacheCoordinator {
    /// Creates a coordinator over the shared storage handle.
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Plans the upstream request for a GET/HEAD exchange.
    ///
    /// When a prior response exists for the key and the client sent no
    /// validator of its own, the request is rebuilt with
    /// `If-Modified-Since: <stored token>`. Otherwise the raw bytes pass
    /// through untouched.
    pub async fn plan_request(&self, req: &RequestHeader, key: &str, raw: &[u8]) -> CachePlan {
        let plain = || CachePlan {
            request: raw.to_vec(),
            stored: None,
        };

        if req.fields().contains("If-Modified-Since") {
            return plain();
        }

        match self.storage.cache_lookup(key).await {
            Ok(Some((stored, token))) => {
                debug!(key, token = %token, "revalidating cached response");
                CachePlan {
                    request: req
                        .with_field("If-Modified-Since", &token)
                        .serialize()
                        .into_bytes(),
                    stored: Some(stored),
                }
            }
            Ok(None) => plain(),
            Err(e) => {
                warn!(key, "cache lookup failed, relaying plain: {e}");
                plain()
            }
        }
    }

    /// Opens a write-through sink for a response, if it is cacheable.
    ///
    /// A response is cacheable when it carries `Last-Modified` (the
    /// freshness token) and no other writer holds the key. Returns `None`
    /// otherwise; the caller relays without caching.
    pub async fn open_sink(&self, key: &str, head: &ResponseHead) -> Option<CacheSink> {
        let token = head.fields().get("Last-Modified")?.to_string();
        match self.storage.acquire_cache_writer(key).await {
            Ok(Some(writer)) => Some(CacheSink {
                writer: Some(writer),
                token,
                storage: self.storage.clone(),
            }),
            Ok(None) => None,
            Err(e) => {
                warn!(key, "cache writer unavailable: {e}");
                None
            }
        }
    }
}

/// Write-through byte sink onto one cache file.
///
/// Mirrors every relayed byte into the cache. The first write error disables
/// the sink (the partial file is discarded) while the client relay carries
/// on untouched.
pub struct CacheSink {
    writer: Option<CacheWriter>,
    token: String,
    storage: Storage,
}

impl CacheSink {
    /// Mirrors relayed bytes into the cache file.
    pub async fn write(&mut self, bytes: &[u8]) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.write_all(bytes).await {
                warn!("cache write failed, disabling for this response: {e}");
                // Dropping the writer discards the partial file and
                // releases the key.
                self.writer = None;
            }
        }
    }

    /// True while the sink still writes through.
    pub fn active(&self) -> bool {
        self.writer.is_some()
    }

    /// Commits the completed entry with its freshness token.
    pub async fn commit(mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = self.storage.commit_cache(writer, &self.token).await {
                warn!("cache commit failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn coordinator() -> (TempDir, CacheCoordinator, Storage) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        (dir, CacheCoordinator::new(storage.clone()), storage)
    }

    fn get_request() -> RequestHeader {
        RequestHeader::parse("GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .unwrap()
    }

    #[tokio::test]
    async fn cold_cache_relays_raw_request() {
        let (_dir, cache, _storage) = coordinator();
        let req = get_request();
        let raw = req.serialize().into_bytes();
        let key = Storage::cache_key("example.com", "/index.html");

        let plan = cache.plan_request(&req, &key, &raw).await;
        assert!(plan.stored.is_none());
        assert_eq!(plan.request, raw);
    }

    #[tokio::test]
    async fn warm_cache_injects_if_modified_since() {
        let (_dir, cache, storage) = coordinator();
        let key = Storage::cache_key("example.com", "/index.html");

        let mut writer = storage.acquire_cache_writer(&key).await.unwrap().unwrap();
        writer.write_all(b"HTTP/1.1 200 OK\r\n\r\nstored").await.unwrap();
        storage.commit_cache(writer, "T1").await.unwrap();

        let req = get_request();
        let raw = req.serialize().into_bytes();
        let plan = cache.plan_request(&req, &key, &raw).await;

        let rebuilt = String::from_utf8(plan.request).unwrap();
        assert!(rebuilt.contains("If-Modified-Since: T1\r\n"));
        assert!(plan.stored.is_some());

        let mut body = Vec::new();
        plan.stored.unwrap().read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"HTTP/1.1 200 OK\r\n\r\nstored");
    }

    #[tokio::test]
    async fn client_validator_wins_over_injection() {
        let (_dir, cache, storage) = coordinator();
        let key = Storage::cache_key("example.com", "/index.html");

        let mut writer = storage.acquire_cache_writer(&key).await.unwrap().unwrap();
        writer.write_all(b"x").await.unwrap();
        storage.commit_cache(writer, "T1").await.unwrap();

        let req = RequestHeader::parse(
            "GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\nIf-Modified-Since: T0\r\n\r\n",
        )
        .unwrap();
        let raw = req.serialize().into_bytes();

        let plan = cache.plan_request(&req, &key, &raw).await;
        assert!(plan.stored.is_none());
        assert_eq!(plan.request, raw);
    }

    #[tokio::test]
    async fn sink_requires_last_modified() {
        let (_dir, cache, _storage) = coordinator();
        let key = Storage::cache_key("example.com", "/");

        let head = ResponseHead::parse("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n");
        assert!(cache.open_sink(&key, &head).await.is_none());

        let head = ResponseHead::parse(
            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nLast-Modified: T1\r\n\r\n",
        );
        assert!(cache.open_sink(&key, &head).await.is_some());
    }

    #[tokio::test]
    async fn committed_sink_is_visible_in_storage() {
        let (_dir, cache, storage) = coordinator();
        let key = Storage::cache_key("example.com", "/page");
        let head = ResponseHead::parse("HTTP/1.1 200 OK\r\nLast-Modified: T9\r\n\r\n");

        let mut sink = cache.open_sink(&key, &head).await.unwrap();
        sink.write(b"HTTP/1.1 200 OK\r\n\r\n").await;
        sink.write(b"body").await;
        assert!(sink.active());
        sink.commit().await;

        let (mut file, token) = storage.cache_lookup(&key).await.unwrap().unwrap();
        assert_eq!(token, "T9");
        let mut stored = Vec::new();
        file.read_to_end(&mut stored).await.unwrap();
        assert_eq!(stored, b"HTTP/1.1 200 OK\r\n\r\nbody");
    }

    #[tokio::test]
    async fn concurrent_writer_denies_second_sink() {
        let (_dir, cache, _storage) = coordinator();
        let key = Storage::cache_key("example.com", "/race");
        let head = ResponseHead::parse("HTTP/1.1 200 OK\r\nLast-Modified: T1\r\n\r\n");

        let first = cache.open_sink(&key, &head).await.unwrap();
        assert!(cache.open_sink(&key, &head).await.is_none());

        first.commit().await;
        assert!(cache.open_sink(&key, &head).await.is_some());
    }
}
