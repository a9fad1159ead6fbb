//! Plain-HTTP connection handler.
//!
//! Runs the per-connection request/response loop: frame the next request
//! header, resolve and block-check the target, open or reuse the upstream
//! connection, dispatch by method, relay the response (through the cache
//! for GET/HEAD), then probe for the next request of a persistent
//! connection. Every exit path ends at the same place: the handler drops,
//! closing both sockets exactly once.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::lookup_host;
use tokio::time;
use tracing::{debug, warn};

use janus_core::{
    error_response, frame, read_chunked_body, FrameError, ProxyStatus, RequestHeader,
    ResponseHead, RetryPolicy,
};
use janus_storage::{AuditLog, Storage};

use crate::cache::{CacheCoordinator, CacheSink};
use crate::conn::{ClientConnection, UpstreamConnection};
use crate::error::{ProxyError, Result};

const COPY_BUF_SIZE: usize = 8192;

/// Per-connection handler for plaintext HTTP.
pub struct HttpHandler {
    client: ClientConnection,
    upstream: Option<UpstreamConnection>,
    storage: Storage,
    audit: AuditLog,
    cache: CacheCoordinator,
    policy: RetryPolicy,
}

impl HttpHandler {
    /// Creates a handler for one accepted connection.
    pub fn new(
        client: ClientConnection,
        storage: Storage,
        audit: AuditLog,
        policy: RetryPolicy,
    ) -> Self {
        let cache = CacheCoordinator::new(storage.clone());
        Self {
            client,
            upstream: None,
            storage,
            audit,
            cache,
            policy,
        }
    }

    /// Runs the connection to completion. Consumes the handler; dropping it
    /// closes the client and any upstream socket.
    pub async fn run(mut self) {
        let peer = self.client.peer();
        if let Err(e) = self.serve().await {
            debug!(%peer, error = %e, "connection ended with error");
        }
        debug!(%peer, "closing HTTP connection");
    }

    async fn serve(&mut self) -> Result<()> {
        while self.client.persistent {
            let Some(raw) = self.await_header().await? else {
                break;
            };

            // Resolve
            let text = String::from_utf8_lossy(&raw).to_string();
            let req = match RequestHeader::parse(&text) {
                Ok(req) => req,
                Err(e) => {
                    debug!(error = %e, "unparseable request header");
                    self.respond_error(ProxyStatus::BadRequest).await;
                    break;
                }
            };
            let url = match req.resolve_url() {
                Ok(url) => url,
                Err(_) => {
                    self.respond_error(ProxyStatus::BadRequest).await;
                    break;
                }
            };
            let Some(host) = url.host_str().map(str::to_string) else {
                self.respond_error(ProxyStatus::BadRequest).await;
                break;
            };
            let port = url.port().unwrap_or(80);
            let path = url.path().to_string();

            // Block check
            let blocked = match self.storage.is_blocked(&host) {
                Ok(blocked) => blocked,
                Err(e) => {
                    warn!(error = %e, "block-list check failed");
                    false
                }
            };
            if blocked {
                self.audit.log_blocked(self.client.peer_ip(), &host);
                self.respond_error(ProxyStatus::Unauthorized).await;
                break;
            }

            // Connect
            let resolved = lookup_host((host.as_str(), port))
                .await
                .ok()
                .and_then(|mut addrs| addrs.next());
            let Some(addr) = resolved else {
                self.respond_error(ProxyStatus::BadRequest).await;
                break;
            };
            if let Err(e) = UpstreamConnection::ensure(&mut self.upstream, addr).await {
                warn!(%addr, error = %e, "upstream connect failed");
                self.respond_error(ProxyStatus::BadGateway).await;
                break;
            }

            // Dispatch
            let method = req.method().to_ascii_uppercase();
            let outcome = match method.as_str() {
                "GET" | "HEAD" => {
                    self.handle_cacheable(&req, &raw, &host, &path, method == "HEAD")
                        .await
                }
                "POST" => self.handle_post(&req, &raw).await,
                "OPTIONS" => self.handle_uncached(&raw).await,
                _ => {
                    self.respond_error(ProxyStatus::MethodNotAllowed).await;
                    break;
                }
            };

            match outcome {
                Ok(status) => {
                    self.audit
                        .log_request(self.client.peer_ip(), &host, &path, &method, status);
                }
                // Client went quiet past the budget: drop without response.
                Err(ProxyError::Frame(FrameError::Timeout)) => break,
                Err(ProxyError::Frame(e)) => {
                    debug!(error = %e, "bad request body framing");
                    self.respond_error(ProxyStatus::BadRequest).await;
                    break;
                }
                Err(ProxyError::Chunk(e)) => {
                    debug!(error = %e, "bad chunked request body");
                    self.respond_error(ProxyStatus::BadRequest).await;
                    break;
                }
                // Ambiguous peer-closes are dropped without a response.
                Err(ProxyError::UpstreamClosed) | Err(ProxyError::Io(_)) => break,
                Err(ProxyError::UpstreamTimeout) => {
                    self.respond_error(ProxyStatus::BadGateway).await;
                    break;
                }
                Err(ProxyError::Upstream(msg)) => {
                    warn!(host = %host, "upstream failure: {msg}");
                    self.respond_error(ProxyStatus::BadGateway).await;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "internal failure");
                    self.respond_error(ProxyStatus::InternalError).await;
                    break;
                }
            }

            // Relay done; probe whether another request is coming.
            if self.client.persistent {
                self.keep_alive_probe().await;
            }
        }
        Ok(())
    }

    /// Reads the next request header.
    ///
    /// An idle timeout with no bytes buffered is a keep-alive wait and loops;
    /// a timeout mid-header escalates through the retry schedule before the
    /// connection is dropped. Returns `None` when the connection should end
    /// without a response.
    async fn await_header(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = Vec::new();
        if let Some(byte) = self.client.carry.take() {
            buf.push(byte);
        }

        let mut attempt = 0u32;
        loop {
            let timeout = self.policy.timeout(attempt);
            match frame::read_header(&mut self.client.reader, &mut buf, timeout).await {
                Ok(()) => return Ok(Some(buf)),
                Err(FrameError::Timeout) if buf.is_empty() => continue,
                Err(FrameError::Timeout) => {
                    attempt += 1;
                    if attempt >= self.policy.max_attempts {
                        return Ok(None);
                    }
                }
                Err(FrameError::PeerClosed) => return Ok(None),
                Err(FrameError::HeaderTooLarge { .. }) => {
                    self.respond_error(ProxyStatus::ContentTooLarge).await;
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// GET/HEAD: revalidate against the cache, serve a 304 from the stored
    /// body, or relay (and possibly cache) the fresh response.
    async fn handle_cacheable(
        &mut self,
        req: &RequestHeader,
        raw: &[u8],
        host: &str,
        path: &str,
        head_request: bool,
    ) -> Result<Option<u16>> {
        let key = Storage::cache_key(host, path);
        let plan = self.cache.plan_request(req, &key, raw).await;

        {
            let up = self.upstream_mut()?;
            up.writer
                .write_all(&plan.request)
                .await
                .map_err(|_| ProxyError::UpstreamClosed)?;
        }

        if let Some(mut stored) = plan.stored {
            let (head_raw, head) = self.read_upstream_head().await?;
            if head.status() == Some(304) {
                // The stored response (header and body) goes out verbatim;
                // no upstream body follows a 304.
                debug!(key = %key, "cache still fresh, serving stored response");
                tokio::io::copy(&mut stored, &mut self.client.writer).await?;
                return Ok(Some(304));
            }
            debug!(key = %key, "cache is stale, relaying fresh response");
            return self
                .relay_parsed_response(head_raw, head, Some(&key), head_request)
                .await;
        }

        self.relay_response(Some(&key), head_request).await
    }

    /// POST: copy the request body upstream, then relay without caching.
    async fn handle_post(&mut self, req: &RequestHeader, raw: &[u8]) -> Result<Option<u16>> {
        {
            let up = self.upstream_mut()?;
            up.writer
                .write_all(raw)
                .await
                .map_err(|_| ProxyError::UpstreamClosed)?;
        }

        let content_length = req
            .fields()
            .get("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        let chunked = req
            .fields()
            .get("Transfer-Encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);

        if let Some(length) = content_length {
            self.copy_request_body(length).await?;
        } else if chunked {
            let timeout = self.patient_timeout();
            let body = read_chunked_body(&mut self.client.reader, timeout).await?;
            let up = self.upstream_mut()?;
            up.writer
                .write_all(&body.wire())
                .await
                .map_err(|_| ProxyError::UpstreamClosed)?;
        }

        self.relay_response(None, false).await
    }

    /// OPTIONS: relay as-is, no body copy, no caching.
    async fn handle_uncached(&mut self, raw: &[u8]) -> Result<Option<u16>> {
        {
            let up = self.upstream_mut()?;
            up.writer
                .write_all(raw)
                .await
                .map_err(|_| ProxyError::UpstreamClosed)?;
        }
        self.relay_response(None, false).await
    }

    /// Reads the upstream response header, escalating the timeout through
    /// the retry schedule for a slow origin.
    async fn read_upstream_head(&mut self) -> Result<(Vec<u8>, ResponseHead)> {
        let policy = self.policy;
        let up = self.upstream_mut()?;
        let mut buf = Vec::new();
        let mut attempt = 0u32;
        loop {
            match frame::read_header(&mut up.reader, &mut buf, policy.timeout(attempt)).await {
                Ok(()) => break,
                Err(FrameError::Timeout) => {
                    attempt += 1;
                    if attempt >= policy.max_attempts {
                        return Err(ProxyError::UpstreamTimeout);
                    }
                }
                Err(FrameError::HeaderTooLarge { .. }) => {
                    return Err(ProxyError::Upstream(
                        "header limit exceeded by origin".to_string(),
                    ));
                }
                Err(FrameError::PeerClosed) | Err(FrameError::Io(_)) => {
                    return Err(ProxyError::UpstreamClosed);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let text = String::from_utf8_lossy(&buf).to_string();
        let head = ResponseHead::parse(&text);
        Ok((buf, head))
    }

    async fn relay_response(
        &mut self,
        cache_key: Option<&str>,
        head_request: bool,
    ) -> Result<Option<u16>> {
        let (head_raw, head) = self.read_upstream_head().await?;
        self.relay_parsed_response(head_raw, head, cache_key, head_request)
            .await
    }

    /// Forwards an already-read response header and its body to the client,
    /// teeing into the cache when a sink opens for the key.
    async fn relay_parsed_response(
        &mut self,
        head_raw: Vec<u8>,
        head: ResponseHead,
        cache_key: Option<&str>,
        head_request: bool,
    ) -> Result<Option<u16>> {
        self.client.writer.write_all(&head_raw).await?;

        let status = head.status();
        let mut sink: Option<CacheSink> = match cache_key {
            Some(key) if status != Some(304) => self.cache.open_sink(key, &head).await,
            _ => None,
        };
        if let Some(sink) = sink.as_mut() {
            sink.write(&head_raw).await;
        }

        let mut upstream_alive = true;
        if head_request || matches!(status, Some(204) | Some(304)) {
            // No body follows.
        } else if let Some(length) = head.content_length() {
            self.copy_body_to_client(length, sink.as_mut()).await?;
        } else if head.is_chunked() {
            let timeout = self.patient_timeout();
            let up = self.upstream_mut()?;
            let body = read_chunked_body(&mut up.reader, timeout)
                .await
                .map_err(|e| ProxyError::Upstream(format!("chunked response: {e}")))?;
            let wire = body.wire();
            self.client.writer.write_all(&wire).await?;
            if let Some(sink) = sink.as_mut() {
                sink.write(&wire).await;
            }
        } else {
            // No declared framing: stream until the origin closes or goes
            // quiet past the retry budget.
            upstream_alive = self.copy_until_quiet(sink.as_mut()).await?;
        }

        if let Some(sink) = sink.take() {
            sink.commit().await;
        }
        if !upstream_alive {
            self.upstream = None;
        }
        Ok(status)
    }

    /// Copies exactly `remaining` body bytes upstream → client.
    async fn copy_body_to_client(
        &mut self,
        mut remaining: u64,
        mut sink: Option<&mut CacheSink>,
    ) -> Result<()> {
        let policy = self.policy;
        let Some(up) = self.upstream.as_mut() else {
            return Err(not_connected());
        };
        let mut buf = [0u8; COPY_BUF_SIZE];
        let mut attempt = 0u32;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let read = match time::timeout(policy.timeout(attempt), up.reader.read(&mut buf[..want]))
                .await
            {
                Ok(Ok(0)) => return Err(ProxyError::UpstreamClosed),
                Ok(Ok(n)) => {
                    attempt = 0;
                    n
                }
                Ok(Err(_)) => return Err(ProxyError::UpstreamClosed),
                Err(_) => {
                    attempt += 1;
                    if attempt >= policy.max_attempts {
                        return Err(ProxyError::UpstreamClosed);
                    }
                    continue;
                }
            };
            self.client.writer.write_all(&buf[..read]).await?;
            if let Some(sink) = sink.as_deref_mut() {
                sink.write(&buf[..read]).await;
            }
            remaining -= read as u64;
        }
        Ok(())
    }

    /// Streams an unframed body until the origin closes or stays quiet past
    /// the budget. Returns whether the upstream connection is still usable.
    async fn copy_until_quiet(&mut self, mut sink: Option<&mut CacheSink>) -> Result<bool> {
        let policy = self.policy;
        let Some(up) = self.upstream.as_mut() else {
            return Err(not_connected());
        };
        let mut buf = [0u8; COPY_BUF_SIZE];
        let mut attempt = 0u32;
        loop {
            match time::timeout(policy.timeout(attempt), up.reader.read(&mut buf)).await {
                Ok(Ok(0)) => return Ok(false),
                Ok(Ok(n)) => {
                    attempt = 0;
                    self.client.writer.write_all(&buf[..n]).await?;
                    if let Some(sink) = sink.as_deref_mut() {
                        sink.write(&buf[..n]).await;
                    }
                }
                Ok(Err(_)) => return Ok(false),
                Err(_) => {
                    attempt += 1;
                    if attempt >= policy.max_attempts {
                        // Quiet origin: presume the body is complete.
                        return Ok(true);
                    }
                }
            }
        }
    }

    /// Copies exactly `remaining` request body bytes client → upstream.
    async fn copy_request_body(&mut self, mut remaining: u64) -> Result<()> {
        let policy = self.policy;
        let Some(up) = self.upstream.as_mut() else {
            return Err(not_connected());
        };
        let mut buf = [0u8; COPY_BUF_SIZE];
        let mut attempt = 0u32;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let read = match time::timeout(
                policy.timeout(attempt),
                self.client.reader.read(&mut buf[..want]),
            )
            .await
            {
                Ok(Ok(0)) => return Err(FrameError::PeerClosed.into()),
                Ok(Ok(n)) => {
                    attempt = 0;
                    n
                }
                Ok(Err(e)) => return Err(ProxyError::Io(e)),
                Err(_) => {
                    attempt += 1;
                    if attempt >= policy.max_attempts {
                        return Err(FrameError::Timeout.into());
                    }
                    continue;
                }
            };
            up.writer
                .write_all(&buf[..read])
                .await
                .map_err(|_| ProxyError::UpstreamClosed)?;
            remaining -= read as u64;
        }
        Ok(())
    }

    /// Probes one byte from the client under the escalating schedule to
    /// decide whether another request is coming. A byte becomes the next
    /// header's carry-over; EOF or exhausted silence ends persistence.
    async fn keep_alive_probe(&mut self) {
        let mut byte = [0u8; 1];
        for timeout in self.policy.schedule() {
            match time::timeout(timeout, self.client.reader.read(&mut byte)).await {
                Ok(Ok(0)) => {
                    debug!(peer = %self.client.peer(), "client closed connection");
                    self.client.persistent = false;
                    return;
                }
                Ok(Ok(_)) => {
                    self.client.carry = Some(byte[0]);
                    return;
                }
                Ok(Err(_)) => {
                    self.client.persistent = false;
                    return;
                }
                Err(_) => continue,
            }
        }
        self.client.persistent = false;
    }

    /// Sends a canned error response and ends persistence.
    async fn respond_error(&mut self, status: ProxyStatus) {
        let bytes = error_response(status);
        if let Err(e) = self.client.writer.write_all(&bytes).await {
            debug!(error = %e, "error response not delivered");
        }
        self.client.persistent = false;
    }

    fn upstream_mut(&mut self) -> Result<&mut UpstreamConnection> {
        self.upstream.as_mut().ok_or_else(not_connected)
    }

    fn patient_timeout(&self) -> Duration {
        self.policy.timeout(self.policy.max_attempts.saturating_sub(1))
    }
}

fn not_connected() -> ProxyError {
    ProxyError::Upstream("upstream not connected".to_string())
}
