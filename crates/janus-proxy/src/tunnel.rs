//! HTTPS tunnel handler.
//!
//! The tunnel never parses TLS beyond the first record: the target comes
//! either from an explicit `CONNECT host:port` or from the SNI hostname
//! sniffed out of the ClientHello, and after that bytes pump both ways
//! untouched. Blocked hosts are dropped before a single byte is relayed.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::lookup_host;
use tokio::time;
use tracing::{debug, warn};

use janus_core::{frame, sniff_client_hello, FrameError, RetryPolicy};
use janus_storage::{AuditLog, Storage};

use crate::conn::{ClientConnection, UpstreamConnection};
use crate::error::{ProxyError, Result};

const CONNECT_KEYWORD: &[u8] = b"CONNECT";
const TUNNEL_PORT: u16 = 443;

/// How a pump phase ended.
enum PumpEnd {
    /// The client closed or went quiet past the budget; the handler exits.
    Client,
    /// The origin closed; the client may open a new CONNECT or ClientHello
    /// on the same connection.
    Upstream,
}

/// Per-connection handler for sniffed-TLS/CONNECT traffic.
pub struct TunnelHandler {
    client: ClientConnection,
    upstream: Option<UpstreamConnection>,
    storage: Storage,
    audit: AuditLog,
    policy: RetryPolicy,
}

impl TunnelHandler {
    /// Creates a handler for one accepted connection.
    pub fn new(
        client: ClientConnection,
        storage: Storage,
        audit: AuditLog,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            upstream: None,
            storage,
            audit,
            policy,
        }
    }

    /// Runs the connection to completion; dropping the handler closes both
    /// sockets.
    pub async fn run(mut self) {
        let peer = self.client.peer();
        let result = self.serve().await;
        if let Err(e) = result {
            debug!(%peer, error = %e, "tunnel ended with error");
        }
        self.audit.log_verbose(&format!("closing HTTPS connection from {peer}"));
    }

    async fn serve(&mut self) -> Result<()> {
        let mut current_host: Option<String> = None;
        let mut current_port = TUNNEL_PORT;
        // After a CONNECT is answered, the next bytes are opaque TLS; skip
        // straight to pumping without re-parsing.
        let mut connect_pending = false;

        loop {
            let mut preamble = Vec::new();
            let mut host_changed = false;
            let mut answer_connect = false;

            if connect_pending {
                connect_pending = false;
            } else {
                let Some(probe) = self.read_probe().await? else {
                    return Ok(());
                };

                if probe == CONNECT_KEYWORD {
                    let Some(target) = self.read_connect_target(probe).await? else {
                        return Ok(());
                    };
                    let (host, port) = target;
                    if current_host.as_deref() != Some(host.as_str()) {
                        host_changed = true;
                    }
                    current_host = Some(host);
                    current_port = port;
                    answer_connect = true;
                    connect_pending = true;
                } else {
                    let sniffed =
                        sniff_client_hello(&mut self.client.reader, probe, self.policy.base)
                            .await?;
                    preamble = sniffed.buffered;
                    if let Some(host) = sniffed.hostname {
                        if current_host.as_deref() != Some(host.as_str()) {
                            host_changed = true;
                        }
                        current_host = Some(host);
                        current_port = TUNNEL_PORT;
                    }
                }
            }

            // Without a target from CONNECT or SNI there is nowhere to
            // relay; drop the connection.
            let Some(host) = current_host.clone() else {
                debug!(peer = %self.client.peer(), "no tunnel target, dropping");
                return Ok(());
            };

            let blocked = match self.storage.is_blocked(&host) {
                Ok(blocked) => blocked,
                Err(e) => {
                    warn!(error = %e, "block-list check failed");
                    false
                }
            };
            if blocked {
                self.audit.log_blocked(self.client.peer_ip(), &host);
                debug!(host = %host, "blocked tunnel target, dropping");
                return Ok(());
            }

            let Some(addr) = resolve(&host, current_port).await else {
                debug!(host = %host, "tunnel target did not resolve, dropping");
                return Ok(());
            };
            UpstreamConnection::ensure(&mut self.upstream, addr).await?;

            if host_changed {
                self.audit.log_tunnel(self.client.peer_ip(), &host);
            }

            if answer_connect {
                self.client
                    .writer
                    .write_all(b"HTTP/1.1 200 OK\r\n\r\n")
                    .await?;
                continue;
            }

            // Forward the sniffed preamble untouched, then go opaque.
            if !preamble.is_empty() {
                let up = self.upstream_mut()?;
                up.writer
                    .write_all(&preamble)
                    .await
                    .map_err(|_| ProxyError::UpstreamClosed)?;
            }

            match self.pump().await? {
                PumpEnd::Client => return Ok(()),
                PumpEnd::Upstream => {
                    self.upstream = None;
                }
            }
        }
    }

    /// Reads up to 7 bytes to test for the CONNECT keyword. Idle silence
    /// with no bytes waits indefinitely (the client may be holding the
    /// connection open); a partial probe that stalls past the budget is
    /// returned as-is and will read as "no SNI".
    async fn read_probe(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = Vec::with_capacity(CONNECT_KEYWORD.len());
        let mut scratch = [0u8; 8];
        let mut attempt = 0u32;
        while buf.len() < CONNECT_KEYWORD.len() {
            let want = CONNECT_KEYWORD.len() - buf.len();
            match time::timeout(
                self.policy.timeout(attempt),
                self.client.reader.read(&mut scratch[..want]),
            )
            .await
            {
                Ok(Ok(0)) => {
                    return Ok(if buf.is_empty() { None } else { Some(buf) });
                }
                Ok(Ok(n)) => buf.extend_from_slice(&scratch[..n]),
                Ok(Err(_)) => return Ok(None),
                Err(_) if buf.is_empty() => continue,
                Err(_) => {
                    attempt += 1;
                    if attempt >= self.policy.max_attempts {
                        return Ok(Some(buf));
                    }
                }
            }
        }
        Ok(Some(buf))
    }

    /// Finishes reading a CONNECT header and extracts `host:port` from its
    /// target. Returns `None` when the header never completes or the target
    /// is unusable; the connection is then dropped without a response.
    async fn read_connect_target(&mut self, probe: Vec<u8>) -> Result<Option<(String, u16)>> {
        let mut buf = probe;
        let mut attempt = 0u32;
        loop {
            match frame::read_header(&mut self.client.reader, &mut buf, self.policy.timeout(attempt))
                .await
            {
                Ok(()) => break,
                Err(FrameError::Timeout) => {
                    attempt += 1;
                    if attempt >= self.policy.max_attempts {
                        return Ok(None);
                    }
                }
                Err(FrameError::PeerClosed) | Err(FrameError::HeaderTooLarge { .. }) => {
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let text = String::from_utf8_lossy(&buf);
        // "CONNECT example.com:443 HTTP/1.1"
        let target = text
            .lines()
            .next()
            .and_then(|line| line.split(' ').nth(1))
            .unwrap_or("");
        if target.is_empty() {
            return Ok(None);
        }
        let (host, port) = match target.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().unwrap_or(TUNNEL_PORT)),
            None => (target, TUNNEL_PORT),
        };
        Ok(Some((host.to_string(), port)))
    }

    /// Pumps bytes both ways without parsing until either side closes or
    /// both stay quiet past the escalation budget.
    async fn pump(&mut self) -> Result<PumpEnd> {
        let policy = self.policy;
        let Some(up) = self.upstream.as_mut() else {
            return Err(ProxyError::Upstream("upstream not connected".to_string()));
        };
        let client_reader = &mut self.client.reader;
        let client_writer = &mut self.client.writer;
        let upstream_reader = &mut up.reader;
        let upstream_writer = &mut up.writer;

        let mut client_buf = [0u8; 8192];
        let mut upstream_buf = [0u8; 8192];
        let mut idle = 0u32;

        loop {
            let timeout = policy.timeout(idle);
            tokio::select! {
                read = time::timeout(timeout, client_reader.read(&mut client_buf)) => match read {
                    Ok(Ok(0)) => return Ok(PumpEnd::Client),
                    Ok(Ok(n)) => {
                        idle = 0;
                        if upstream_writer.write_all(&client_buf[..n]).await.is_err() {
                            return Ok(PumpEnd::Upstream);
                        }
                    }
                    Ok(Err(_)) => return Ok(PumpEnd::Client),
                    Err(_) => {
                        idle += 1;
                        if idle >= policy.max_attempts {
                            return Ok(PumpEnd::Client);
                        }
                    }
                },
                read = time::timeout(timeout, upstream_reader.read(&mut upstream_buf)) => match read {
                    Ok(Ok(0)) => return Ok(PumpEnd::Upstream),
                    Ok(Ok(n)) => {
                        idle = 0;
                        if client_writer.write_all(&upstream_buf[..n]).await.is_err() {
                            return Ok(PumpEnd::Client);
                        }
                    }
                    Ok(Err(_)) => return Ok(PumpEnd::Upstream),
                    Err(_) => {
                        idle += 1;
                        if idle >= policy.max_attempts {
                            return Ok(PumpEnd::Client);
                        }
                    }
                },
            }
        }
    }

    fn upstream_mut(&mut self) -> Result<&mut UpstreamConnection> {
        self.upstream
            .as_mut()
            .ok_or_else(|| ProxyError::Upstream("upstream not connected".to_string()))
    }
}

async fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    lookup_host((host, port)).await.ok()?.next()
}
