//! Proxy server: listeners, bounded worker pool, lifecycle.
//!
//! Two listeners run side by side: plaintext HTTP and the sniffed-TLS
//! tunnel. Each accepted connection takes a semaphore permit and runs its
//! handler in its own task; the permit returns when the task finishes, so
//! concurrency stays bounded without any queueing logic of its own.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tracing::{info, warn};

use janus_core::RetryPolicy;
use janus_storage::{AuditLog, Storage};

use crate::conn::ClientConnection;
use crate::error::Result;
use crate::http::HttpHandler;
use crate::tunnel::TunnelHandler;
use crate::{DEFAULT_HTTP_PORT, DEFAULT_TUNNEL_PORT};

/// Maximum concurrently served connections across both listeners.
pub const DEFAULT_MAX_CONNECTIONS: usize = 150;

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address for the plaintext HTTP listener.
    pub http_addr: SocketAddr,
    /// Address for the HTTPS tunnel listener.
    pub tunnel_addr: SocketAddr,
    /// Bound on concurrently served connections.
    pub max_connections: usize,
    /// Timeout escalation shared by every handler.
    pub retry: RetryPolicy,
}

impl ServerConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_HTTP_PORT)),
            tunnel_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_TUNNEL_PORT)),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the HTTP listener address.
    pub fn with_http_addr(mut self, addr: SocketAddr) -> Self {
        self.http_addr = addr;
        self
    }

    /// Sets the tunnel listener address.
    pub fn with_tunnel_addr(mut self, addr: SocketAddr) -> Self {
        self.tunnel_addr = addr;
        self
    }

    /// Sets the connection bound.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

enum ListenerKind {
    Http,
    Tunnel,
}

/// The Janus proxy server.
pub struct ProxyServer {
    config: ServerConfig,
    storage: Storage,
    audit: AuditLog,
}

impl ProxyServer {
    /// Creates a server with explicitly injected collaborators.
    pub fn new(config: ServerConfig, storage: Storage, audit: AuditLog) -> Self {
        Self {
            config,
            storage,
            audit,
        }
    }

    /// Starts the server and blocks until it is shut down.
    pub async fn run(self) -> Result<()> {
        let handle = self.start().await?;
        handle.wait().await;
        Ok(())
    }

    /// Starts the server in the background.
    ///
    /// Returns a handle carrying the actually bound addresses (useful with
    /// port 0) that can stop the server.
    pub async fn start(self) -> Result<ProxyHandle> {
        let http = TcpListener::bind(self.config.http_addr).await?;
        let tunnel = TcpListener::bind(self.config.tunnel_addr).await?;
        let http_addr = http.local_addr()?;
        let tunnel_addr = tunnel.local_addr()?;

        info!("HTTP proxy listening on {}", http_addr);
        info!("HTTPS tunnel listening on {}", tunnel_addr);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let limiter = Arc::new(Semaphore::new(self.config.max_connections));

        let storage = self.storage;
        let audit = self.audit;
        let policy = self.config.retry;

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = Self::accept_loop(http, ListenerKind::Http, storage.clone(), audit.clone(), policy, limiter.clone()) => {}
                _ = Self::accept_loop(tunnel, ListenerKind::Tunnel, storage, audit, policy, limiter) => {}
                _ = shutdown_rx.recv() => {
                    info!("proxy shutdown signal received");
                }
            }
        });

        Ok(ProxyHandle {
            shutdown_tx,
            http_addr,
            tunnel_addr,
            handle,
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        kind: ListenerKind,
        storage: Storage,
        audit: AuditLog,
        policy: RetryPolicy,
        limiter: Arc<Semaphore>,
    ) {
        let is_tunnel = matches!(kind, ListenerKind::Tunnel);
        loop {
            let permit = match limiter.clone().acquire_owned().await {
                Ok(permit) => permit,
                // The semaphore only closes on shutdown.
                Err(_) => return,
            };
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let client = ClientConnection::new(stream, peer);
                    let storage = storage.clone();
                    let audit = audit.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if is_tunnel {
                            TunnelHandler::new(client, storage, audit, policy).run().await;
                        } else {
                            HttpHandler::new(client, storage, audit, policy).run().await;
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    drop(permit);
                }
            }
        }
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    http_addr: SocketAddr,
    tunnel_addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// The bound HTTP listener address.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// The bound tunnel listener address.
    pub fn tunnel_addr(&self) -> SocketAddr {
        self.tunnel_addr
    }

    /// Signals the server to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the server to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the server and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
