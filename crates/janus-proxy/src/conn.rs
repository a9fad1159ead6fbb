//! Client and upstream connection types.

use std::net::{IpAddr, SocketAddr};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// The accepted client socket and its per-connection state.
///
/// Owns both halves of the socket; dropping the connection closes them,
/// which is the single teardown point for every handler exit path.
pub struct ClientConnection {
    /// Read half of the client socket.
    pub reader: OwnedReadHalf,
    /// Write half of the client socket.
    pub writer: OwnedWriteHalf,
    /// Whether the handler loop should wait for another request.
    pub persistent: bool,
    /// One byte consumed by the keep-alive probe, pre-seeded into the next
    /// header read.
    pub carry: Option<u8>,
    peer: SocketAddr,
}

impl ClientConnection {
    /// Wraps an accepted socket.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader,
            writer,
            persistent: true,
            carry: None,
            peer,
        }
    }

    /// The client's address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The client's IP, for audit records.
    pub fn peer_ip(&self) -> IpAddr {
        self.peer.ip()
    }
}

/// A connection to one resolved origin address.
///
/// Reused across requests on the same client connection while the resolved
/// address is unchanged; replaced (the old socket closed by drop) when the
/// client asks for a different host.
pub struct UpstreamConnection {
    /// Read half of the origin socket.
    pub reader: OwnedReadHalf,
    /// Write half of the origin socket.
    pub writer: OwnedWriteHalf,
    addr: SocketAddr,
}

impl UpstreamConnection {
    /// Connects to the origin.
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        tracing::debug!(%addr, "upstream connected");
        Ok(Self {
            reader,
            writer,
            addr,
        })
    }

    /// The resolved address this connection is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns a usable connection to `addr`, reusing the existing one when
    /// the address is unchanged and reconnecting otherwise.
    pub async fn ensure(
        slot: &mut Option<UpstreamConnection>,
        addr: SocketAddr,
    ) -> std::io::Result<&mut UpstreamConnection> {
        let reusable = slot.as_ref().map(|up| up.addr == addr).unwrap_or(false);
        if !reusable {
            // Assigning drops (and closes) any previous connection.
            *slot = Some(Self::connect(addr).await?);
        }
        Ok(slot.as_mut().expect("upstream slot filled above"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn echo_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn ensure_reuses_same_address() {
        let (listener, addr) = echo_listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let mut slot = None;
        UpstreamConnection::ensure(&mut slot, addr).await.unwrap();
        let first = slot.as_ref().unwrap().reader.local_addr().unwrap();

        UpstreamConnection::ensure(&mut slot, addr).await.unwrap();
        let second = slot.as_ref().unwrap().reader.local_addr().unwrap();

        // Same local port: the socket was not replaced.
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn ensure_reconnects_on_address_change() {
        let (l1, addr1) = echo_listener().await;
        let (l2, addr2) = echo_listener().await;
        tokio::spawn(async move {
            loop {
                let _ = l1.accept().await;
            }
        });
        tokio::spawn(async move {
            loop {
                let _ = l2.accept().await;
            }
        });

        let mut slot = None;
        UpstreamConnection::ensure(&mut slot, addr1).await.unwrap();
        assert_eq!(slot.as_ref().unwrap().addr(), addr1);

        UpstreamConnection::ensure(&mut slot, addr2).await.unwrap();
        assert_eq!(slot.as_ref().unwrap().addr(), addr2);
    }

    #[tokio::test]
    async fn client_connection_round_trip() {
        let (listener, addr) = echo_listener().await;
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, peer) = listener.accept().await.unwrap();
        let mut remote = connect.await.unwrap();

        let mut client = ClientConnection::new(accepted, peer);
        assert_eq!(client.peer_ip(), peer.ip());
        assert!(client.persistent);

        remote.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        client.writer.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}
