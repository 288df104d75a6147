/// Socket capability seam
///
/// All outbound dialing funnels through [`SocketOps`] so that admission and
/// blacklist behavior can be unit-tested against scripted connect outcomes.
/// Production code builds one [`SystemSocketOps`] at startup and threads it
/// through router and route construction; there is no hidden global.
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::debug;

/// Result of dialing a single resolved candidate address.
#[derive(Debug)]
pub enum ConnectOutcome {
    /// Connected; TCP_NODELAY is already set on the stream.
    Connected(TcpStream),
    /// The peer actively refused the connection.
    Refused,
    /// The connect did not complete within the allotted time.
    TimedOut,
    /// Any other socket-level failure.
    Failed(io::Error),
}

/// Narrow interface over the platform socket calls the router needs for
/// outbound connections. Established streams are plain tokio streams; the
/// relay is generic over `AsyncRead`/`AsyncWrite` and does not go through
/// this trait.
#[async_trait]
pub trait SocketOps: Send + Sync {
    /// Resolve `host:port` to all candidate socket addresses, both families.
    async fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;

    /// Dial one candidate with a deadline.
    async fn connect(&self, addr: SocketAddr, limit: Duration) -> ConnectOutcome;
}

/// The real thing: `getaddrinfo` via tokio's resolver, non-blocking connect
/// with writability wait and `SO_ERROR` check via `TcpSocket::connect`.
#[derive(Debug, Default)]
pub struct SystemSocketOps;

#[async_trait]
impl SocketOps for SystemSocketOps {
    async fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(lookup_host((host, port)).await?.collect())
    }

    async fn connect(&self, addr: SocketAddr, limit: Duration) -> ConnectOutcome {
        let socket = match if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        } {
            Ok(socket) => socket,
            Err(e) => return ConnectOutcome::Failed(e),
        };

        match timeout(limit, socket.connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed setting TCP_NODELAY on backend socket: {}", e);
                    return ConnectOutcome::Failed(e);
                }
                ConnectOutcome::Connected(stream)
            }
            Ok(Err(e)) => match e.kind() {
                io::ErrorKind::ConnectionRefused => ConnectOutcome::Refused,
                io::ErrorKind::TimedOut => ConnectOutcome::TimedOut,
                _ => ConnectOutcome::Failed(e),
            },
            Err(_) => ConnectOutcome::TimedOut,
        }
    }
}
