/// Outbound connect procedure and the per-connection relay
///
/// The connect procedure resolves a destination to its candidate addresses
/// and dials them within a single deadline, telling a refusal apart from a
/// timeout because the caller counts them differently. The relay pumps
/// bytes between the two sockets of one connection pair until either side
/// is done or the route is stopped.
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::address::RouteAddress;
use crate::net::{ConnectOutcome, SocketOps};
use crate::protocol::{CopyOutcome, Framer, ProtocolKind};

/// Result of dialing one destination, all candidates considered.
#[derive(Debug)]
pub enum ConnectResult {
    Connected(TcpStream),
    /// Every candidate failed with something other than a timeout.
    Refused,
    /// The last candidate failure was a timeout.
    TimedOut,
}

/// Dials destinations through the injected socket capability.
#[derive(Clone)]
pub struct Connector {
    ops: Arc<dyn SocketOps>,
}

impl Connector {
    pub fn new(ops: Arc<dyn SocketOps>) -> Self {
        Self { ops }
    }

    /// Connect to `addr` within `limit`, trying every resolved candidate.
    pub async fn connect(&self, addr: &RouteAddress, limit: Duration) -> ConnectResult {
        let deadline = Instant::now() + limit;

        let candidates = match self.ops.lookup(&addr.host, addr.port).await {
            Ok(candidates) => candidates,
            Err(e) => {
                debug!(
                    "Failed getting address information for '{}' ({})",
                    addr.host, e
                );
                return ConnectResult::Refused;
            }
        };

        let mut timeout_expired = false;
        for candidate in candidates {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                timeout_expired = true;
                break;
            }
            match self.ops.connect(candidate, remaining).await {
                ConnectOutcome::Connected(stream) => return ConnectResult::Connected(stream),
                ConnectOutcome::TimedOut => {
                    warn!("Timeout reached trying to connect to {}", addr);
                    timeout_expired = true;
                }
                ConnectOutcome::Refused => {
                    debug!("Connection refused by {}", candidate);
                    timeout_expired = false;
                }
                ConnectOutcome::Failed(e) => {
                    debug!("Failed connecting to {}: {}", candidate, e);
                    timeout_expired = false;
                }
            }
        }

        if timeout_expired {
            ConnectResult::TimedOut
        } else {
            ConnectResult::Refused
        }
    }
}

/// Per-pair relay parameters, copied out of the route settings.
#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    pub protocol: ProtocolKind,
    pub net_buffer_length: usize,
    pub client_connect_timeout: Duration,
}

/// What the relay moved before the pair ended.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub bytes_to_backend: u64,
    pub bytes_to_client: u64,
    pub client_frames: u64,
    pub backend_frames: u64,
    /// True when the pair ended without a relay error: an orderly close on
    /// either side, the extended close message, or a route stop.
    pub clean_close: bool,
    pub duration: Duration,
}

/// Both halves of the handshake phase. The client connect timeout applies
/// to client reads until each direction has relayed its first complete
/// frame (server greeting and client response).
#[derive(Default)]
struct HandshakeState {
    client: AtomicBool,
    backend: AtomicBool,
}

impl HandshakeState {
    fn done(&self) -> bool {
        self.client.load(Ordering::Relaxed) && self.backend.load(Ordering::Relaxed)
    }

    fn mark_client(&self) {
        self.client.store(true, Ordering::Relaxed);
    }

    fn mark_backend(&self) {
        self.backend.store(true, Ordering::Relaxed);
    }
}

/// How one relay direction ended.
#[derive(Debug)]
enum DirectionEnd {
    /// Orderly end-of-stream on the read side.
    Eof,
    /// The opposite direction finished first; this one stood down.
    PeerFinished,
    /// The route is stopping.
    Stopped,
    /// The client never completed the handshake in time.
    HandshakeTimeout,
    Error(io::Error),
}

impl DirectionEnd {
    fn is_error(&self) -> bool {
        matches!(self, DirectionEnd::Error(_) | DirectionEnd::HandshakeTimeout)
    }
}

/// One client socket paired with one backend socket. The client side is
/// generic so TCP and local-domain clients share the relay.
pub struct ConnectionPair<C> {
    client: C,
    backend: TcpStream,
    client_label: String,
    backend_label: String,
}

impl<C> ConnectionPair<C>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(client: C, backend: TcpStream, client_label: String, backend_label: String) -> Self {
        Self {
            client,
            backend,
            client_label,
            backend_label,
        }
    }

    /// Run both relay directions until either finishes or the route stops.
    /// The first direction to end signals the other, so the pair never
    /// outlives one broken or closed side. Both sockets are owned here and
    /// closed exactly once when this call returns.
    pub async fn run(self, cfg: RelayConfig, stop: watch::Receiver<bool>) -> RelayStats {
        let started_at = Instant::now();
        let (mut client_read, mut client_write) = tokio::io::split(self.client);
        let (mut backend_read, mut backend_write) = self.backend.into_split();

        let handshake = HandshakeState::default();
        let (done_tx, done_rx) = watch::channel(false);

        let up = relay_direction(
            &mut client_read,
            &mut backend_write,
            Direction::ClientToBackend,
            cfg,
            &handshake,
            &done_tx,
            done_rx.clone(),
            stop.clone(),
        );
        let down = relay_direction(
            &mut backend_read,
            &mut client_write,
            Direction::BackendToClient,
            cfg,
            &handshake,
            &done_tx,
            done_rx,
            stop,
        );

        let (up_out, down_out) = tokio::join!(up, down);

        let clean_close = up_out.graceful_close
            || down_out.graceful_close
            || (!up_out.end.is_error() && !down_out.end.is_error());
        if !clean_close {
            debug!(
                "Relay error on {} <-> {}: {:?} / {:?}",
                self.client_label, self.backend_label, up_out.end, down_out.end
            );
        }

        RelayStats {
            bytes_to_backend: up_out.bytes,
            bytes_to_client: down_out.bytes,
            client_frames: up_out.frames,
            backend_frames: down_out.frames,
            clean_close,
            duration: started_at.elapsed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ClientToBackend,
    BackendToClient,
}

struct DirectionOutcome {
    end: DirectionEnd,
    bytes: u64,
    frames: u64,
    graceful_close: bool,
}

#[allow(clippy::too_many_arguments)]
async fn relay_direction<R, W>(
    from: &mut R,
    to: &mut W,
    direction: Direction,
    cfg: RelayConfig,
    handshake: &HandshakeState,
    done_tx: &watch::Sender<bool>,
    mut done_rx: watch::Receiver<bool>,
    mut stop: watch::Receiver<bool>,
) -> DirectionOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut framer = Framer::new(cfg.protocol);
    let mut buf = vec![0u8; cfg.net_buffer_length];
    let mut bytes = 0u64;

    let end = loop {
        let done = handshake.done();
        let copy = framer.copy_packets(from, to, &mut buf, done);

        let result = tokio::select! {
            r = async {
                if direction == Direction::ClientToBackend && !done {
                    match timeout(cfg.client_connect_timeout, copy).await {
                        Ok(r) => r.map(Some),
                        Err(_) => Ok(None), // handshake deadline
                    }
                } else {
                    copy.await.map(Some)
                }
            } => r,
            _ = done_rx.changed() => break DirectionEnd::PeerFinished,
            _ = stop.changed() => break DirectionEnd::Stopped,
        };

        match result {
            Ok(Some(CopyOutcome::Relayed(n))) => {
                bytes += n as u64;
                if framer.frames_complete() > 0 {
                    match direction {
                        Direction::ClientToBackend => handshake.mark_client(),
                        Direction::BackendToClient => handshake.mark_backend(),
                    }
                }
            }
            Ok(Some(CopyOutcome::Eof)) => break DirectionEnd::Eof,
            Ok(None) => break DirectionEnd::HandshakeTimeout,
            Err(e) => break DirectionEnd::Error(e),
        }
    };

    // half-close our write side and wake the opposite direction
    let _ = to.shutdown().await;
    let _ = done_tx.send(true);

    DirectionOutcome {
        end,
        bytes,
        frames: framer.frames_complete(),
        graceful_close: framer.graceful_close(),
    }
}
