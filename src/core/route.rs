/// One configured route: listeners, admission, and the pool of active pairs
///
/// A route owns its listening sockets (TCP and/or local-domain), a bounded
/// pool of client<->backend pairs, and the per-client error accounting that
/// feeds the blacklist. The relay hot path takes no locks; the error map
/// mutex is touched only when connections are set up or torn down.
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use fnv::FnvHashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::core::address::RouteAddress;
use crate::core::connection::{ConnectResult, ConnectionPair, Connector, RelayConfig};
use crate::core::destination::DestinationSet;
use crate::core::{
    AccessMode, DEFAULT_CLIENT_CONNECT_TIMEOUT, DEFAULT_DESTINATION_CONNECT_TIMEOUT,
    DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_CONNECT_ERRORS, DEFAULT_NET_BUFFER_LENGTH,
};
use crate::error::{ConfigError, PorticoError, Result};
use crate::metadata::MetadataCache;
use crate::net::SocketOps;
use crate::protocol::{Framer, ProtocolKind, RejectReason};

/// Prefix used for the relay worker names of every route.
pub const THREAD_NAME_PREFIX: &str = "RtS";

/// Derive the short worker name for a route.
///
/// Route names follow the `routing:<section>` convention. The result is
/// `<prefix>:<suffix>` where the suffix is everything after `_default_`
/// when that marker is present, otherwise everything after `routing:`;
/// a name not starting with `routing` yields the literal `parse err`.
/// The result is clipped to 15 characters, the platform limit for thread
/// names.
pub fn make_thread_name(config_name: &str, prefix: &str) -> String {
    const CONFIG_PREFIX: &str = "routing";
    const DEFAULT_MARKER: &str = "_default_";

    let suffix = if !config_name.starts_with(CONFIG_PREFIX) {
        "parse err"
    } else if let Some(pos) = config_name.find(DEFAULT_MARKER) {
        &config_name[pos + DEFAULT_MARKER.len()..]
    } else {
        match config_name.find(':') {
            Some(pos) => &config_name[pos + 1..],
            None => "",
        }
    };

    let mut name = format!("{}:{}", prefix, suffix);
    name.truncate(15);
    name
}

/// Everything a route needs to know before it can start.
#[derive(Debug, Clone)]
pub struct RouteSettings {
    pub name: String,
    pub access_mode: AccessMode,
    pub protocol: ProtocolKind,
    pub bind_tcp: Option<RouteAddress>,
    pub bind_socket: Option<PathBuf>,
    pub max_connections: usize,
    pub connect_timeout: Duration,
    pub client_connect_timeout: Duration,
    pub max_connect_errors: u64,
    pub net_buffer_length: usize,
}

impl RouteSettings {
    pub fn new<S: Into<String>>(name: S, access_mode: AccessMode, protocol: ProtocolKind) -> Self {
        Self {
            name: name.into(),
            access_mode,
            protocol,
            bind_tcp: None,
            bind_socket: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: DEFAULT_DESTINATION_CONNECT_TIMEOUT,
            client_connect_timeout: DEFAULT_CLIENT_CONNECT_TIMEOUT,
            max_connect_errors: DEFAULT_MAX_CONNECT_ERRORS,
            net_buffer_length: DEFAULT_NET_BUFFER_LENGTH,
        }
    }
}

/// Observable per-route counters.
#[derive(Debug, Default)]
pub struct RouteStats {
    active: AtomicUsize,
    total_accepted: AtomicU64,
    total_rejected: AtomicU64,
    blocked_clients: AtomicU64,
}

impl RouteStats {
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn total_accepted(&self) -> u64 {
        self.total_accepted.load(Ordering::SeqCst)
    }

    pub fn total_rejected(&self) -> u64 {
        self.total_rejected.load(Ordering::SeqCst)
    }

    pub fn blocked_clients(&self) -> u64 {
        self.blocked_clients.load(Ordering::SeqCst)
    }
}

/// Holds one admitted connection's slot; released exactly once on drop.
struct ActiveGuard {
    stats: Arc<RouteStats>,
}

impl ActiveGuard {
    fn claim(stats: &Arc<RouteStats>, max: usize) -> Option<Self> {
        stats
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if current >= max {
                    None
                } else {
                    Some(current + 1)
                }
            })
            .ok()
            .map(|_| ActiveGuard {
                stats: Arc::clone(stats),
            })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Per-client connect-error accounting. A client is blocked exactly when
/// its counter has reached the threshold, so the map is the blacklist.
struct ClientErrors {
    counts: FnvHashMap<IpAddr, u64>,
    threshold: u64,
}

impl ClientErrors {
    fn new(threshold: u64) -> Self {
        Self {
            counts: FnvHashMap::default(),
            threshold,
        }
    }

    fn is_blocked(&self, ip: &IpAddr) -> bool {
        self.counts.get(ip).is_some_and(|c| *c >= self.threshold)
    }

    /// Returns true when this failure crossed the threshold.
    fn record_failure(&mut self, ip: IpAddr) -> bool {
        let count = self.counts.entry(ip).or_insert(0);
        *count += 1;
        *count == self.threshold
    }

    fn reset(&mut self, ip: &IpAddr) {
        if let Some(count) = self.counts.get_mut(ip) {
            *count = 0;
        }
    }

    fn blocked_count(&self) -> u64 {
        self.counts
            .values()
            .filter(|c| **c >= self.threshold)
            .count() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Configured,
    Started,
    Stopping,
    Stopped,
}

struct Lifecycle {
    state: RouteState,
    stop_tx: Option<watch::Sender<bool>>,
    acceptors: Vec<tokio::task::JoinHandle<()>>,
}

/// A configured listener plus its destination set and counters.
pub struct Route {
    settings: RouteSettings,
    destinations: Option<DestinationSet>,
    connector: Connector,
    stats: Arc<RouteStats>,
    errors: std::sync::Mutex<ClientErrors>,
    lifecycle: Mutex<Lifecycle>,
    // pair workers live outside the lifecycle lock so accept loops can spawn
    // while stop() is waiting on them
    pairs: Mutex<JoinSet<()>>,
    bound_tcp: OnceLock<SocketAddr>,
}

impl Route {
    pub fn new(settings: RouteSettings, ops: Arc<dyn SocketOps>) -> std::result::Result<Self, ConfigError> {
        if settings.name.is_empty() {
            return Err(ConfigError::invalid("Route name may not be empty"));
        }
        if settings.max_connections == 0 {
            return Err(ConfigError::invalid("max_connections must be greater than 0"));
        }
        if settings.net_buffer_length == 0 {
            return Err(ConfigError::invalid("net_buffer_length must be greater than 0"));
        }
        let threshold = settings.max_connect_errors;
        Ok(Self {
            connector: Connector::new(ops),
            stats: Arc::new(RouteStats::default()),
            errors: std::sync::Mutex::new(ClientErrors::new(threshold)),
            lifecycle: Mutex::new(Lifecycle {
                state: RouteState::Configured,
                stop_tx: None,
                acceptors: Vec::new(),
            }),
            pairs: Mutex::new(JoinSet::new()),
            bound_tcp: OnceLock::new(),
            destinations: None,
            settings,
        })
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn stats(&self) -> &RouteStats {
        &self.stats
    }

    pub fn settings(&self) -> &RouteSettings {
        &self.settings
    }

    /// The TCP address actually bound, available once started. Differs from
    /// the configured one when port 0 was requested.
    pub fn tcp_bound_addr(&self) -> Option<SocketAddr> {
        self.bound_tcp.get().copied()
    }

    /// Replace the destination set with a parsed CSV list.
    pub fn set_destinations_from_csv(&mut self, csv: &str) -> std::result::Result<(), ConfigError> {
        self.destinations = Some(DestinationSet::from_csv(
            csv,
            self.settings.protocol,
            self.settings.bind_tcp.as_ref(),
        )?);
        Ok(())
    }

    /// Replace the destination set with a metadata-cache URI.
    pub fn set_destinations_from_uri(&mut self, uri: &str) -> std::result::Result<(), ConfigError> {
        self.destinations = Some(DestinationSet::from_uri(uri)?);
        Ok(())
    }

    /// Name of the metadata cache this route needs, if any.
    pub fn metadata_cache_name(&self) -> Option<&str> {
        self.destinations.as_ref().and_then(|d| d.cache_name())
    }

    /// Attach the metadata cache backing a dynamic destination set.
    pub fn bind_metadata_cache(&self, cache: Arc<dyn MetadataCache>) -> bool {
        self.destinations
            .as_ref()
            .is_some_and(|d| d.bind_cache(cache))
    }

    pub async fn state(&self) -> RouteState {
        self.lifecycle.lock().await.state
    }

    /// Bind the configured listeners and spawn one accept loop per listener.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state != RouteState::Configured {
            return Err(PorticoError::AlreadyStarted {
                route: self.settings.name.clone(),
            });
        }
        if self.destinations.is_none() {
            return Err(PorticoError::NoDestinations {
                route: self.settings.name.clone(),
            });
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let worker_name = make_thread_name(&self.settings.name, THREAD_NAME_PREFIX);
        let mut acceptors = Vec::new();

        if let Some(bind) = &self.settings.bind_tcp {
            let listener = TcpListener::bind((bind.host.as_str(), bind.port))
                .await
                .map_err(|e| PorticoError::FatalSetup {
                    route: self.settings.name.clone(),
                    reason: format!("cannot bind TCP listener on {}: {}", bind, e),
                })?;
            let local = listener.local_addr().map_err(|e| PorticoError::FatalSetup {
                route: self.settings.name.clone(),
                reason: e.to_string(),
            })?;
            let _ = self.bound_tcp.set(local);
            info!("Route {} listening on {}", self.settings.name, local);

            let route = Arc::clone(self);
            let rx = stop_rx.clone();
            let span = info_span!("acceptor", name = %worker_name, listener = %local);
            acceptors.push(tokio::spawn(
                async move { route.accept_loop_tcp(listener, rx).await }.instrument(span),
            ));
        }

        if let Some(path) = &self.settings.bind_socket {
            // a stale socket file from a previous run would make bind fail
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path).map_err(|e| PorticoError::FatalSetup {
                route: self.settings.name.clone(),
                reason: format!("cannot bind local socket {}: {}", path.display(), e),
            })?;
            info!(
                "Route {} listening on socket {}",
                self.settings.name,
                path.display()
            );

            let route = Arc::clone(self);
            let rx = stop_rx.clone();
            let span = info_span!("acceptor", name = %worker_name, listener = %path.display());
            acceptors.push(tokio::spawn(
                async move { route.accept_loop_local(listener, rx).await }.instrument(span),
            ));
        }

        if acceptors.is_empty() {
            return Err(PorticoError::FatalSetup {
                route: self.settings.name.clone(),
                reason: "no listener address configured".to_string(),
            });
        }

        lifecycle.stop_tx = Some(stop_tx);
        lifecycle.acceptors = acceptors;
        lifecycle.state = RouteState::Started;
        Ok(())
    }

    /// Stop accepting, tear down active pairs, and wait for every task this
    /// route spawned. Idempotent; returns only when the route is quiescent.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state != RouteState::Started {
            return;
        }
        lifecycle.state = RouteState::Stopping;

        if let Some(stop_tx) = &lifecycle.stop_tx {
            let _ = stop_tx.send(true);
        }
        for acceptor in lifecycle.acceptors.drain(..) {
            let _ = acceptor.await;
        }
        {
            let mut pairs = self.pairs.lock().await;
            while pairs.join_next().await.is_some() {}
        }

        if let Some(path) = &self.settings.bind_socket {
            let _ = std::fs::remove_file(path);
        }
        lifecycle.stop_tx = None;
        lifecycle.state = RouteState::Stopped;
        info!("Route {} stopped", self.settings.name);
    }

    async fn accept_loop_tcp(self: Arc<Self>, listener: TcpListener, mut stop: watch::Receiver<bool>) {
        loop {
            let accepted = tokio::select! {
                _ = stop.changed() => break,
                r = listener.accept() => r,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let label = peer.to_string();
                    self.admit(stream, Some(peer.ip()), label, stop.clone()).await;
                }
                Err(e) => {
                    error!("Accept error on route {}: {}", self.settings.name, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        debug!("Accept loop for route {} exited", self.settings.name);
    }

    async fn accept_loop_local(
        self: Arc<Self>,
        listener: UnixListener,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = stop.changed() => break,
                r = listener.accept() => r,
            };
            match accepted {
                Ok((stream, _)) => {
                    // local-domain peers carry no IP; the blacklist does not apply
                    let label = format!(
                        "local:{}",
                        self.settings
                            .bind_socket
                            .as_deref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_default()
                    );
                    self.admit(stream, None, label, stop.clone()).await;
                }
                Err(e) => {
                    error!("Accept error on route {}: {}", self.settings.name, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        debug!("Accept loop for route {} exited", self.settings.name);
    }

    /// Admission control for one accepted client. Either a rejection frame
    /// is sent, or a slot is claimed and a pair worker spawned.
    async fn admit<C>(
        self: &Arc<Self>,
        client: C,
        peer_ip: Option<IpAddr>,
        label: String,
        stop: watch::Receiver<bool>,
    ) where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.stats.total_accepted.fetch_add(1, Ordering::SeqCst);

        if let Some(ip) = peer_ip {
            let blocked = self.errors.lock().unwrap().is_blocked(&ip);
            if blocked {
                debug!("Rejecting blocked client {} on route {}", ip, self.settings.name);
                self.reject(client, RejectReason::HostBlocked).await;
                return;
            }
        }

        let Some(guard) = ActiveGuard::claim(&self.stats, self.settings.max_connections) else {
            warn!(
                "Route {} refusing client {}: {} connections already active",
                self.settings.name, label, self.settings.max_connections
            );
            self.reject(client, RejectReason::TooManyConnections).await;
            return;
        };

        let route = Arc::clone(self);
        let span = info_span!("connection", peer = %label);
        let mut pairs = self.pairs.lock().await;
        // reap finished workers so the set does not grow with closed pairs
        while pairs.try_join_next().is_some() {}
        pairs.spawn(
            async move {
                route.pair_worker(client, peer_ip, label, guard, stop).await;
            }
            .instrument(span),
        );
    }

    async fn reject<C>(&self, mut client: C, reason: RejectReason)
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.stats.total_rejected.fetch_add(1, Ordering::SeqCst);
        let frame = Framer::rejection_frame(self.settings.protocol, reason);
        let _ = client.write_all(&frame).await;
        let _ = client.shutdown().await;
    }

    /// Dial a backend and run the relay for one admitted client.
    async fn pair_worker<C>(
        self: Arc<Self>,
        client: C,
        peer_ip: Option<IpAddr>,
        label: String,
        guard: ActiveGuard,
        stop: watch::Receiver<bool>,
    ) where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Some(destinations) = self.destinations.as_ref() else {
            self.reject(client, RejectReason::NoBackend).await;
            return;
        };

        let mode = self.settings.access_mode;
        let attempts = destinations.available(mode);
        let mut connected = None;
        for _ in 0..attempts {
            let Some(addr) = destinations.next(mode) else {
                break;
            };
            match self
                .connector
                .connect(&addr, self.settings.connect_timeout)
                .await
            {
                ConnectResult::Connected(stream) => {
                    connected = Some((stream, addr));
                    break;
                }
                ConnectResult::TimedOut => {
                    debug!("Destination {} timed out, advancing", addr);
                }
                ConnectResult::Refused => {
                    debug!("Destination {} refused, advancing", addr);
                }
            }
        }

        let Some((backend, backend_addr)) = connected else {
            warn!(
                "Route {}: no destination reachable for client {}",
                self.settings.name, label
            );
            if let Some(ip) = peer_ip {
                let newly_blocked = self.errors.lock().unwrap().record_failure(ip);
                if newly_blocked {
                    self.stats.blocked_clients.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        "Blocking client {} on route {} after {} connection errors",
                        ip, self.settings.name, self.settings.max_connect_errors
                    );
                }
            }
            self.reject(client, RejectReason::NoBackend).await;
            drop(guard);
            return;
        };

        if let Some(ip) = peer_ip {
            self.errors.lock().unwrap().reset(&ip);
        }

        let cfg = RelayConfig {
            protocol: self.settings.protocol,
            net_buffer_length: self.settings.net_buffer_length,
            client_connect_timeout: self.settings.client_connect_timeout,
        };
        let pair = ConnectionPair::new(client, backend, label.clone(), backend_addr.to_string());
        let stats = pair.run(cfg, stop).await;

        debug!(
            "Pair {} <-> {} closed after {:?}: {} bytes up, {} bytes down{}",
            label,
            backend_addr,
            stats.duration,
            stats.bytes_to_backend,
            stats.bytes_to_client,
            if stats.clean_close { "" } else { " (relay error)" },
        );
        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    use async_trait::async_trait;

    use crate::net::{ConnectOutcome, SystemSocketOps};
    use crate::protocol::extended::CONNECTION_CLOSE_MESSAGE;

    #[test]
    fn test_make_thread_name() {
        // names that do not begin with "routing" cannot be parsed
        assert_eq!(make_thread_name("", ""), ":parse err");
        assert_eq!(make_thread_name("routin", ""), ":parse err");
        assert_eq!(make_thread_name(" routing", ""), ":parse err");
        assert_eq!(make_thread_name("", "pre"), "pre:parse err");
        assert_eq!(make_thread_name("routin", "pre"), "pre:parse err");
        assert_eq!(make_thread_name(" routing", "pre"), "pre:parse err");

        // empty prefix is unusual but must not misbehave
        assert_eq!(make_thread_name("routing", ""), ":");
        assert_eq!(make_thread_name("routing:", ""), ":");

        // no "_default_" marker: everything after "routing:", clipped to 15
        assert_eq!(
            make_thread_name("routing:test_def_ult_x_ro", "RtS"),
            "RtS:test_def_ul"
        );
        assert_eq!(
            make_thread_name("routing:test_def_ult_ro", "RtS"),
            "RtS:test_def_ul"
        );
        assert_eq!(make_thread_name("routing", "RtS"), "RtS:");
        assert_eq!(make_thread_name("routing:test_x_ro", "RtS"), "RtS:test_x_ro");
        assert_eq!(make_thread_name("routing:test_ro", "RtS"), "RtS:test_ro");

        // the common case: strip up through "_default_"
        assert_eq!(
            make_thread_name("routing:test_default_x_ro", "RtS"),
            "RtS:x_ro"
        );
        assert_eq!(make_thread_name("routing:test_default_ro", "RtS"), "RtS:ro");
    }

    #[test]
    fn test_make_thread_name_is_deterministic() {
        for (name, prefix) in [("routing:test_default_x_ro", "RtS"), ("", "pre")] {
            assert_eq!(
                make_thread_name(name, prefix),
                make_thread_name(name, prefix)
            );
        }
    }

    #[test]
    fn test_client_errors_blocklist_invariant() {
        let mut errors = ClientErrors::new(3);
        let ip: IpAddr = "192.0.2.7".parse().unwrap();

        assert!(!errors.is_blocked(&ip));
        assert!(!errors.record_failure(ip));
        assert!(!errors.record_failure(ip));
        assert!(!errors.is_blocked(&ip));
        // third failure crosses the threshold exactly once
        assert!(errors.record_failure(ip));
        assert!(errors.is_blocked(&ip));
        assert!(!errors.record_failure(ip));
        assert_eq!(errors.blocked_count(), 1);

        errors.reset(&ip);
        assert!(!errors.is_blocked(&ip));
        assert_eq!(errors.blocked_count(), 0);
    }

    #[test]
    fn test_route_settings_defaults() {
        let settings = RouteSettings::new(
            "routing:test",
            AccessMode::ReadWrite,
            ProtocolKind::Classic,
        );
        assert_eq!(settings.max_connections, 512);
        assert_eq!(settings.connect_timeout, Duration::from_secs(1));
        assert_eq!(settings.client_connect_timeout, Duration::from_secs(9));
        assert_eq!(settings.max_connect_errors, 100);
        assert_eq!(settings.net_buffer_length, 16384);
    }

    #[test]
    fn test_set_destinations_from_csv_self_loop() {
        let ops: Arc<dyn SocketOps> = Arc::new(SystemSocketOps);

        let mut settings = RouteSettings::new(
            "routing:classic",
            AccessMode::ReadWrite,
            ProtocolKind::Classic,
        );
        settings.bind_tcp = Some(RouteAddress::new("127.0.0.1", 3306));
        let mut route = Route::new(settings, ops.clone()).unwrap();
        assert!(route.set_destinations_from_csv("127.0.0.1").is_err());
        assert!(route.set_destinations_from_csv("127.0.0.1:3306").is_err());
        assert!(route.set_destinations_from_csv("127.0.0.1:33060").is_ok());

        let mut settings = RouteSettings::new(
            "routing:x",
            AccessMode::ReadWrite,
            ProtocolKind::Extended,
        );
        settings.bind_tcp = Some(RouteAddress::new("127.0.0.1", 33060));
        let mut route = Route::new(settings, ops).unwrap();
        assert!(route.set_destinations_from_csv("127.0.0.1").is_err());
        assert!(route.set_destinations_from_csv("127.0.0.1:33060").is_err());
        assert!(route.set_destinations_from_csv("127.0.0.1:3306").is_ok());
    }

    #[test]
    fn test_set_destinations_from_uri() {
        let ops: Arc<dyn SocketOps> = Arc::new(SystemSocketOps);
        let settings = RouteSettings::new(
            "routing:meta",
            AccessMode::ReadWrite,
            ProtocolKind::Extended,
        );
        let mut route = Route::new(settings, ops).unwrap();

        assert!(route
            .set_destinations_from_uri("metadata-cache://test/default?role=PRIMARY")
            .is_ok());
        assert_eq!(route.metadata_cache_name(), Some("test"));

        let err = route
            .set_destinations_from_uri("metadata-cache://test/default")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing 'role' in routing destination specification"
        );
    }

    async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..300 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Backend that accepts connections and holds each one open until the
    /// extended close message (or EOF) arrives.
    async fn spawn_mock_backend() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let accepts_out = Arc::clone(&accepts);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                accepts.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 16];
                    let _ = stream.read(&mut buf).await;
                });
            }
        });
        (addr, accepts_out)
    }

    #[tokio::test]
    async fn test_route_end_to_end_loopback() {
        let (backend_addr, accepts) = spawn_mock_backend().await;

        let mut settings = RouteSettings::new(
            "routing:test_default_x_ro",
            AccessMode::ReadWrite,
            ProtocolKind::Extended,
        );
        settings.bind_tcp = Some(RouteAddress::new("127.0.0.1", 0));
        let mut route = Route::new(settings, Arc::new(SystemSocketOps)).unwrap();
        route
            .set_destinations_from_csv(&format!("127.0.0.1:{}", backend_addr.port()))
            .unwrap();
        let route = Arc::new(route);
        route.start().await.unwrap();
        assert_eq!(route.state().await, RouteState::Started);

        let router_addr = route.tcp_bound_addr().unwrap();
        let mut client1 = TcpStream::connect(router_addr).await.unwrap();
        let mut client2 = TcpStream::connect(router_addr).await.unwrap();

        let a = Arc::clone(&accepts);
        assert!(eventually(move || a.load(Ordering::SeqCst) == 2).await);
        let stats = Arc::clone(&route.stats);
        assert!(eventually(move || stats.active_connections() == 2).await);

        // orderly close of the first client
        client1.write_all(&CONNECTION_CLOSE_MESSAGE).await.unwrap();
        drop(client1);
        let stats = Arc::clone(&route.stats);
        assert!(eventually(move || stats.active_connections() == 1).await);

        client2.write_all(&CONNECTION_CLOSE_MESSAGE).await.unwrap();
        drop(client2);
        let stats = Arc::clone(&route.stats);
        assert!(eventually(move || stats.active_connections() == 0).await);

        assert_eq!(route.stats().total_accepted(), 2);

        route.stop().await;
        assert_eq!(route.state().await, RouteState::Stopped);
        assert_eq!(route.stats().active_connections(), 0);

        // stop is idempotent
        route.stop().await;
        assert_eq!(route.state().await, RouteState::Stopped);
    }

    #[tokio::test]
    async fn test_route_local_socket_listener() {
        let (backend_addr, accepts) = spawn_mock_backend().await;

        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("route.sock");

        let mut settings = RouteSettings::new(
            "routing:test_default_ro",
            AccessMode::ReadWrite,
            ProtocolKind::Extended,
        );
        settings.bind_socket = Some(socket_path.clone());
        let mut route = Route::new(settings, Arc::new(SystemSocketOps)).unwrap();
        route
            .set_destinations_from_csv(&format!("127.0.0.1:{}", backend_addr.port()))
            .unwrap();
        let route = Arc::new(route);
        route.start().await.unwrap();

        let mut client = tokio::net::UnixStream::connect(&socket_path).await.unwrap();
        let a = Arc::clone(&accepts);
        assert!(eventually(move || a.load(Ordering::SeqCst) == 1).await);
        let stats = Arc::clone(&route.stats);
        assert!(eventually(move || stats.active_connections() == 1).await);

        client.write_all(&CONNECTION_CLOSE_MESSAGE).await.unwrap();
        drop(client);
        let stats = Arc::clone(&route.stats);
        assert!(eventually(move || stats.active_connections() == 0).await);

        route.stop().await;
    }

    #[tokio::test]
    async fn test_route_stop_tears_down_active_pairs() {
        let (backend_addr, _accepts) = spawn_mock_backend().await;

        let mut settings = RouteSettings::new(
            "routing:test_default_rw",
            AccessMode::ReadWrite,
            ProtocolKind::Classic,
        );
        settings.bind_tcp = Some(RouteAddress::new("127.0.0.1", 0));
        let mut route = Route::new(settings, Arc::new(SystemSocketOps)).unwrap();
        route
            .set_destinations_from_csv(&format!("127.0.0.1:{}", backend_addr.port()))
            .unwrap();
        let route = Arc::new(route);
        route.start().await.unwrap();

        let router_addr = route.tcp_bound_addr().unwrap();
        let _client = TcpStream::connect(router_addr).await.unwrap();
        let stats = Arc::clone(&route.stats);
        assert!(eventually(move || stats.active_connections() == 1).await);

        // stop() must return only after the relay worker exited
        tokio::time::timeout(Duration::from_secs(5), route.stop())
            .await
            .expect("stop() hung");
        assert_eq!(route.stats().active_connections(), 0);
        assert_eq!(route.state().await, RouteState::Stopped);
    }

    /// Socket ops that refuse every dial, for exercising error accounting.
    struct RefusingOps;

    #[async_trait]
    impl SocketOps for RefusingOps {
        async fn lookup(&self, _host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
            Ok(vec![SocketAddr::from(([127, 0, 0, 1], port))])
        }

        async fn connect(&self, _addr: SocketAddr, _limit: Duration) -> ConnectOutcome {
            ConnectOutcome::Refused
        }
    }

    async fn read_rejection_code(client: &mut TcpStream) -> u16 {
        let mut frame = Vec::new();
        client.read_to_end(&mut frame).await.unwrap();
        // classic ERR packet: header(4) | 0xff | u16le code
        assert!(frame.len() >= 7);
        assert_eq!(frame[4], 0xff);
        u16::from_le_bytes([frame[5], frame[6]])
    }

    #[tokio::test]
    async fn test_connect_errors_lead_to_blacklist() {
        let mut settings = RouteSettings::new(
            "routing:test_default_rw",
            AccessMode::ReadWrite,
            ProtocolKind::Classic,
        );
        settings.bind_tcp = Some(RouteAddress::new("127.0.0.1", 0));
        settings.max_connect_errors = 2;
        let mut route = Route::new(settings, Arc::new(RefusingOps)).unwrap();
        route.set_destinations_from_csv("127.0.0.1:9").unwrap();
        let route = Arc::new(route);
        route.start().await.unwrap();
        let router_addr = route.tcp_bound_addr().unwrap();

        // two failed dials: backend-unreachable rejections
        for _ in 0..2 {
            let mut client = TcpStream::connect(router_addr).await.unwrap();
            assert_eq!(read_rejection_code(&mut client).await, 2003);
        }
        assert_eq!(route.stats().blocked_clients(), 1);

        // now blocked at admission, before any dial happens
        let mut client = TcpStream::connect(router_addr).await.unwrap();
        assert_eq!(read_rejection_code(&mut client).await, 1129);

        route.stop().await;
    }

    #[tokio::test]
    async fn test_max_connections_rejection() {
        let (backend_addr, _accepts) = spawn_mock_backend().await;

        let mut settings = RouteSettings::new(
            "routing:test_default_rw",
            AccessMode::ReadWrite,
            ProtocolKind::Classic,
        );
        settings.bind_tcp = Some(RouteAddress::new("127.0.0.1", 0));
        settings.max_connections = 1;
        let mut route = Route::new(settings, Arc::new(SystemSocketOps)).unwrap();
        route
            .set_destinations_from_csv(&format!("127.0.0.1:{}", backend_addr.port()))
            .unwrap();
        let route = Arc::new(route);
        route.start().await.unwrap();
        let router_addr = route.tcp_bound_addr().unwrap();

        let _client1 = TcpStream::connect(router_addr).await.unwrap();
        let stats = Arc::clone(&route.stats);
        assert!(eventually(move || stats.active_connections() == 1).await);

        // the second client exceeds the bound and is turned away
        let mut client2 = TcpStream::connect(router_addr).await.unwrap();
        assert_eq!(read_rejection_code(&mut client2).await, 1040);
        assert_eq!(route.stats().active_connections(), 1);
        assert!(route.stats().total_rejected() >= 1);

        route.stop().await;
    }
}
