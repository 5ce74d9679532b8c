//! Identity-routed TCP proxy for the database and cache protocols
//!
//! accept → admission → identity → route → resolve → dial → replay → splice.
//! Admission is a counting semaphore polled without waiting: a full proxy
//! refuses new clients instead of queueing them.

use crate::buffer::BufferPool;
use crate::config::Config;
use crate::dns::{DnsCache, DnsError};
use crate::handshake::{HandshakeError, Handshaker, IdentitySource, Protocol};
use crate::routing::{RoutingTable, ServiceKey};
use dashmap::DashMap;
use serde::Serialize;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};

/// Why a proxied session ended early
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("no route for identity '{0}'")]
    Unrouted(String),

    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error("failed to connect to {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to {0}")]
    DialTimeout(SocketAddr),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Counters for one proxy listener
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub accepted: AtomicU64,
    /// Refused because `max_connections` were already active
    pub rejected: AtomicU64,
    pub routed: AtomicU64,
    pub misses: AtomicU64,
    pub handshake_failures: AtomicU64,
    pub backend_failures: AtomicU64,
    pub bytes_to_backend: AtomicU64,
    pub bytes_from_backend: AtomicU64,
}

/// Point-in-time copy of [`ConnectionStats`]
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub active: usize,
    pub routed: u64,
    pub misses: u64,
    pub handshake_failures: u64,
    pub backend_failures: u64,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

impl ConnectionStats {
    pub fn snapshot(&self, active: usize) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            active,
            routed: self.routed.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            backend_failures: self.backend_failures.load(Ordering::Relaxed),
            bytes_to_backend: self.bytes_to_backend.load(Ordering::Relaxed),
            bytes_from_backend: self.bytes_from_backend.load(Ordering::Relaxed),
        }
    }

    fn record_bytes(&self, outcome: &SpliceOutcome) {
        self.bytes_to_backend.fetch_add(outcome.client_to_backend, Ordering::Relaxed);
        self.bytes_from_backend.fetch_add(outcome.backend_to_client, Ordering::Relaxed);
    }
}

/// A live proxied session
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer: SocketAddr,
    pub identity: Option<String>,
    pub backend: Option<ServiceKey>,
    #[serde(skip)]
    pub started_at: Instant,
}

/// Live sessions, owned by the proxy that accepted them
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<u64, ConnectionInfo>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track a new session until the returned guard drops
    pub fn register(self: &Arc<Self>, peer: SocketAddr) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.connections.insert(
            id,
            ConnectionInfo {
                id,
                peer,
                identity: None,
                backend: None,
                started_at: Instant::now(),
            },
        );
        ConnectionGuard {
            id,
            registry: Arc::clone(self),
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut conns: Vec<_> = self.connections.iter().map(|e| e.value().clone()).collect();
        conns.sort_by_key(|c| c.id);
        conns
    }
}

/// Removes its session from the registry on drop
pub struct ConnectionGuard {
    id: u64,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_identity(&self, identity: &str) {
        if let Some(mut conn) = self.registry.connections.get_mut(&self.id) {
            conn.identity = Some(identity.to_string());
        }
    }

    pub fn set_backend(&self, key: ServiceKey) {
        if let Some(mut conn) = self.registry.connections.get_mut(&self.id) {
            conn.backend = Some(key);
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.connections.remove(&self.id);
    }
}

/// Bytes moved in each direction by [`splice`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceOutcome {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

async fn copy_direction<R, W>(reader: &mut R, writer: &mut W, buf: &mut [u8], total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *total += n as u64;
    }
}

/// Copy bytes both ways until either side closes or fails.
///
/// Each direction borrows one pooled buffer; both go back to the pool when
/// this future completes or is dropped.
pub async fn splice<C, B>(client: C, backend: B, buffers: &Arc<BufferPool>) -> SpliceOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);
    let mut upstream_buf = buffers.get();
    let mut downstream_buf = buffers.get();
    let mut upstream = 0u64;
    let mut downstream = 0u64;

    let result = tokio::select! {
        r = copy_direction(&mut client_read, &mut backend_write, &mut upstream_buf, &mut upstream) => r,
        r = copy_direction(&mut backend_read, &mut client_write, &mut downstream_buf, &mut downstream) => r,
    };
    if let Err(e) = result {
        debug!(error = %e, "Splice ended with error");
    }

    SpliceOutcome {
        client_to_backend: upstream,
        backend_to_client: downstream,
    }
}

/// Connect to the first reachable address, each attempt bounded by `timeout`
pub async fn dial(addrs: &[IpAddr], port: u16, timeout: Duration) -> Result<TcpStream, ConnectionError> {
    let mut last_error = None;

    for ip in addrs {
        let addr = SocketAddr::new(*ip, port);
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Ok(Err(source)) => {
                debug!(addr = %addr, error = %source, "Backend dial failed");
                last_error = Some(ConnectionError::Dial { addr, source });
            }
            Err(_) => {
                debug!(addr = %addr, "Backend dial timed out");
                last_error = Some(ConnectionError::DialTimeout(addr));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| ConnectionError::Io(io::Error::new(io::ErrorKind::NotFound, "no addresses"))))
}

/// Wait for sessions to finish, aborting whatever is left after `grace`
pub(crate) async fn drain_sessions(sessions: &mut JoinSet<()>, grace: Duration) {
    let drained = tokio::time::timeout(grace, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = sessions.len(),
            grace_secs = grace.as_secs(),
            "Grace period expired, closing remaining sessions"
        );
        sessions.abort_all();
        while sessions.join_next().await.is_some() {}
    }
}

/// Runtime settings for a [`DatabaseProxy`]
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub max_connections: usize,
    pub buffer_size: usize,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_handshake_bytes: usize,
    pub shutdown_grace_period: Duration,
    pub reject_unrouted: bool,
    pub cluster_domain: String,
    pub mysql_server_version: String,
}

impl ProxySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_connections: config.database.max_connections,
            buffer_size: config.database.buffer_size,
            dial_timeout: config.database.dial_timeout(),
            handshake_timeout: config.database.handshake_timeout(),
            max_handshake_bytes: config.database.max_handshake_bytes,
            shutdown_grace_period: config.server.shutdown_grace_period(),
            reject_unrouted: config.database.reject_unrouted,
            cluster_domain: config.kubernetes.cluster_domain.clone(),
            mysql_server_version: config.database.mysql_server_version.clone(),
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// One protocol's proxy listener
pub struct DatabaseProxy {
    handshaker: Handshaker,
    settings: ProxySettings,
    routing: Arc<RoutingTable>,
    dns: Arc<DnsCache>,
    buffers: Arc<BufferPool>,
    admission: Arc<Semaphore>,
    registry: Arc<ConnectionRegistry>,
    stats: ConnectionStats,
}

impl DatabaseProxy {
    pub fn new(
        protocol: Protocol,
        settings: ProxySettings,
        routing: Arc<RoutingTable>,
        dns: Arc<DnsCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            handshaker: Handshaker::new(protocol, settings.max_handshake_bytes, &settings.mysql_server_version),
            buffers: BufferPool::new(settings.buffer_size, settings.max_connections * 2),
            admission: Arc::new(Semaphore::new(settings.max_connections)),
            registry: ConnectionRegistry::new(),
            stats: ConnectionStats::default(),
            settings,
            routing,
            dns,
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.handshaker.protocol()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.registry.len())
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    /// Accept until shutdown, then drain within the grace period
    pub async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            protocol = %self.protocol(),
            addr = %local_addr,
            max_connections = self.settings.max_connections,
            "Database proxy listening"
        );

        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.admit(&mut sessions, stream, peer),
                        Err(e) => {
                            warn!(error = %e, "Accept error");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        info!(protocol = %self.protocol(), active = sessions.len(), "Stopped accepting, draining sessions");
        drain_sessions(&mut sessions, self.settings.shutdown_grace_period).await;

        info!(protocol = %self.protocol(), "Database proxy stopped");
        Ok(())
    }

    fn admit(self: &Arc<Self>, sessions: &mut JoinSet<()>, stream: TcpStream, peer: SocketAddr) {
        let permit = match Arc::clone(&self.admission).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                info!(
                    peer = %peer,
                    max_connections = self.settings.max_connections,
                    "Connection refused: at capacity"
                );
                drop(stream);
                return;
            }
        };

        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        let guard = self.registry.register(peer);
        let span = tracing::info_span!("session", id = guard.id(), peer = %peer, protocol = %self.protocol());
        let proxy = Arc::clone(self);

        sessions.spawn(
            async move {
                proxy.serve(stream, peer, &guard).await;
                drop(guard);
                drop(permit);
            }
            .instrument(span),
        );
    }

    async fn serve(&self, mut client: TcpStream, peer: SocketAddr, guard: &ConnectionGuard) {
        let _ = client.set_nodelay(true);

        match self.proxy_session(&mut client, peer, guard).await {
            Ok(outcome) => debug!(
                bytes_to_backend = outcome.client_to_backend,
                bytes_from_backend = outcome.backend_to_client,
                "Session closed"
            ),
            Err(ConnectionError::Unrouted(identity)) => {
                info!(identity = %identity, "No backend for identity")
            }
            Err(ConnectionError::Handshake(HandshakeError::CancelRequest)) => {
                debug!("Dropped cancel request")
            }
            Err(e) => debug!(error = %e, "Session failed"),
        }
    }

    async fn proxy_session(
        &self,
        client: &mut TcpStream,
        peer: SocketAddr,
        guard: &ConnectionGuard,
    ) -> Result<SpliceOutcome, ConnectionError> {
        let timeout = self.settings.handshake_timeout;

        let hello = match tokio::time::timeout(timeout, self.handshaker.read_client_hello(client, peer)).await {
            Ok(Ok(hello)) => hello,
            Ok(Err(e)) => {
                self.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
            Err(_) => {
                self.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
                return Err(ConnectionError::HandshakeTimeout);
            }
        };
        guard.set_identity(&hello.identity);
        if hello.source == IdentitySource::PeerAddress {
            debug!(identity = %hello.identity, "No identity in handshake, routing by peer address");
        }

        let Some(service) = self.routing.lookup(&hello.identity) else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            if self.settings.reject_unrouted {
                if let Err(e) = self.handshaker.reject(&hello, client).await {
                    debug!(error = %e, "Failed to send rejection");
                }
            }
            return Err(ConnectionError::Unrouted(hello.identity));
        };
        self.stats.routed.fetch_add(1, Ordering::Relaxed);

        let host = service.cluster_host(&self.settings.cluster_domain);
        let mut backend = async {
            let addrs = self.dns.lookup(&host).await?;
            dial(&addrs, service.port, self.settings.dial_timeout).await
        }
        .await
        .inspect_err(|_| {
            self.stats.backend_failures.fetch_add(1, Ordering::Relaxed);
        })?;

        guard.set_backend(service.key());
        debug!(identity = %hello.identity, service = %service.key(), "Routed session");

        match tokio::time::timeout(timeout, self.handshaker.forward_hello(&hello, client, &mut backend)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(ConnectionError::HandshakeTimeout),
        }

        let outcome = splice(client, &mut backend, &self.buffers).await;
        self.stats.record_bytes(&outcome);
        Ok(outcome)
    }
}
