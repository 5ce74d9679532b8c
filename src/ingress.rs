//! Port-based ingress dispatch
//!
//! The external load balancer forwards every public port here. Each port maps
//! to one internal proxy and bytes are forwarded untouched: no payload is
//! inspected at this layer.

use crate::buffer::BufferPool;
use crate::config::{Config, IngressRoute};
use crate::dns::DnsCache;
use crate::tcp_proxy::{dial, drain_sessions, splice, ConnectionError, ConnectionRegistry, ConnectionStats, StatsSnapshot};
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};

/// Internal address an ingress port forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressTarget {
    pub host: String,
    pub port: u16,
}

impl IngressTarget {
    pub fn parse(target: &str) -> anyhow::Result<Self> {
        let (host, port) = target
            .rsplit_once(':')
            .with_context(|| format!("ingress target '{}' must be host:port", target))?;
        let port = port
            .parse()
            .with_context(|| format!("invalid port in ingress target '{}'", target))?;
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        Ok(Self { host, port })
    }
}

impl std::fmt::Display for IngressTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A bound public port and its destination
pub struct IngressListener {
    pub listener: TcpListener,
    pub target: IngressTarget,
}

#[derive(Debug, Clone)]
pub struct IngressSettings {
    pub max_connections: usize,
    pub buffer_size: usize,
    pub dial_timeout: Duration,
    pub shutdown_grace_period: Duration,
}

impl IngressSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_connections: config.ingress.max_connections,
            buffer_size: config.ingress.buffer_size,
            dial_timeout: config.ingress.dial_timeout(),
            shutdown_grace_period: config.server.shutdown_grace_period(),
        }
    }
}

pub struct IngressProxy {
    settings: IngressSettings,
    dns: Arc<DnsCache>,
    buffers: Arc<BufferPool>,
    admission: Arc<Semaphore>,
    registry: Arc<ConnectionRegistry>,
    stats: ConnectionStats,
}

impl IngressProxy {
    pub fn new(settings: IngressSettings, dns: Arc<DnsCache>) -> Arc<Self> {
        Arc::new(Self {
            buffers: BufferPool::new(settings.buffer_size, settings.max_connections.min(4096) * 2),
            admission: Arc::new(Semaphore::new(settings.max_connections)),
            registry: ConnectionRegistry::new(),
            stats: ConnectionStats::default(),
            settings,
            dns,
        })
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.registry.len())
    }

    /// Bind every configured port; any failure is fatal
    pub async fn bind(config: &Config) -> anyhow::Result<Vec<IngressListener>> {
        let mut listeners = Vec::with_capacity(config.ingress.routes.len());
        for IngressRoute { port, target } in &config.ingress.routes {
            let addr = config.server.listen_addr(*port)?;
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind ingress port {}", addr))?;
            listeners.push(IngressListener {
                listener,
                target: IngressTarget::parse(target)?,
            });
        }
        Ok(listeners)
    }

    /// Serve all listeners until shutdown
    pub async fn run(
        self: Arc<Self>,
        listeners: Vec<IngressListener>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut ports = JoinSet::new();
        for IngressListener { listener, target } in listeners {
            let ingress = Arc::clone(&self);
            let shutdown_rx = shutdown_rx.clone();
            ports.spawn(async move { ingress.serve_port(listener, target, shutdown_rx).await });
        }

        while let Some(result) = ports.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Ingress port stopped with error"),
                Err(e) => warn!(error = %e, "Ingress port task failed"),
            }
        }

        info!("Ingress stopped");
        Ok(())
    }

    async fn serve_port(
        self: Arc<Self>,
        listener: TcpListener,
        target: IngressTarget,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, target = %target, "Ingress port listening");

        let target = Arc::new(target);
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.admit(&mut sessions, stream, peer, Arc::clone(&target)),
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
        debug!(addr = %local_addr, active = sessions.len(), "Draining ingress port");
        drain_sessions(&mut sessions, self.settings.shutdown_grace_period).await;
        Ok(())
    }

    fn admit(
        self: &Arc<Self>,
        sessions: &mut JoinSet<()>,
        stream: TcpStream,
        peer: SocketAddr,
        target: Arc<IngressTarget>,
    ) {
        let Ok(permit) = Arc::clone(&self.admission).try_acquire_owned() else {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            info!(peer = %peer, "Ingress connection refused: at capacity");
            return;
        };

        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        let guard = self.registry.register(peer);
        let span = tracing::info_span!("ingress", id = guard.id(), peer = %peer, target = %target);
        let ingress = Arc::clone(self);

        sessions.spawn(
            async move {
                if let Err(e) = ingress.forward(stream, &target).await {
                    ingress.stats.backend_failures.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, "Ingress forward failed");
                }
                drop(guard);
                drop(permit);
            }
            .instrument(span),
        );
    }

    async fn forward(&self, client: TcpStream, target: &IngressTarget) -> Result<(), ConnectionError> {
        let _ = client.set_nodelay(true);
        let addrs = self.dns.lookup(&target.host).await?;
        let backend = dial(&addrs, target.port, self.settings.dial_timeout).await?;
        self.stats.routed.fetch_add(1, Ordering::Relaxed);

        let outcome = splice(client, backend, &self.buffers).await;
        self.stats.bytes_to_backend.fetch_add(outcome.client_to_backend, Ordering::Relaxed);
        self.stats.bytes_from_backend.fetch_add(outcome.backend_to_client, Ordering::Relaxed);
        Ok(())
    }
}
