//! TTL-bounded cache of resolved backend addresses
//!
//! Backends are addressed by their cluster-local service name. Under
//! connection churn every new session would otherwise hit the cluster DNS, so
//! results are cached for a fixed TTL and a background sweep evicts entries
//! once they expire. Expired entries are never served.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

/// Errors from resolving a backend hostname
#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("{0} resolved to no addresses")]
    NoAddresses(String),
}

/// Something that can turn a hostname into addresses
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the system's getaddrinfo
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in addrs {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }
        Ok(ips)
    }
}

/// Resolver with a fixed host table, for loopback deployments and tests
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
    /// Answer for hosts not in the table
    fallback: Option<IpAddr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every hostname to the same address
    pub fn always(ip: IpAddr) -> Self {
        Self {
            hosts: HashMap::new(),
            fallback: Some(ip),
        }
    }

    pub fn with_host(mut self, host: &str, ips: Vec<IpAddr>) -> Self {
        self.hosts.insert(host.to_string(), ips);
        self
    }
}

#[async_trait]
impl Resolve for StaticResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        if let Some(ips) = self.hosts.get(host) {
            return Ok(ips.clone());
        }
        match self.fallback {
            Some(ip) => Ok(vec![ip]),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no static entry for {}", host),
            )),
        }
    }
}

/// One cached resolution
#[derive(Debug, Clone)]
pub struct DnsCacheEntry {
    pub hostname: String,
    pub addresses: Vec<IpAddr>,
    pub expires_at: Instant,
}

impl DnsCacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Cache statistics
#[derive(Debug, Default)]
pub struct DnsStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl DnsStats {
    pub fn get_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn get_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn get_evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

/// TTL cache in front of a [`Resolve`] implementation
pub struct DnsCache {
    entries: RwLock<HashMap<String, DnsCacheEntry>>,
    ttl: Duration,
    resolver: Arc<dyn Resolve>,
    stats: DnsStats,
}

impl DnsCache {
    pub fn new(ttl: Duration, resolver: Arc<dyn Resolve>) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            resolver,
            stats: DnsStats::default(),
        })
    }

    pub fn with_system_resolver(ttl: Duration) -> Arc<Self> {
        Self::new(ttl, Arc::new(SystemResolver))
    }

    pub fn stats(&self) -> &DnsStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve `host`, serving from cache while the entry is fresh
    pub async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Some(addresses) = self.cached(host) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(addresses);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let addresses = self
            .resolver
            .resolve(host)
            .await
            .map_err(|source| DnsError::Resolve {
                host: host.to_string(),
                source,
            })?;

        if addresses.is_empty() {
            return Err(DnsError::NoAddresses(host.to_string()));
        }

        debug!(host, count = addresses.len(), ttl_secs = self.ttl.as_secs(), "Cached DNS resolution");

        self.entries.write().insert(
            host.to_string(),
            DnsCacheEntry {
                hostname: host.to_string(),
                addresses: addresses.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );

        Ok(addresses)
    }

    fn cached(&self, host: &str) -> Option<Vec<IpAddr>> {
        let entries = self.entries.read();
        entries
            .get(host)
            .filter(|e| e.is_fresh(Instant::now()))
            .map(|e| e.addresses.clone())
    }

    /// Evict expired entries, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.is_fresh(now));
        let evicted = before - entries.len();
        if evicted > 0 {
            self.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        evicted
    }

    /// Periodically sweep until shutdown
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let evicted = self.sweep();
                    if evicted > 0 {
                        debug!(evicted, remaining = self.len(), "DNS cache sweep");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("DNS cache sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }
}
