use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy fabric
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Service discovery settings
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    /// Port-based ingress dispatcher
    #[serde(default)]
    pub ingress: IngressConfig,

    /// Settings shared by the MySQL, PostgreSQL and memory proxies
    #[serde(default)]
    pub database: DatabaseConfig,

    /// HTTP(S) web proxy
    #[serde(default)]
    pub web: WebConfig,

    #[serde(default)]
    pub scale_to_zero: ScaleToZeroConfig,

    /// Status channel shared with the orchestrator
    #[serde(default)]
    pub status_store: StatusStoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for every public listener (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Loopback port for health and introspection (0 disables it)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// How long to wait for in-flight connections on shutdown
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl ServerConfig {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Socket address for a public listener on `port`
    pub fn listen_addr(&self, port: u16) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .bind
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid bind address '{}': {}", self.bind, e))?;
        Ok(SocketAddr::new(ip, port))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct KubernetesConfig {
    /// Namespace to watch (default: all namespaces)
    pub namespace: Option<String>,

    /// Value of the `managedBy` label on routable services
    #[serde(default = "default_managed_by")]
    pub managed_by: String,

    /// Cluster DNS suffix used to build `<svc>.<ns>.svc.<suffix>`
    #[serde(default = "default_cluster_domain")]
    pub cluster_domain: String,
}

impl KubernetesConfig {
    /// Label selector for services of a given backend type
    pub fn label_selector(&self, service_type: &str) -> String {
        format!(
            "{}={},{}={}",
            crate::routing::MANAGED_BY_LABEL,
            self.managed_by,
            crate::routing::TYPE_LABEL,
            service_type
        )
    }
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            managed_by: default_managed_by(),
            cluster_domain: default_cluster_domain(),
        }
    }
}

/// One ingress port and where its traffic goes
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct IngressRoute {
    /// Public port to accept on
    pub port: u16,

    /// Internal proxy address as `host:port`
    pub target: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngressConfig {
    #[serde(default = "default_ingress_routes")]
    pub routes: Vec<IngressRoute>,

    #[serde(default = "default_ingress_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl IngressConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            routes: default_ingress_routes(),
            max_connections: default_ingress_max_connections(),
            dial_timeout_secs: default_dial_timeout(),
            buffer_size: default_buffer_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_mysql_port")]
    pub mysql_port: u16,

    #[serde(default = "default_postgresql_port")]
    pub postgresql_port: u16,

    #[serde(default = "default_memory_port")]
    pub memory_port: u16,

    /// Concurrent sessions per proxy; further connections are refused
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Size of each pooled copy buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// Time allowed for a client to present its identity
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Upper bound on bytes buffered while extracting the identity
    #[serde(default = "default_max_handshake_bytes")]
    pub max_handshake_bytes: usize,

    #[serde(default = "default_dns_ttl")]
    pub dns_ttl_secs: u64,

    #[serde(default = "default_dns_sweep_interval")]
    pub dns_sweep_interval_secs: u64,

    /// Answer routing misses with a protocol error instead of closing silently
    #[serde(default = "default_true")]
    pub reject_unrouted: bool,

    /// Version string advertised in synthetic MySQL greetings
    #[serde(default = "default_mysql_server_version")]
    pub mysql_server_version: String,
}

impl DatabaseConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn dns_ttl(&self) -> Duration {
        Duration::from_secs(self.dns_ttl_secs)
    }

    pub fn dns_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.dns_sweep_interval_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            mysql_port: default_mysql_port(),
            postgresql_port: default_postgresql_port(),
            memory_port: default_memory_port(),
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            dial_timeout_secs: default_dial_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            max_handshake_bytes: default_max_handshake_bytes(),
            dns_ttl_secs: default_dns_ttl(),
            dns_sweep_interval_secs: default_dns_sweep_interval(),
            reject_unrouted: true,
            mysql_server_version: default_mysql_server_version(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    /// HTTP port (0 disables)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// HTTPS port (0 disables)
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Redirect plain HTTP to HTTPS (ACME challenges are still served)
    #[serde(default)]
    pub force_https: bool,

    /// Platform suffix whose subdomains share one wildcard certificate
    pub platform_domain: Option<String>,

    /// Max time to wait for a backend response
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Connect timeout toward web backends
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// Maximum idle connections per backend host
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    #[serde(default = "default_dns_ttl")]
    pub dns_ttl_secs: u64,

    #[serde(default)]
    pub acme: AcmeConfig,
}

impl WebConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    pub fn dns_ttl(&self) -> Duration {
        Duration::from_secs(self.dns_ttl_secs)
    }

    pub fn tls_enabled(&self) -> bool {
        self.https_port != 0 && self.acme.enabled
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            https_port: default_https_port(),
            force_https: false,
            platform_domain: None,
            request_timeout_secs: default_request_timeout(),
            dial_timeout_secs: default_dial_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            dns_ttl_secs: default_dns_ttl(),
            acme: AcmeConfig::default(),
        }
    }
}

/// ACME (Let's Encrypt) configuration for on-demand certificates
#[derive(Debug, Deserialize, Clone)]
pub struct AcmeConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Contact email for CA notifications (required when enabled)
    pub email: Option<String>,

    /// ACME directory URL (defaults to Let's Encrypt production)
    /// Use "https://acme-staging-v02.api.letsencrypt.org/directory" for testing
    pub directory_url: Option<String>,

    /// Directory holding the cached ACME account
    #[serde(default = "default_acme_cache_dir")]
    pub cache_dir: String,

    /// Renew when a certificate has fewer than this many days left
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u64,

    #[serde(default = "default_renewal_check_interval")]
    pub renewal_check_interval_secs: u64,

    /// First delay after a failed issuance; doubles per failure
    #[serde(default = "default_issuance_backoff_initial")]
    pub issuance_backoff_initial_secs: u64,

    #[serde(default = "default_issuance_backoff_max")]
    pub issuance_backoff_max_secs: u64,

    /// DNS provider used for the platform wildcard (DNS-01)
    #[serde(default)]
    pub dns: DnsProviderConfig,
}

impl AcmeConfig {
    pub fn renew_before(&self) -> Duration {
        Duration::from_secs(self.renew_before_days * 24 * 60 * 60)
    }

    pub fn renewal_check_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_check_interval_secs)
    }

    pub fn issuance_backoff_initial(&self) -> Duration {
        Duration::from_secs(self.issuance_backoff_initial_secs)
    }

    pub fn issuance_backoff_max(&self) -> Duration {
        Duration::from_secs(self.issuance_backoff_max_secs)
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            email: None,
            directory_url: None,
            cache_dir: default_acme_cache_dir(),
            renew_before_days: default_renew_before_days(),
            renewal_check_interval_secs: default_renewal_check_interval(),
            issuance_backoff_initial_secs: default_issuance_backoff_initial(),
            issuance_backoff_max_secs: default_issuance_backoff_max(),
            dns: DnsProviderConfig::default(),
        }
    }
}

/// DNS provider API credentials for DNS-01 challenges
#[derive(Debug, Deserialize, Clone)]
pub struct DnsProviderConfig {
    /// API token with DNS edit permission on the zone
    pub api_token: Option<String>,

    /// Zone holding the platform domain
    pub zone_id: Option<String>,

    #[serde(default = "default_dns_api_base")]
    pub api_base: String,

    /// Wait after publishing the TXT record before asking the CA to validate
    #[serde(default = "default_propagation_delay")]
    pub propagation_delay_secs: u64,
}

impl DnsProviderConfig {
    pub fn propagation_delay(&self) -> Duration {
        Duration::from_secs(self.propagation_delay_secs)
    }

    pub fn is_configured(&self) -> bool {
        self.api_token.is_some() && self.zone_id.is_some()
    }
}

impl Default for DnsProviderConfig {
    fn default() -> Self {
        Self {
            api_token: None,
            zone_id: None,
            api_base: default_dns_api_base(),
            propagation_delay_secs: default_propagation_delay(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScaleToZeroConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Idle time after which an opted-in service is scaled to zero
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: u64,

    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Max time a request is held while its service wakes
    #[serde(default = "default_wake_timeout")]
    pub wake_timeout_secs: u64,

    #[serde(default = "default_ready_poll_interval")]
    pub ready_poll_interval_ms: u64,
}

impl ScaleToZeroConfig {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn wake_timeout(&self) -> Duration {
        Duration::from_secs(self.wake_timeout_secs)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }
}

impl Default for ScaleToZeroConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_threshold_secs: default_idle_threshold(),
            scan_interval_secs: default_scan_interval(),
            wake_timeout_secs: default_wake_timeout(),
            ready_poll_interval_ms: default_ready_poll_interval(),
        }
    }
}

/// Which status store backs the scale-to-zero state
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StatusStoreKind {
    /// In-process only; nothing is shared with the orchestrator
    #[default]
    Memory,
    /// JSON over HTTP to the orchestrator's status endpoint
    Http,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatusStoreConfig {
    #[serde(default, rename = "type")]
    pub kind: StatusStoreKind,

    /// Base URL of the status endpoint (required for `http`)
    pub url: Option<String>,

    #[serde(default = "default_status_timeout")]
    pub timeout_secs: u64,
}

impl StatusStoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for StatusStoreConfig {
    fn default() -> Self {
        Self {
            kind: StatusStoreKind::default(),
            url: None,
            timeout_secs: default_status_timeout(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9901
}

fn default_shutdown_grace_period() -> u64 {
    30
}

fn default_managed_by() -> String {
    crate::routing::MANAGED_BY_VALUE.to_string()
}

fn default_cluster_domain() -> String {
    "cluster.local".to_string()
}

fn default_ingress_routes() -> Vec<IngressRoute> {
    let target = |name: &str, port: u16| format!("{}.deployra-system.svc.cluster.local:{}", name, port);
    vec![
        IngressRoute { port: 80, target: target("web-proxy", 80) },
        IngressRoute { port: 443, target: target("web-proxy", 443) },
        IngressRoute { port: 3306, target: target("mysql-proxy", 3306) },
        IngressRoute { port: 5432, target: target("postgresql-proxy", 5432) },
        IngressRoute { port: 6379, target: target("memory-proxy", 6379) },
    ]
}

fn default_ingress_max_connections() -> usize {
    10_000
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_postgresql_port() -> u16 {
    5432
}

fn default_memory_port() -> u16 {
    6379
}

fn default_max_connections() -> usize {
    1000
}

fn default_buffer_size() -> usize {
    32 * 1024
}

fn default_dial_timeout() -> u64 {
    5
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_max_handshake_bytes() -> usize {
    16 * 1024
}

fn default_dns_ttl() -> u64 {
    300 // 5 minutes
}

fn default_dns_sweep_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_mysql_server_version() -> String {
    "8.0.36-deployra".to_string()
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_acme_cache_dir() -> String {
    "./acme_cache".to_string()
}

fn default_renew_before_days() -> u64 {
    30
}

fn default_renewal_check_interval() -> u64 {
    12 * 60 * 60
}

fn default_issuance_backoff_initial() -> u64 {
    60
}

fn default_issuance_backoff_max() -> u64 {
    6 * 60 * 60
}

fn default_dns_api_base() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}

fn default_propagation_delay() -> u64 {
    20
}

fn default_idle_threshold() -> u64 {
    900 // 15 minutes
}

fn default_scan_interval() -> u64 {
    60
}

fn default_wake_timeout() -> u64 {
    60
}

fn default_ready_poll_interval() -> u64 {
    500
}

fn default_status_timeout() -> u64 {
    5
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.server.listen_addr(0) {
            errors.push(e.to_string());
        }

        let mut seen_ports = std::collections::HashSet::new();
        for route in &self.ingress.routes {
            if route.port == 0 {
                errors.push("ingress route: 'port' must be greater than 0".to_string());
            }
            if !seen_ports.insert(route.port) {
                errors.push(format!("ingress route: port {} is listed twice", route.port));
            }
            if route.target.rsplit_once(':').and_then(|(_, p)| p.parse::<u16>().ok()).is_none() {
                errors.push(format!(
                    "ingress route {}: target '{}' must be host:port",
                    route.port, route.target
                ));
            }
        }

        if self.ingress.max_connections == 0 {
            errors.push("ingress.max_connections must be greater than 0".to_string());
        }
        if self.database.max_connections == 0 {
            errors.push("database.max_connections must be greater than 0".to_string());
        }
        if self.database.buffer_size < 1024 || self.ingress.buffer_size < 1024 {
            errors.push("buffer_size must be at least 1024 bytes".to_string());
        }
        if self.database.max_handshake_bytes < 512 {
            errors.push("database.max_handshake_bytes must be at least 512".to_string());
        }

        if self.web.acme.enabled {
            if self.web.acme.email.is_none() {
                errors.push("web.acme.email is required when ACME is enabled".to_string());
            }
            if self.web.acme.issuance_backoff_initial_secs == 0
                || self.web.acme.issuance_backoff_max_secs < self.web.acme.issuance_backoff_initial_secs
            {
                errors.push("web.acme issuance backoff must be positive and max >= initial".to_string());
            }
            if self.web.platform_domain.is_some() && !self.web.acme.dns.is_configured() {
                errors.push(
                    "web.acme.dns api_token and zone_id are required for the platform wildcard".to_string(),
                );
            }
        }

        if self.scale_to_zero.scan_interval_secs == 0 {
            errors.push("scale_to_zero.scan_interval_secs must be greater than 0".to_string());
        }
        if self.scale_to_zero.ready_poll_interval_ms == 0 {
            errors.push("scale_to_zero.ready_poll_interval_ms must be greater than 0".to_string());
        }

        if self.status_store.kind == StatusStoreKind::Http && self.status_store.url.is_none() {
            errors.push("status_store.url is required when type = \"http\"".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
