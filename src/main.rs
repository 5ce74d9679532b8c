use anyhow::Context;
use deployra_proxy::acme::{AcmeIssuer, CertSettings, CertificateManager, Http01Challenges};
use deployra_proxy::admin::{AdminServer, PKG_NAME, VERSION};
use deployra_proxy::config::{Config, StatusStoreKind};
use deployra_proxy::dns::DnsCache;
use deployra_proxy::dns01::{CloudflareDns, DnsProvider};
use deployra_proxy::handshake::Protocol;
use deployra_proxy::ingress::{IngressProxy, IngressSettings};
use deployra_proxy::pool::PoolConfig;
use deployra_proxy::proxy::{WebProxy, WebSettings};
use deployra_proxy::routing::{IdentityKind, RoutingTable};
use deployra_proxy::scale::{ScaleController, ScaleSettings};
use deployra_proxy::status::{HttpStatusStore, MemoryStatusStore, StatusStore};
use deployra_proxy::tcp_proxy::{DatabaseProxy, ProxySettings};
use deployra_proxy::watcher::ServiceWatcher;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "deployra.toml";

/// Which part of the fabric this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Ingress,
    Web,
    Database(Protocol),
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingress" => Ok(Role::Ingress),
            "web" => Ok(Role::Web),
            other => other
                .parse::<Protocol>()
                .map(Role::Database)
                .map_err(|_| anyhow::anyhow!("unknown role '{}'", other)),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Ingress => write!(f, "ingress"),
            Role::Web => write!(f, "web"),
            Role::Database(protocol) => write!(f, "{}", protocol.service_type()),
        }
    }
}

/// Long-running tasks of a role plus what the admin endpoint reports
struct Running {
    tasks: Vec<JoinHandle<()>>,
    admin: AdminServer,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("deployra_proxy=debug".parse().expect("valid log directive")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(role) = args.next() else {
        eprintln!("usage: {} <ingress|web|mysql|postgresql|memory> [config]", PKG_NAME);
        std::process::exit(2);
    };
    let role: Role = role.parse()?;
    let explicit_path = args.next().map(PathBuf::from);
    let config_path = explicit_path.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = if explicit_path.is_none() && !config_path.exists() {
        info!(path = %config_path.display(), "No configuration file, using defaults");
        Config::default()
    } else {
        Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?
    };

    info!(name = PKG_NAME, version = VERSION, %role, "Starting");

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A TLS crypto provider was already installed");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let running = match role {
        Role::Ingress => start_ingress(&config, shutdown_rx.clone()).await,
        Role::Database(protocol) => start_database(&config, protocol, shutdown_rx.clone()).await,
        Role::Web => start_web(&config, shutdown_rx.clone()).await,
    }
    .map_err(|e| {
        error!(%role, error = %e, "Startup failed");
        e
    })?;

    let Running { mut tasks, admin } = running;
    if config.server.admin_port > 0 {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), config.server.admin_port);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind admin endpoint {}", addr))?;
        tasks.push(spawn_result("admin", Arc::new(admin).run(listener, shutdown_rx.clone())));
    }

    wait_for_signal().await;
    let _ = shutdown_tx.send(true);

    // Listeners drain within the grace period themselves
    let grace = config.server.shutdown_grace_period() + Duration::from_secs(5);
    if tokio::time::timeout(grace, futures::future::join_all(tasks)).await.is_err() {
        warn!("Tasks did not stop in time");
    }

    info!("Shutdown complete");
    Ok(())
}

fn spawn_result<F>(name: &'static str, task: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "Task failed");
        }
    })
}

async fn kube_client() -> anyhow::Result<kube::Client> {
    kube::Client::try_default()
        .await
        .context("failed to connect to the Kubernetes API")
}

/// Build a routing table from the initial list and keep it current
async fn start_routing(
    config: &Config,
    service_type: &str,
    kind: IdentityKind,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<(Arc<RoutingTable>, JoinHandle<()>)> {
    let routing = RoutingTable::new();
    let watcher = ServiceWatcher::new(kube_client().await?, &config.kubernetes, service_type, kind, Arc::clone(&routing));
    watcher.initial_sync().await?;
    let handle = tokio::spawn(watcher.run(shutdown_rx));
    Ok((routing, handle))
}

async fn bind(config: &Config, port: u16) -> anyhow::Result<TcpListener> {
    let addr = config.server.listen_addr(port)?;
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))
}

async fn start_ingress(config: &Config, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<Running> {
    let listeners = IngressProxy::bind(config).await?;
    let dns = DnsCache::with_system_resolver(config.database.dns_ttl());
    let ingress = IngressProxy::new(IngressSettings::from_config(config), Arc::clone(&dns));

    let tasks = vec![
        tokio::spawn(Arc::clone(&dns).run_sweeper(config.database.dns_sweep_interval(), shutdown_rx.clone())),
        spawn_result("ingress", Arc::clone(&ingress).run(listeners, shutdown_rx)),
    ];

    let admin = AdminServer::new(Role::Ingress.to_string()).with_dns(dns).with_ingress(ingress);
    Ok(Running { tasks, admin })
}

async fn start_database(
    config: &Config,
    protocol: Protocol,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<Running> {
    let port = match protocol {
        Protocol::Mysql => config.database.mysql_port,
        Protocol::Postgresql => config.database.postgresql_port,
        Protocol::Memory => config.database.memory_port,
    };
    let listener = bind(config, port).await?;

    let (routing, watch_task) =
        start_routing(config, protocol.service_type(), IdentityKind::Username, shutdown_rx.clone()).await?;
    let dns = DnsCache::with_system_resolver(config.database.dns_ttl());
    let proxy = DatabaseProxy::new(
        protocol,
        ProxySettings::from_config(config),
        Arc::clone(&routing),
        Arc::clone(&dns),
    );

    let tasks = vec![
        watch_task,
        tokio::spawn(Arc::clone(&dns).run_sweeper(config.database.dns_sweep_interval(), shutdown_rx.clone())),
        spawn_result("proxy", Arc::clone(&proxy).run(listener, shutdown_rx)),
    ];

    let admin = AdminServer::new(Role::Database(protocol).to_string())
        .with_routing(routing)
        .with_dns(dns)
        .with_database(proxy);
    Ok(Running { tasks, admin })
}

fn status_store(config: &Config) -> anyhow::Result<Arc<dyn StatusStore>> {
    Ok(match config.status_store.kind {
        StatusStoreKind::Memory => {
            info!("Using in-process status store; scaling takes effect immediately");
            Arc::new(MemoryStatusStore::standalone())
        }
        StatusStoreKind::Http => {
            let url = config
                .status_store
                .url
                .as_deref()
                .context("status_store.url is required")?;
            Arc::new(HttpStatusStore::new(url, config.status_store.timeout())?)
        }
    })
}

async fn start_web(config: &Config, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<Running> {
    let web = &config.web;
    let http_listener = if web.http_port > 0 { Some(bind(config, web.http_port).await?) } else { None };
    let https_listener = if web.tls_enabled() { Some(bind(config, web.https_port).await?) } else { None };

    let (routing, watch_task) = start_routing(config, "web", IdentityKind::Domain, shutdown_rx.clone()).await?;
    let dns = DnsCache::with_system_resolver(web.dns_ttl());
    let mut tasks = vec![
        watch_task,
        tokio::spawn(Arc::clone(&dns).run_sweeper(config.database.dns_sweep_interval(), shutdown_rx.clone())),
    ];

    let mut proxy = WebProxy::new(
        WebSettings::from_config(config),
        PoolConfig::from_config(web, web.dial_timeout()),
        Arc::clone(&routing),
        Arc::clone(&dns),
    );
    let mut admin = AdminServer::new(Role::Web.to_string())
        .with_routing(Arc::clone(&routing))
        .with_dns(dns);

    if config.scale_to_zero.enabled {
        let scale = ScaleController::new(
            ScaleSettings::from(&config.scale_to_zero),
            status_store(config)?,
            Arc::clone(&routing),
        );
        tasks.push(tokio::spawn(Arc::clone(&scale).run_scanner(shutdown_rx.clone())));
        proxy = proxy.with_scale(Arc::clone(&scale));
        admin = admin.with_scale(scale);
    }

    if web.tls_enabled() {
        let challenges = Http01Challenges::new();
        let dns_provider: Option<Arc<dyn DnsProvider>> = if web.acme.dns.is_configured() {
            Some(Arc::new(CloudflareDns::new(&web.acme.dns)?))
        } else {
            None
        };
        let issuer = AcmeIssuer::new(config, challenges.clone(), dns_provider)?;
        let certs = CertificateManager::new(CertSettings::from_config(config), Arc::new(issuer), Arc::clone(&routing));
        tasks.push(tokio::spawn(Arc::clone(&certs).run_renewal(shutdown_rx.clone())));
        proxy = proxy.with_certificates(Arc::clone(&certs), challenges);
        admin = admin.with_certificates(certs);
        info!(platform_domain = ?web.platform_domain, "On-demand TLS enabled");
    }

    let proxy = Arc::new(proxy);
    if let Some(listener) = http_listener {
        tasks.push(spawn_result("http", Arc::clone(&proxy).run(listener, false, shutdown_rx.clone())));
    }
    if let Some(listener) = https_listener {
        tasks.push(spawn_result("https", Arc::clone(&proxy).run(listener, true, shutdown_rx)));
    }

    Ok(Running {
        tasks,
        admin: admin.with_web(proxy),
    })
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
    }
    info!("Received Ctrl+C, shutting down...");
}
