//! Loopback admin endpoint for probes and introspection
//!
//! - `GET /healthz` liveness, plus the number of routed services
//! - `GET /routes` identity → service table
//! - `GET /stats` connection, DNS, scale and certificate counters
//! - `GET /connections` live database/cache sessions

use crate::acme::CertificateManager;
use crate::dns::DnsCache;
use crate::ingress::IngressProxy;
use crate::proxy::WebProxy;
use crate::routing::RoutingTable;
use crate::scale::ScaleController;
use crate::tcp_proxy::DatabaseProxy;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn json_response(body: serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = response(StatusCode::OK, body.to_string());
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

/// What the admin endpoint can report on; absent parts are omitted
pub struct AdminServer {
    role: String,
    routing: Option<Arc<RoutingTable>>,
    dns: Option<Arc<DnsCache>>,
    ingress: Option<Arc<IngressProxy>>,
    database: Option<Arc<DatabaseProxy>>,
    web: Option<Arc<WebProxy>>,
    scale: Option<Arc<ScaleController>>,
    certs: Option<Arc<CertificateManager>>,
}

impl AdminServer {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            routing: None,
            dns: None,
            ingress: None,
            database: None,
            web: None,
            scale: None,
            certs: None,
        }
    }

    pub fn with_routing(mut self, routing: Arc<RoutingTable>) -> Self {
        self.routing = Some(routing);
        self
    }

    pub fn with_dns(mut self, dns: Arc<DnsCache>) -> Self {
        self.dns = Some(dns);
        self
    }

    pub fn with_ingress(mut self, ingress: Arc<IngressProxy>) -> Self {
        self.ingress = Some(ingress);
        self
    }

    pub fn with_database(mut self, database: Arc<DatabaseProxy>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_web(mut self, web: Arc<WebProxy>) -> Self {
        self.web = Some(web);
        self
    }

    pub fn with_scale(mut self, scale: Arc<ScaleController>) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_certificates(mut self, certs: Arc<CertificateManager>) -> Self {
        self.certs = Some(certs);
        self
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin endpoint listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let admin = Arc::clone(&self);
                            tokio::spawn(async move {
                                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                                    let admin = Arc::clone(&admin);
                                    async move { Ok::<_, hyper::Error>(admin.handle(req.method(), req.uri().path())) }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(TokioIo::new(stream), service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Admin endpoint shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    fn handle(&self, method: &Method, path: &str) -> Response<Full<Bytes>> {
        debug!(%method, path, "Admin request");

        match (method, path) {
            (&Method::GET, "/healthz") => json_response(json!({
                "status": "ok",
                "role": self.role,
                "services": self.routing.as_ref().map(|r| r.len()),
            })),
            (&Method::GET, "/version") => json_response(json!({
                "name": PKG_NAME,
                "version": VERSION,
            })),
            (&Method::GET, "/routes") => match &self.routing {
                Some(routing) => {
                    let routes: Vec<_> = routing
                        .routes()
                        .into_iter()
                        .map(|(identity, key)| json!({ "identity": identity, "service": key.to_string() }))
                        .collect();
                    json_response(json!({ "routes": routes, "count": routes.len() }))
                }
                None => response(StatusCode::NOT_FOUND, "no routing table for this role"),
            },
            (&Method::GET, "/stats") => json_response(self.stats()),
            (&Method::GET, "/connections") => match &self.database {
                Some(database) => json_response(json!({ "connections": database.registry().snapshot() })),
                None => response(StatusCode::NOT_FOUND, "no connection registry for this role"),
            },
            _ => response(StatusCode::NOT_FOUND, "not found"),
        }
    }

    fn stats(&self) -> serde_json::Value {
        let mut stats = serde_json::Map::new();
        stats.insert("role".to_string(), json!(self.role));

        if let Some(ingress) = &self.ingress {
            stats.insert("ingress".to_string(), json!(ingress.stats()));
        }
        if let Some(database) = &self.database {
            let buffers = database.buffers().stats();
            stats.insert("connections".to_string(), json!(database.stats()));
            stats.insert(
                "buffers".to_string(),
                json!({
                    "allocated": buffers.get_allocated(),
                    "reused": buffers.get_reused(),
                    "outstanding": buffers.get_outstanding(),
                }),
            );
        }
        if let Some(web) = &self.web {
            let pool = web.pool().stats();
            stats.insert("web".to_string(), json!(web.stats()));
            stats.insert(
                "pool".to_string(),
                json!({
                    "requests": pool.get_total_requests(),
                    "failed": pool.get_failed_requests(),
                }),
            );
        }
        if let Some(dns) = &self.dns {
            let dns_stats = dns.stats();
            stats.insert(
                "dns".to_string(),
                json!({
                    "entries": dns.len(),
                    "hits": dns_stats.get_hits(),
                    "misses": dns_stats.get_misses(),
                    "evictions": dns_stats.get_evictions(),
                }),
            );
        }
        if let Some(scale) = &self.scale {
            let phases: Vec<_> = scale
                .phases()
                .into_iter()
                .map(|(key, phase)| json!({ "service": key.to_string(), "phase": phase }))
                .collect();
            stats.insert("scale_to_zero".to_string(), json!(phases));
        }
        if let Some(certs) = &self.certs {
            stats.insert("certificates".to_string(), json!(certs.certificates()));
        }

        serde_json::Value::Object(stats)
    }
}
