//! HTTP(S) reverse proxy routing by `Host`
//!
//! The domain labels of web Services form the routing table. TLS is
//! terminated here with certificates chosen from the SNI name after the
//! ClientHello has been read, so issuance can happen on the first request.

use crate::acme::{CertificateManager, Http01Challenges};
use crate::buffer::BufferPool;
use crate::config::Config;
use crate::dns::{DnsCache, DnsError};
use crate::error::{json_error_response, ErrorResponse, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::routing::{RoutingTable, ServiceInfo};
use crate::scale::ScaleController;
use crate::tcp_proxy::{dial, drain_sessions, splice};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

/// Largest backend response head accepted for an upgrade
const MAX_UPGRADE_RESPONSE: usize = 16 * 1024;

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

#[derive(Debug, Clone)]
pub struct WebSettings {
    pub request_timeout: Duration,
    pub dial_timeout: Duration,
    /// Redirect plain HTTP here when set
    pub https_redirect_port: Option<u16>,
    pub cluster_domain: String,
    pub shutdown_grace_period: Duration,
    pub buffer_size: usize,
}

impl WebSettings {
    pub fn from_config(config: &Config) -> Self {
        let web = &config.web;
        Self {
            request_timeout: web.request_timeout(),
            dial_timeout: web.dial_timeout(),
            https_redirect_port: (web.force_https && web.tls_enabled()).then_some(web.https_port),
            cluster_domain: config.kubernetes.cluster_domain.clone(),
            shutdown_grace_period: config.server.shutdown_grace_period(),
            buffer_size: config.ingress.buffer_size,
        }
    }
}

#[derive(Debug, Default)]
pub struct WebStats {
    pub requests: AtomicU64,
    pub unknown_host: AtomicU64,
    pub wake_failures: AtomicU64,
    pub backend_failures: AtomicU64,
    pub timeouts: AtomicU64,
    pub upgrades: AtomicU64,
    pub tls_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WebStatsSnapshot {
    pub requests: u64,
    pub unknown_host: u64,
    pub wake_failures: u64,
    pub backend_failures: u64,
    pub timeouts: u64,
    pub upgrades: u64,
    pub tls_failures: u64,
}

impl WebStats {
    pub fn snapshot(&self) -> WebStatsSnapshot {
        WebStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            unknown_host: self.unknown_host.load(Ordering::Relaxed),
            wake_failures: self.wake_failures.load(Ordering::Relaxed),
            backend_failures: self.backend_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            upgrades: self.upgrades.load(Ordering::Relaxed),
            tls_failures: self.tls_failures.load(Ordering::Relaxed),
        }
    }
}

/// The web reverse proxy
pub struct WebProxy {
    settings: WebSettings,
    routing: Arc<RoutingTable>,
    dns: Arc<DnsCache>,
    pool: ConnectionPool,
    buffers: Arc<BufferPool>,
    scale: Option<Arc<ScaleController>>,
    certs: Option<Arc<CertificateManager>>,
    challenges: Http01Challenges,
    stats: WebStats,
}

impl WebProxy {
    pub fn new(settings: WebSettings, pool_config: PoolConfig, routing: Arc<RoutingTable>, dns: Arc<DnsCache>) -> Self {
        Self {
            buffers: BufferPool::new(settings.buffer_size, 256),
            pool: ConnectionPool::new(pool_config),
            settings,
            routing,
            dns,
            scale: None,
            certs: None,
            challenges: Http01Challenges::new(),
            stats: WebStats::default(),
        }
    }

    /// Wake sleeping services before forwarding to them
    pub fn with_scale(mut self, scale: Arc<ScaleController>) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Enable TLS termination and the HTTP-01 responder
    pub fn with_certificates(mut self, certs: Arc<CertificateManager>, challenges: Http01Challenges) -> Self {
        self.certs = Some(certs);
        self.challenges = challenges;
        self
    }

    pub fn stats(&self) -> WebStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn tls_enabled(&self) -> bool {
        self.certs.is_some()
    }

    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        tls: bool,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        if tls && self.certs.is_none() {
            anyhow::bail!("TLS listener requires a certificate manager");
        }

        let protocol = if tls { "HTTPS" } else { "HTTP" };
        info!(addr = %listener.local_addr()?, protocol, "Web proxy listening");

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let proxy = Arc::clone(&self);
                            sessions.spawn(async move {
                                let result = if tls {
                                    proxy.serve_tls(stream, peer).await
                                } else {
                                    proxy.serve_http(stream, peer, false).await
                                };
                                if let Err(e) = result {
                                    debug!(peer = %peer, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(protocol, "Web proxy shutting down");
                        break;
                    }
                }
            }
        }

        drop(listener);
        drain_sessions(&mut sessions, self.settings.shutdown_grace_period).await;
        Ok(())
    }

    async fn serve_tls(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        let Some(certs) = self.certs.clone() else {
            return Ok(());
        };

        let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream).await?;
        let server_name = start.client_hello().server_name().map(str::to_string);

        let config = match certs.server_config(server_name.as_deref()).await {
            Ok(config) => config,
            Err(e) => {
                // The client sees a failed handshake
                self.stats.tls_failures.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %peer, server_name = ?server_name, error = %e, "No certificate for TLS client");
                return Ok(());
            }
        };

        let stream = start.into_stream(config).await?;
        self.serve_http(stream, peer, true).await
    }

    async fn serve_http<S>(self: Arc<Self>, stream: S, peer: SocketAddr, tls: bool) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req: Request<Incoming>| {
            let proxy = Arc::clone(&self);
            async move { proxy.handle_request(req, peer, tls).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .http1()
            .preserve_header_case(true)
            .http2()
            .max_concurrent_streams(250)
            .serve_connection_with_upgrades(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    async fn handle_request(
        self: Arc<Self>,
        mut req: Request<Incoming>,
        peer: SocketAddr,
        tls: bool,
    ) -> Result<ProxyResponse, hyper::Error> {
        // ACME challenges go before the HTTPS redirect
        if !tls {
            if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
                if let Some(key_auth) = self.challenges.get(token).await {
                    debug!(token, "Responding to ACME HTTP-01 challenge");
                    return Ok(text_response(StatusCode::OK, key_auth));
                }
            }

            if let Some(port) = self.settings.https_redirect_port {
                return Ok(build_https_redirect(&req, port));
            }
        }

        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let Some(hostname) = extract_hostname(&req) else {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        };

        let Some(service) = self.routing.lookup(&hostname) else {
            self.stats.unknown_host.fetch_add(1, Ordering::Relaxed);
            info!(hostname, "No service for host");
            return Ok(json_error_response(ProxyErrorCode::UnknownHost, "Unknown or unconfigured host"));
        };

        set_forwarding_headers(&mut req, &request_id, peer, tls);
        debug!(hostname, service = %service.key(), method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

        if let Some(scale) = &self.scale {
            if let Err(e) = scale.ensure_awake(&service).await {
                self.stats.wake_failures.fetch_add(1, Ordering::Relaxed);
                warn!(hostname, error = %e, "Service unavailable");
                return Ok(ErrorResponse::from(&e).into_response());
            }
        }

        let backend = match self.resolve(&service).await {
            Ok(backend) => backend,
            Err(e) => {
                self.stats.backend_failures.fetch_add(1, Ordering::Relaxed);
                warn!(hostname, error = %e, "Failed to resolve backend");
                return Ok(json_error_response(
                    ProxyErrorCode::ConnectionFailed,
                    "Failed to connect to backend",
                ));
            }
        };

        if is_upgrade_request(&req) {
            return Ok(self.handle_upgrade(req, backend, hostname, request_id).await);
        }

        let timeout = self.settings.request_timeout;
        match tokio::time::timeout(timeout, self.pool.send_request(req, backend)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.stats.backend_failures.fetch_add(1, Ordering::Relaxed);
                error!(hostname, backend = %backend, error = %e, "Failed to forward request");
                Ok(json_error_response(
                    ProxyErrorCode::ConnectionFailed,
                    "Failed to connect to backend",
                ))
            }
            Err(_) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(hostname, backend = %backend, timeout_secs = timeout.as_secs(), "Request timed out");
                Ok(json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!("Request timed out after {} seconds", timeout.as_secs()),
                ))
            }
        }
    }

    async fn resolve(&self, service: &ServiceInfo) -> Result<SocketAddr, DnsError> {
        let host = service.cluster_host(&self.settings.cluster_domain);
        let addrs = self.dns.lookup(&host).await?;
        addrs
            .first()
            .map(|ip| SocketAddr::new(*ip, service.port))
            .ok_or(DnsError::NoAddresses(host))
    }

    async fn handle_upgrade(
        self: &Arc<Self>,
        req: Request<Incoming>,
        backend: SocketAddr,
        hostname: String,
        request_id: String,
    ) -> ProxyResponse {
        let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
        debug!(hostname, request_id, upgrade_type, "Handling upgrade request");

        let mut backend_stream = match dial(&[backend.ip()], backend.port(), self.settings.dial_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                self.stats.backend_failures.fetch_add(1, Ordering::Relaxed);
                error!(hostname, backend = %backend, error = %e, "Failed to connect to backend for upgrade");
                return json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend");
            }
        };

        let head = match exchange_upgrade(&mut backend_stream, &build_upgrade_request(&req)).await {
            Ok(head) => head,
            Err(e) => {
                self.stats.backend_failures.fetch_add(1, Ordering::Relaxed);
                error!(hostname, error = %e, "Upgrade exchange with backend failed");
                return json_error_response(ProxyErrorCode::ConnectionFailed, "Invalid upgrade response from backend");
            }
        };

        let Some((status, response_headers)) = parse_upgrade_response(&head) else {
            error!(hostname, "Failed to parse backend upgrade response");
            return json_error_response(ProxyErrorCode::ConnectionFailed, "Invalid upgrade response from backend");
        };

        let mut response = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
        *response.status_mut() = status;
        for (name, value) in &response_headers {
            let lower = name.to_ascii_lowercase();
            if lower == "content-length" || lower == "transfer-encoding" {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                hyper::header::HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                response.headers_mut().append(name, value);
            }
        }

        if status != StatusCode::SWITCHING_PROTOCOLS {
            warn!(hostname, status = %status, "Backend rejected upgrade request");
            return response;
        }

        info!(hostname, request_id, upgrade_type, "Upgrade accepted");
        self.stats.upgrades.fetch_add(1, Ordering::Relaxed);

        let buffers = Arc::clone(&self.buffers);
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let outcome = splice(TokioIo::new(upgraded), backend_stream, &buffers).await;
                    debug!(
                        hostname,
                        request_id,
                        client_to_backend = outcome.client_to_backend,
                        backend_to_client = outcome.backend_to_client,
                        "Upgraded connection closed"
                    );
                }
                Err(e) => {
                    error!(hostname, error = %e, "Failed to upgrade client connection");
                }
            }
        });

        response
    }
}

/// Overwrite client-supplied forwarding headers; this proxy is the first trusted hop
fn set_forwarding_headers<B>(req: &mut Request<B>, request_id: &str, peer: SocketAddr, tls: bool) {
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&peer.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    let proto = if tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
}

fn text_response(status: StatusCode, body: String) -> ProxyResponse {
    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(hyper::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Host from the `Host` header, or the URI authority for HTTP/2
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;

    let hostname = raw.split(':').next()?.trim_end_matches('.');
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    // Alphanumeric, hyphen and dot only
    if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

/// Build an HTTPS redirect response (301 Moved Permanently)
fn build_https_redirect<B>(req: &Request<B>, https_port: u16) -> ProxyResponse {
    let host = extract_hostname(req).unwrap_or_else(|| "localhost".to_string());
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let location = if https_port == 443 {
        format!("https://{}{}", host, path)
    } else {
        format!("https://{}:{}{}", host, https_port, path)
    };

    let mut response = text_response(StatusCode::MOVED_PERMANENTLY, "Redirecting to HTTPS".to_string());
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(hyper::header::LOCATION, value);
    }
    response
}

/// Check if a request asks for a protocol upgrade (WebSocket and friends)
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_ascii_lowercase())
}

/// Raw HTTP/1.1 upgrade request for the backend, headers copied verbatim
fn build_upgrade_request<B>(req: &Request<B>) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    request.push_str("\r\n");

    request.into_bytes()
}

/// Send the upgrade request and read the backend's response head
async fn exchange_upgrade(backend: &mut TcpStream, request: &[u8]) -> std::io::Result<Vec<u8>> {
    backend.write_all(request).await?;

    let mut head = Vec::with_capacity(1024);
    let mut byte = [0u8; 1];
    // Byte-wise so no frame data after the head is consumed
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_UPGRADE_RESPONSE {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "upgrade response too large"));
        }
        if backend.read(&mut byte).await? == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        head.push(byte[0]);
    }
    Ok(head)
}

/// Status and headers of an HTTP/1.1 response head
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }
    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(host: Option<&str>, uri: &str) -> Request<()> {
        let mut builder = Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header("host", host);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_extract_hostname() {
        assert_eq!(extract_hostname(&request(Some("Shop.Example.com:8443"), "/")).as_deref(), Some("shop.example.com"));
        assert_eq!(extract_hostname(&request(Some("shop.example.com."), "/")).as_deref(), Some("shop.example.com"));
        assert_eq!(extract_hostname(&request(None, "https://api.example.com/x")).as_deref(), Some("api.example.com"));
        assert!(extract_hostname(&request(None, "/")).is_none());
        assert!(extract_hostname(&request(Some("bad host\n"), "/")).is_none());
        assert!(extract_hostname(&request(Some("a".repeat(300).as_str()), "/")).is_none());
    }

    #[test]
    fn test_https_redirect() {
        let req = request(Some("shop.example.com"), "/cart?id=1");
        let response = build_https_redirect(&req, 443);
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers().get("location").unwrap(), "https://shop.example.com/cart?id=1");

        let response = build_https_redirect(&req, 8443);
        assert_eq!(response.headers().get("location").unwrap(), "https://shop.example.com:8443/cart?id=1");
    }

    #[test]
    fn test_forwarding_headers_overwrite_client_values() {
        let mut req = Request::builder()
            .uri("/")
            .header("host", "shop.example.com")
            .header("x-forwarded-for", "6.6.6.6")
            .body(())
            .unwrap();
        set_forwarding_headers(&mut req, "req-1", "203.0.113.9:5000".parse().unwrap(), true);

        let headers = req.headers();
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "203.0.113.9");
        assert_eq!(headers.get(X_FORWARDED_HOST).unwrap(), "shop.example.com");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "https");
        assert_eq!(headers.get(X_REQUEST_ID).unwrap(), "req-1");
    }

    #[test]
    fn test_upgrade_detection() {
        let req = Request::builder()
            .uri("/ws")
            .header("connection", "keep-alive, Upgrade")
            .header("upgrade", "WebSocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));
        assert_eq!(get_upgrade_type(&req).as_deref(), Some("websocket"));
        assert!(!is_upgrade_request(&request(Some("a"), "/")));
    }

    #[test]
    fn test_parse_upgrade_response() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(head).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers[0], ("Upgrade".to_string(), "websocket".to_string()));
        assert!(parse_upgrade_response(b"garbage").is_none());
    }
}
