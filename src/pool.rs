//! Connection pool for backend HTTP connections
//!
//! Backends are addressed by resolved socket address; the client's Host
//! header is forwarded untouched so backends can still do virtual hosting.

use crate::config::WebConfig;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("request build error: {0}")]
    RequestBuild(String),
}

#[derive(Debug, Default)]
pub struct PoolStats {
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per backend address
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl PoolConfig {
    pub fn from_config(web: &WebConfig, connect_timeout: Duration) -> Self {
        Self {
            max_idle_per_host: web.pool_max_idle_per_host,
            idle_timeout: web.pool_idle_timeout(),
            connect_timeout,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// A connection pool for HTTP connections to backend services
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(config.connect_timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request to `backend` through the pool
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        backend: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let backend_req = backend_request(req, backend)?;
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        let response = match self.client.request(backend_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Rewrite the request URI to point at `backend`, keeping method and headers
fn backend_request<B>(req: Request<B>, backend: SocketAddr) -> Result<Request<B>, PoolError> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let uri = format!("http://{}{}", backend, path);

    let (parts, body) = req.into_parts();
    let mut builder = Request::builder().method(parts.method).uri(&uri);
    for (key, value) in parts.headers.iter() {
        builder = builder.header(key, value);
    }

    builder.body(body).map_err(|e| PoolError::RequestBuild(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_from_web_config() {
        let web = WebConfig::default();
        let config = PoolConfig::from_config(&web, Duration::from_secs(3));
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_backend_request_keeps_host() {
        let req = Request::builder()
            .method("POST")
            .uri("/api/orders?page=2")
            .header("host", "shop.example.com")
            .header("x-request-id", "abc")
            .body(())
            .unwrap();

        let rewritten = backend_request(req, "10.0.0.7:8080".parse().unwrap()).unwrap();
        assert_eq!(rewritten.uri(), "http://10.0.0.7:8080/api/orders?page=2");
        assert_eq!(rewritten.method(), "POST");
        assert_eq!(rewritten.headers().get("host").unwrap(), "shop.example.com");
        assert_eq!(rewritten.headers().get("x-request-id").unwrap(), "abc");
    }

    #[test]
    fn test_ipv6_backend_uri() {
        let req = Request::builder().uri("/").body(()).unwrap();
        let rewritten = backend_request(req, "[fd00::1]:80".parse().unwrap()).unwrap();
        assert_eq!(rewritten.uri(), "http://[fd00::1]:80/");
    }

    #[test]
    fn test_pool_creation() {
        let pool = ConnectionPool::new(PoolConfig::default());
        assert_eq!(pool.config().max_idle_per_host, 10);
        assert_eq!(pool.stats().get_total_requests(), 0);
    }
}
