//! Deployra edge proxy fabric
//!
//! One external load balancer fronts every tenant. Behind it:
//! - a port-based ingress that forwards raw TCP to one internal proxy per protocol
//! - MySQL, PostgreSQL and Redis-compatible proxies that read the client's
//!   username from its handshake and route to that tenant's Service
//! - a web proxy routing by `Host`, issuing TLS certificates on demand and
//!   scaling idle services to zero
//!
//! All routing comes from labeled Kubernetes Services, watched live.

pub mod acme;
pub mod admin;
pub mod buffer;
pub mod config;
pub mod dns;
pub mod dns01;
pub mod error;
pub mod handshake;
pub mod ingress;
pub mod pool;
pub mod proxy;
pub mod routing;
pub mod scale;
pub mod status;
pub mod tcp_proxy;
pub mod watcher;
