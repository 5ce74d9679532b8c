//! Loopback tests for port-based ingress dispatch

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use deployra_proxy::config::{Config, IngressRoute};
use deployra_proxy::dns::{DnsCache, StaticResolver};
use deployra_proxy::ingress::{IngressListener, IngressProxy, IngressSettings, IngressTarget};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Echo server standing in for an internal proxy
async fn echo_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

fn settings() -> IngressSettings {
    IngressSettings {
        max_connections: 16,
        buffer_size: 4096,
        dial_timeout: Duration::from_secs(2),
        shutdown_grace_period: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn test_ingress_forwards_bytes_to_target() {
    let backend_port = echo_backend().await;
    let dns = DnsCache::new(
        Duration::from_secs(30),
        Arc::new(StaticResolver::new().with_host("memory-proxy.internal", vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let target = IngressTarget::parse(&format!("memory-proxy.internal:{}", backend_port)).unwrap();

    let ingress = IngressProxy::new(settings(), dns);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(Arc::clone(&ingress).run(vec![IngressListener { listener, target }], shutdown_rx));

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    // Not a valid handshake for any protocol; ingress must not care
    client.write_all(b"\x00\x01binary\xffpayload").await.unwrap();
    let mut buf = [0u8; 16];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"\x00\x01binary\xffpayload");
    drop(client);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let stats = ingress.stats();
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.routed, 1);
    assert_eq!(stats.bytes_to_backend, 16);
    assert_eq!(stats.bytes_from_backend, 16);
}

#[tokio::test]
async fn test_unresolvable_target_closes_client() {
    let dns = DnsCache::new(Duration::from_secs(30), Arc::new(StaticResolver::new()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let target = IngressTarget::parse("missing.internal:3306").unwrap();

    let ingress = IngressProxy::new(settings(), dns);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&ingress).run(vec![IngressListener { listener, target }], shutdown_rx));

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
        .await
        .expect("client was not disconnected");
    assert!(buf.is_empty());

    // The counter is bumped after the client socket is dropped
    for _ in 0..50 {
        if ingress.stats().backend_failures == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(ingress.stats().backend_failures, 1);
}

#[tokio::test]
async fn test_bind_uses_configured_routes() {
    let mut config = Config::default();
    config.server.bind = "127.0.0.1".to_string();
    config.ingress.routes = vec![IngressRoute {
        port: 0,
        target: "postgresql-proxy.deployra-system.svc.cluster.local:5432".to_string(),
    }];

    let listeners = IngressProxy::bind(&config).await.unwrap();
    assert_eq!(listeners.len(), 1);
    assert_eq!(listeners[0].target.port, 5432);
    assert!(listeners[0].listener.local_addr().unwrap().ip().is_loopback());
}
