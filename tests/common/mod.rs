//! Shared utilities for integration testing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use access_gateway::config::schema::{
    AuditConfig, BusinessConfig, HttpUpstream, InfraConfig, LifecycleConfig, MetricsConfig,
    RedisConfig, SockmapConfig, TcpUpstream,
};

/// A mock upstream with a hit counter.
pub struct MockBackend {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicU32>,
}

impl MockBackend {
    pub fn hit_count(&self) -> u32 {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Start a mock HTTP backend returning a fixed 200 response.
///
/// Only requests carrying the gateway's `x-gateway-id` header count as
/// hits, so the gateway's own upstream health probes don't skew tests.
pub async fn start_http_backend(body: &'static str) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicU32::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let counter = counter.clone();
                    tokio::spawn(async move {
                        // Drain the request head before answering.
                        let mut buf = [0u8; 4096];
                        let mut head = Vec::new();
                        loop {
                            match socket.read(&mut buf).await {
                                Ok(0) => break,
                                Ok(n) => {
                                    head.extend_from_slice(&buf[..n]);
                                    if head.windows(4).any(|w| w == b"\r\n\r\n") {
                                        break;
                                    }
                                }
                                Err(_) => return,
                            }
                        }
                        if head
                            .windows(b"x-gateway-id".len())
                            .any(|w| w.eq_ignore_ascii_case(b"x-gateway-id"))
                        {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    MockBackend { addr, hits }
}

/// Start a mock TCP backend that echoes every byte until EOF.
///
/// Connections count as hits only once they deliver data; the gateway's
/// dial-only health probes stay invisible.
pub async fn start_tcp_echo_backend() -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicU32::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let counter = counter.clone();
                    tokio::spawn(async move {
                        let mut buf = [0u8; 8192];
                        let mut seen_data = false;
                        loop {
                            match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => {
                                    if !seen_data {
                                        seen_data = true;
                                        counter.fetch_add(1, Ordering::SeqCst);
                                    }
                                    if socket.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    MockBackend { addr, hits }
}

/// Business config pointing at the given mock upstreams, listening on
/// an ephemeral port.
pub fn test_business(http_upstream: SocketAddr, tcp_upstream: SocketAddr) -> BusinessConfig {
    BusinessConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        max_connections: 64,
        http_upstream: HttpUpstream {
            target_url: format!("http://{}", http_upstream),
            timeout: Duration::from_secs(5),
        },
        tcp_upstream: TcpUpstream {
            target_addr: tcp_upstream.to_string(),
            timeout: Duration::from_secs(2),
        },
        lifecycle: LifecycleConfig {
            shutdown_timeout: Duration::from_secs(3),
            drain_wait: Duration::from_millis(300),
        },
    }
}

/// Infrastructure config for tests: no store, optional metrics server
/// on an ephemeral port, audit disabled.
pub fn test_infra(metrics_enabled: bool) -> InfraConfig {
    InfraConfig {
        metrics: MetricsConfig {
            enabled: metrics_enabled,
            listen_addr: "127.0.0.1:0".to_string(),
        },
        redis: RedisConfig {
            addr: String::new(),
            password: String::new(),
            db: 0,
            key_prefix: "gateway:".to_string(),
        },
        audit: AuditConfig {
            enabled: false,
            sink: "stdout".to_string(),
        },
        sockmap: SockmapConfig {
            object_path: None,
            cgroup_path: "/sys/fs/cgroup".to_string(),
        },
    }
}
