//! End-to-end gateway scenarios: one listener, mixed protocols, policy
//! enforcement, drain behavior.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use access_gateway::config::schema::AuditConfig;
use access_gateway::ebpf::SockmapRedirector;
use access_gateway::lifecycle::Server;
use access_gateway::policy::{AuditLog, PolicyEngine};

mod common;

async fn start_gateway(policy: Arc<PolicyEngine>, metrics_enabled: bool) -> (Server, common::MockBackend, common::MockBackend) {
    let http_backend = common::start_http_backend("ok").await;
    let tcp_backend = common::start_tcp_echo_backend().await;

    let business = common::test_business(http_backend.addr, tcp_backend.addr);
    let infra = common::test_infra(metrics_enabled);
    let server = Server::start(
        business,
        &infra,
        policy,
        None,
        Arc::new(SockmapRedirector::disabled()),
        None,
    )
    .await
    .expect("gateway failed to start");

    (server, http_backend, tcp_backend)
}

fn open_policy() -> Arc<PolicyEngine> {
    Arc::new(PolicyEngine::new(AuditLog::disabled()))
}

/// Send one raw HTTP request on a fresh connection and return the full
/// response bytes (the gateway serves one exchange per connection).
async fn raw_http_get(addr: std::net::SocketAddr, target: &str) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {} HTTP/1.1\r\nHost: gateway\r\n\r\n", target);
    // A denied connection may be reset before the write lands.
    let _ = stream.write_all(request.as_bytes()).await;

    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    response
}

#[tokio::test]
async fn http_happy_path_proxies_and_tags_response() {
    let (server, http_backend, _tcp) = start_gateway(open_policy(), false).await;

    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let response = client
        .get(format!("http://{}/healthz", server.local_addr()))
        .send()
        .await
        .expect("gateway unreachable");

    assert_eq!(response.status(), 200);
    assert!(
        response.headers().contains_key("x-gateway-id"),
        "response should carry the gateway id"
    );
    assert_eq!(response.text().await.unwrap(), "ok");
    assert_eq!(http_backend.hit_count(), 1);
}

#[tokio::test]
async fn waf_pattern_blocks_without_upstream_dial() {
    let audit_path = std::env::temp_dir().join("gateway-e2e-waf-audit.log");
    let _ = std::fs::remove_file(&audit_path);
    let audit = AuditLog::from_config(&AuditConfig {
        enabled: true,
        sink: format!("file://{}", audit_path.display()),
    });

    let policy = Arc::new(PolicyEngine::new(audit));
    policy.set_waf_enabled(true);
    policy.replace_blocked_patterns(&[r"(?i)(union.*select)".to_string()]);

    let (server, http_backend, _tcp) = start_gateway(policy, false).await;

    let response = raw_http_get(server.local_addr(), "/x?q=UNION%20SELECT%201").await;
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 403"), "got: {}", text);
    assert!(text.contains("blocked by WAF"), "got: {}", text);
    assert_eq!(http_backend.hit_count(), 0, "upstream must not be dialed");

    // Exactly one deny audit record naming the pattern.
    let audit_content = std::fs::read_to_string(&audit_path).unwrap();
    let denies: Vec<&str> = audit_content
        .lines()
        .filter(|l| l.contains(r#""action":"deny""#))
        .collect();
    assert_eq!(denies.len(), 1);
    assert!(denies[0].contains("union.*select"));
}

#[tokio::test]
async fn blocked_ip_is_closed_before_sniffing() {
    let policy = open_policy();
    policy.set_waf_enabled(true);
    policy.replace_blocked_ips(&["127.0.0.1".to_string()]);

    let (server, http_backend, tcp_backend) = start_gateway(policy, false).await;

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    // The gateway should close without reading anything.
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("connection was not closed")
        .unwrap_or(0);
    assert_eq!(n, 0, "expected EOF from the gateway");

    assert_eq!(http_backend.hit_count(), 0);
    assert_eq!(tcp_backend.hit_count(), 0);
}

#[tokio::test]
async fn rate_limit_admits_first_connection_only() {
    let policy = open_policy();
    // One token, negligible refill: only the first connection passes.
    policy.replace_rate_limit(0.01, 1);

    let (server, http_backend, _tcp) = start_gateway(policy, false).await;

    let first = raw_http_get(server.local_addr(), "/").await;
    assert!(
        String::from_utf8_lossy(&first).starts_with("HTTP/1.1 200"),
        "first connection should be served"
    );

    for _ in 0..2 {
        let response = raw_http_get(server.local_addr(), "/").await;
        assert!(
            response.is_empty(),
            "rate-limited connection should close without a response"
        );
    }

    assert_eq!(http_backend.hit_count(), 1);
}

#[tokio::test]
async fn tcp_splice_round_trips_binary_data() {
    let (server, _http, tcp_backend) = start_gateway(open_policy(), false).await;

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

    // First byte 0x02 classifies as opaque TCP; everything (including
    // the sniffed prefix) must reach the echo backend in order.
    let mut sent_total = Vec::new();
    for round in 0u8..4 {
        let chunk: Vec<u8> = (0..2500).map(|i| (i as u8) ^ round ^ 0x02).collect();
        let mut framed = vec![0x02];
        framed.extend_from_slice(&chunk);
        // Only the very first write carries the leading marker byte.
        let payload = if round == 0 { framed } else { chunk };

        stream.write_all(&payload).await.unwrap();
        sent_total.extend_from_slice(&payload);

        let mut echoed = vec![0u8; payload.len()];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload, "round {} echo mismatch", round);
    }

    assert!(sent_total.len() > 10_000);
    assert_eq!(tcp_backend.hit_count(), 1);
}

#[tokio::test]
async fn malformed_http_request_gets_400_class_response() {
    let (server, _http, _tcp) = start_gateway(open_policy(), false).await;

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    stream
        .write_all(b"GET /x HTTP/1.1\r\nthis header has no colon\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 400"), "got: {}", text);
}

#[tokio::test]
async fn drain_flips_readiness_and_keeps_inflight_sessions() {
    let (server, _http, _tcp) = start_gateway(open_policy(), true).await;
    let gateway_addr = server.local_addr();
    let metrics_addr = server.metrics_addr().expect("metrics server enabled");

    let probe = reqwest::Client::builder().no_proxy().build().unwrap();

    let ready = probe
        .get(format!("http://{}/ready", metrics_addr))
        .send()
        .await
        .unwrap();
    assert_eq!(ready.status(), 200);
    assert_eq!(ready.text().await.unwrap(), "Ready");

    let health = probe
        .get(format!("http://{}/health", metrics_addr))
        .send()
        .await
        .unwrap();
    assert_eq!(health.text().await.unwrap(), "OK");

    // Open a splice session before the drain starts.
    let mut session = TcpStream::connect(gateway_addr).await.unwrap();
    session.write_all(b"\x07pre-drain").await.unwrap();
    let mut echoed = vec![0u8; 10];
    session.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"\x07pre-drain");

    let shutdown = tokio::spawn(server.graceful_shutdown());

    // Readiness reports draining immediately; liveness stays green.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let ready = probe
        .get(format!("http://{}/ready", metrics_addr))
        .send()
        .await
        .unwrap();
    assert_eq!(ready.status(), 503);
    assert_eq!(ready.text().await.unwrap(), "Draining");
    let health = probe
        .get(format!("http://{}/health", metrics_addr))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);

    // The in-flight session keeps working through the drain window.
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.write_all(b"\x07mid-drain").await.unwrap();
        let mut echoed = vec![0u8; 10];
        session.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"\x07mid-drain");
    }

    // After the endpoint wait, the listener is gone: a new connection
    // cannot complete an exchange.
    let refused = match tokio::time::timeout(Duration::from_secs(1), async {
        let mut stream = TcpStream::connect(gateway_addr).await?;
        stream.write_all(b"\x07late").await?;
        let mut buf = [0u8; 4];
        let n = stream.read(&mut buf).await?;
        Ok::<usize, std::io::Error>(n)
    })
    .await
    {
        Err(_) => true,          // no answer at all
        Ok(Err(_)) => true,      // connect/write refused
        Ok(Ok(n)) => n == 0,     // accepted by the OS backlog, then dropped
    };
    assert!(refused, "new connections must not be served while draining");

    session.shutdown().await.unwrap();
    drop(session);

    // The drain sequence finishes within its configured budget.
    tokio::time::timeout(Duration::from_secs(5), shutdown)
        .await
        .expect("shutdown exceeded its budget")
        .unwrap();
}
