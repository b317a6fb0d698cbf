//! TCP splicing.
//!
//! Relays bytes between a sniffed client connection and the configured
//! TCP upstream until either direction ends. When the kernel fast path
//! is active the pair is registered for in-kernel forwarding; the
//! userspace loops still run to flush the sniffed prefix and cover
//! whatever the kernel declines.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::schema::TcpUpstream;
use crate::ebpf::SockmapRedirector;
use crate::net::sniffer::SniffedStream;
use crate::observability::metrics;
use crate::policy::PolicyEngine;

const COPY_BUF_SIZE: usize = 16 * 1024;

pub struct TcpSplicer {
    target_addr: String,
    dial_timeout: Duration,
    policy: Arc<PolicyEngine>,
    sockmap: Arc<SockmapRedirector>,
}

impl TcpSplicer {
    pub fn new(
        upstream: &TcpUpstream,
        policy: Arc<PolicyEngine>,
        sockmap: Arc<SockmapRedirector>,
    ) -> Self {
        Self {
            target_addr: upstream.target_addr.clone(),
            dial_timeout: upstream.timeout,
            policy,
            sockmap,
        }
    }

    pub fn target_addr(&self) -> &str {
        &self.target_addr
    }

    /// Run one splice session to completion.
    pub async fn splice(&self, client: SniffedStream, remote: SocketAddr) {
        let upstream = match timeout(self.dial_timeout, TcpStream::connect(&self.target_addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(upstream = %self.target_addr, error = %e, "Upstream dial failed");
                self.policy
                    .audit_tcp(remote, &self.target_addr, false, &format!("dial failed: {}", e));
                metrics::record_upstream_dial_failure(&self.target_addr);
                return;
            }
            Err(_) => {
                tracing::warn!(upstream = %self.target_addr, "Upstream dial timed out");
                self.policy
                    .audit_tcp(remote, &self.target_addr, false, "dial timed out");
                metrics::record_upstream_dial_failure(&self.target_addr);
                return;
            }
        };

        let pair = self.sockmap.register_pair(client.get_ref(), &upstream);

        let started = Instant::now();
        let bytes_in = AtomicU64::new(0);
        let bytes_out = AtomicU64::new(0);

        let (client_rd, client_wr) = tokio::io::split(client);
        let (upstream_rd, upstream_wr) = upstream.into_split();

        // First direction to finish wins; dropping the loser's halves
        // closes both sockets, which wakes any pending peer operation.
        tokio::select! {
            result = copy_counted(client_rd, upstream_wr, &bytes_in) => {
                log_direction("client->upstream", result);
            }
            result = copy_counted(upstream_rd, client_wr, &bytes_out) => {
                log_direction("upstream->client", result);
            }
        }

        if let Some(pair) = pair {
            self.sockmap.unregister_pair(&pair);
        }

        let duration = started.elapsed();
        let bytes_in = bytes_in.load(Ordering::Relaxed);
        let bytes_out = bytes_out.load(Ordering::Relaxed);

        metrics::record_tcp_session(&self.target_addr, duration, bytes_in, bytes_out);
        self.policy.audit_tcp(
            remote,
            &self.target_addr,
            true,
            &format!("bytes_in={} bytes_out={}", bytes_in, bytes_out),
        );

        tracing::debug!(
            remote = %remote,
            upstream = %self.target_addr,
            bytes_in,
            bytes_out,
            duration_ms = duration.as_millis() as u64,
            "TCP session ended"
        );
    }
}

/// One-directional copy loop accumulating into a shared counter.
///
/// The counter lives outside the future so the tally survives when the
/// opposite direction finishes first and this future is dropped.
async fn copy_counted<R, W>(mut reader: R, mut writer: W, counter: &AtomicU64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

fn log_direction(direction: &str, result: std::io::Result<()>) {
    match result {
        Ok(()) => tracing::trace!(direction, "Splice direction closed"),
        Err(e) => tracing::debug!(direction, error = %e, "Splice direction errored"),
    }
}
