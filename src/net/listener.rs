//! Gateway listener: accept loop, connection admission, dispatch.
//!
//! The accept loop is single-tasked; each accepted connection moves
//! into its own task immediately. A semaphore bounds concurrent
//! connections; the permit is held for the connection's lifetime so
//! backpressure survives even if a handler panics.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};

use crate::error::GatewayError;
use crate::net::sniffer::{Protocol, SniffedStream};
use crate::observability::metrics;
use crate::policy::PolicyEngine;
use crate::proxy::{HttpProxy, TcpSplicer};

/// Shared handler set threaded into every connection task.
pub struct ConnectionRouter {
    pub policy: Arc<PolicyEngine>,
    pub http: Arc<HttpProxy>,
    pub tcp: Arc<TcpSplicer>,
}

pub struct GatewayListener {
    listener: TcpListener,
    permits: Arc<Semaphore>,
    local_addr: SocketAddr,
}

impl GatewayListener {
    pub async fn bind(addr: &str, max_connections: usize) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| GatewayError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let local_addr = listener.local_addr().map_err(|e| GatewayError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;

        tracing::info!(address = %local_addr, max_connections, "Gateway listening");

        Ok(Self {
            listener,
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop until the close signal fires or the listener
    /// fails permanently. Returning drops the listener and closes the
    /// socket.
    pub async fn run(self, router: Arc<ConnectionRouter>, mut closed: watch::Receiver<bool>) {
        loop {
            if *closed.borrow() {
                break;
            }

            // Backpressure before accept: no permit, no accept.
            let permit = tokio::select! {
                biased;
                _ = closed.changed() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            tokio::select! {
                biased;
                _ = closed.changed() => {
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let router = router.clone();
                        tokio::spawn(async move {
                            let handler = handle_connection(router, stream, remote);
                            if std::panic::AssertUnwindSafe(handler).catch_unwind().await.is_err() {
                                tracing::error!(remote = %remote, "Connection task panicked");
                            }
                            drop(permit);
                        });
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        tracing::warn!(error = %e, "Transient accept error");
                        continue;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Accept failed, stopping listener");
                        break;
                    }
                },
            }
        }
        tracing::info!("Listener closed, exiting accept loop");
    }
}

/// Errors worth retrying the accept loop over. Everything else either
/// means the listener is gone or something is persistently wrong.
fn is_transient_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

async fn handle_connection(router: Arc<ConnectionRouter>, stream: TcpStream, remote: SocketAddr) {
    if let Err(reason) = router.policy.check_connection(remote) {
        tracing::warn!(remote = %remote, reason = %reason, "Connection rejected");
        router
            .policy
            .audit_tcp(remote, "", false, &reason.to_string());
        return;
    }

    let (protocol, sniffed) = SniffedStream::sniff(stream).await;
    let label = protocol.label();
    metrics::inc_active_connections(label);

    match protocol {
        Protocol::Http => {
            tracing::debug!(remote = %remote, "Dispatching HTTP connection");
            router.http.clone().serve(sniffed, remote).await;
        }
        Protocol::OpaqueTcp => {
            tracing::debug!(remote = %remote, "Dispatching TCP connection");
            router.tcp.splice(sniffed, remote).await;
        }
        Protocol::Tls => {
            // No TLS termination at this layer; the deployment fronts
            // TLS elsewhere.
            tracing::warn!(remote = %remote, "TLS connection not supported, closing");
        }
        Protocol::Unknown => {
            tracing::debug!(remote = %remote, "Unclassifiable connection, closing");
        }
    }

    metrics::dec_active_connections(label);
}
