//! Gateway server: owns the listener, the draining flag, the metrics
//! endpoint, and the ordered shutdown sequence.
//!
//! The drain state machine has two states:
//!
//! ```text
//! Running  --SIGTERM/SIGINT-->  Draining  --timers+join-->  Exited
//! ```
//!
//! While draining, readiness reports 503 immediately, the listener
//! closes after the orchestrator has had time to deregister the
//! endpoint, in-flight sessions keep running for the remainder of the
//! shutdown budget, and the metrics endpoint answers probes the whole
//! way down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tower_http::trace::TraceLayer;

use crate::config::schema::{BusinessConfig, InfraConfig, LifecycleConfig};
use crate::config::store::ConfigStore;
use crate::ebpf::SockmapRedirector;
use crate::error::GatewayError;
use crate::health::UpstreamHealthChecker;
use crate::net::{ConnectionRouter, GatewayListener};
use crate::policy::PolicyEngine;
use crate::proxy::{HttpProxy, TcpSplicer};

const METRICS_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Server {
    lifecycle: LifecycleConfig,
    draining: Arc<AtomicBool>,
    close_tx: watch::Sender<bool>,
    metrics_close_tx: Option<watch::Sender<bool>>,
    listener_task: JoinHandle<()>,
    metrics_task: Option<JoinHandle<()>>,
    background_tasks: Vec<JoinHandle<()>>,
    store: Option<Arc<ConfigStore>>,
    local_addr: SocketAddr,
    metrics_addr: Option<SocketAddr>,
}

impl Server {
    /// Bind everything and start serving. Dependencies are passed in
    /// explicitly (policy engine, store, sockmap, metrics handle) so
    /// tests can inject doubles.
    pub async fn start(
        business: BusinessConfig,
        infra: &InfraConfig,
        policy: Arc<PolicyEngine>,
        store: Option<Arc<ConfigStore>>,
        sockmap: Arc<SockmapRedirector>,
        prometheus: Option<PrometheusHandle>,
    ) -> Result<Self, GatewayError> {
        let gateway_id = format!("gw-{}", uuid::Uuid::new_v4());
        tracing::info!(gateway_id = %gateway_id, "Starting gateway");

        let draining = Arc::new(AtomicBool::new(false));
        let (close_tx, close_rx) = watch::channel(false);

        // Metrics/probe server first: probes must answer from the very
        // start and keep answering through the drain window.
        let mut metrics_close_tx = None;
        let mut metrics_task = None;
        let mut metrics_addr = None;
        if infra.metrics.enabled {
            let listener = tokio::net::TcpListener::bind(&infra.metrics.listen_addr)
                .await
                .map_err(|e| GatewayError::Bind {
                    addr: infra.metrics.listen_addr.clone(),
                    source: e,
                })?;
            let addr = listener.local_addr().map_err(|e| GatewayError::Bind {
                addr: infra.metrics.listen_addr.clone(),
                source: e,
            })?;
            metrics_addr = Some(addr);

            let router = metrics_router(ProbeState {
                draining: draining.clone(),
                store: store.clone(),
                prometheus,
            });
            let (tx, mut rx) = watch::channel(false);
            metrics_close_tx = Some(tx);
            metrics_task = Some(tokio::spawn(async move {
                tracing::info!(address = %addr, "Metrics server listening");
                let result = axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        let _ = rx.changed().await;
                    })
                    .await;
                if let Err(e) = result {
                    tracing::error!(error = %e, "Metrics server error");
                }
            }));
        }

        let http = Arc::new(HttpProxy::new(
            &business.http_upstream,
            policy.clone(),
            &gateway_id,
        )?);
        let tcp = Arc::new(TcpSplicer::new(
            &business.tcp_upstream,
            policy.clone(),
            sockmap,
        ));
        let router = Arc::new(ConnectionRouter {
            policy: policy.clone(),
            http,
            tcp,
        });

        let listener = GatewayListener::bind(&business.listen_addr, business.max_connections).await?;
        let local_addr = listener.local_addr();
        let listener_task = tokio::spawn(listener.run(router, close_rx.clone()));

        let mut background_tasks = Vec::new();

        let checker = UpstreamHealthChecker::new(&business);
        background_tasks.push(tokio::spawn(checker.run(close_rx.clone())));

        if let Some(store) = &store {
            let updates = store.subscribe_updates();
            background_tasks.push(tokio::spawn(policy.clone().run_reload_loop(
                store.clone(),
                updates,
                close_rx.clone(),
            )));
        }

        Ok(Self {
            lifecycle: business.lifecycle,
            draining,
            close_tx,
            metrics_close_tx,
            listener_task,
            metrics_task,
            background_tasks,
            store,
            local_addr,
            metrics_addr,
        })
    }

    /// Address the gateway listener actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address the metrics server bound to, when enabled.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Execute the drain sequence. Ordering matters:
    /// 1. flip the draining flag (readiness observes it immediately)
    /// 2. wait for the orchestrator to deregister the endpoint
    /// 3. close the listener
    /// 4. sleep out the remaining shutdown budget for in-flight work
    /// 5. stop the metrics server (bounded)
    /// 6. join background tasks
    /// 7. release the store client
    ///
    /// In-flight sessions are never cancelled here; anything outliving
    /// the budget is the orchestrator's to kill.
    pub async fn graceful_shutdown(self) {
        tracing::info!("Entering drain mode");
        self.draining.store(true, Ordering::SeqCst);

        let total = self.lifecycle.shutdown_timeout;
        let endpoint_wait = if total < Duration::from_secs(10) {
            Duration::from_secs(2).min(self.lifecycle.drain_wait)
        } else {
            self.lifecycle.drain_wait
        };
        tracing::info!(wait = ?endpoint_wait, "Waiting for endpoint deregistration");
        sleep(endpoint_wait).await;

        let _ = self.close_tx.send(true);
        let _ = self.listener_task.await;

        let remaining = total.saturating_sub(endpoint_wait);
        if !remaining.is_zero() {
            tracing::info!(timeout = ?remaining, "Waiting for in-flight sessions to drain");
            sleep(remaining).await;
        }

        if let Some(tx) = self.metrics_close_tx {
            tracing::info!("Shutting down metrics server");
            let _ = tx.send(true);
        }
        if let Some(task) = self.metrics_task {
            if timeout(METRICS_SHUTDOWN_TIMEOUT, task).await.is_err() {
                tracing::warn!("Metrics server did not stop within the grace period");
            }
        }

        for task in self.background_tasks {
            let _ = task.await;
        }

        drop(self.store);
        tracing::info!("Shutdown complete");
    }
}

#[derive(Clone)]
struct ProbeState {
    draining: Arc<AtomicBool>,
    store: Option<Arc<ConfigStore>>,
    prometheus: Option<PrometheusHandle>,
}

fn metrics_router(state: ProbeState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn metrics_handler(State(state): State<ProbeState>) -> String {
    state
        .prometheus
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default()
}

async fn health_handler() -> &'static str {
    "OK"
}

/// Ready only when not draining AND the config store (if configured)
/// answers. A lost store makes the instance not-ready without killing
/// it; liveness stays green.
async fn ready_handler(State(state): State<ProbeState>) -> (StatusCode, String) {
    if state.draining.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "Draining".to_string());
    }
    if let Some(store) = &state.store {
        if let Err(e) = store.health().await {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Redis Unavailable: {}", e),
            );
        }
    }
    (StatusCode::OK, "Ready".to_string())
}
