//! Unified Access Gateway
//!
//! A single-port L4/L7 ingress gateway built on Tokio.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌────────────────────────────────────────────────────┐
//!                      │                 ACCESS GATEWAY                     │
//!                      │                                                    │
//!   Client ───────────▶│  ┌──────────┐   ┌─────────┐   ┌────────────────┐  │
//!   (one TCP port)     │  │ listener │──▶│ sniffer │──▶│ HTTP proxy     │──┼──▶ HTTP upstream
//!                      │  └──────────┘   └────┬────┘   │ (one exchange) │  │
//!                      │        │             │        └────────────────┘  │
//!                      │        ▼             └───────▶┌────────────────┐  │
//!                      │  ┌──────────┐                 │ TCP splicer    │──┼──▶ TCP upstream
//!                      │  │  policy  │                 │ (+ sockmap)    │  │
//!                      │  │  engine  │                 └────────────────┘  │
//!                      │  └────▲─────┘                                     │
//!                      │       │ hot reload (pub/sub)                      │
//!                      │  ┌────┴─────┐   ┌───────────────┐                 │
//!   Admin tools ──────▶│  │  config  │   │ lifecycle     │                 │
//!   (write the store)  │  │  store   │   │ drain/signals │                 │
//!                      │  └──────────┘   └───────────────┘                 │
//!                      └────────────────────────────────────────────────────┘
//! ```
//!
//! Business configuration (listen address, upstreams, timeouts) lives
//! in the external store and is required: the process exits with code 1
//! when it cannot be loaded. Security policy hot-reloads over pub/sub.

use std::process;
use std::sync::Arc;

use access_gateway::config::{ConfigStore, InfraConfig};
use access_gateway::ebpf::SockmapRedirector;
use access_gateway::lifecycle::{shutdown_signal, Server};
use access_gateway::observability::{logging, metrics};
use access_gateway::policy::{AuditLog, PolicyEngine};

#[tokio::main]
async fn main() {
    logging::init();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting access gateway");

    let infra = InfraConfig::from_env();

    let prometheus = if infra.metrics.enabled {
        match metrics::install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "Metrics recorder unavailable, exposition disabled");
                None
            }
        }
    } else {
        None
    };

    // Business config is required: no store, no gateway.
    let store = match ConfigStore::connect(&infra.redis).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "Cannot reach config store, business config unavailable");
            process::exit(1);
        }
    };
    let business = match store.load_business().await {
        Ok(business) => business,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load business config");
            process::exit(1);
        }
    };
    tracing::info!(
        listen = %business.listen_addr,
        http_upstream = %business.http_upstream.target_url,
        tcp_upstream = %business.tcp_upstream.target_addr,
        "Business config loaded"
    );

    let policy = Arc::new(PolicyEngine::new(AuditLog::from_config(&infra.audit)));
    policy.apply(&store.load_security().await);

    let sockmap = Arc::new(SockmapRedirector::init(&infra.sockmap));

    let server = match Server::start(
        business,
        &infra,
        policy,
        Some(store),
        sockmap,
        prometheus,
    )
    .await
    {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start gateway");
            process::exit(1);
        }
    };

    shutdown_signal().await;
    tracing::info!("Shutdown signal received");

    server.graceful_shutdown().await;
    tracing::info!("Server exited");
}
