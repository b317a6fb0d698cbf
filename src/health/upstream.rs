//! Periodic upstream health probing.
//!
//! Purely observational: results feed the `gateway_upstream_health`
//! gauge and the log, never the readiness probe. Readiness stays tied
//! to drain state and store reachability only.

use std::collections::HashMap;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::config::schema::BusinessConfig;
use crate::observability::metrics;

const PROBE_INTERVAL: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct UpstreamHealthChecker {
    http_url: String,
    tcp_addr: String,
    client: Option<reqwest::Client>,
    health: HashMap<String, bool>,
}

impl UpstreamHealthChecker {
    pub fn new(business: &BusinessConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| tracing::warn!(error = %e, "HTTP probe client unavailable"))
            .ok();
        Self {
            http_url: business.http_upstream.target_url.clone(),
            tcp_addr: business.tcp_upstream.target_addr.clone(),
            client,
            health: HashMap::new(),
        }
    }

    /// Probe until the stop signal fires.
    pub async fn run(mut self, mut stopped: watch::Receiver<bool>) {
        tracing::info!(interval = ?PROBE_INTERVAL, "Upstream health checker started");
        let mut ticker = tokio::time::interval(PROBE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_all().await,
                _ = stopped.changed() => break,
            }
        }
        tracing::info!("Upstream health checker stopped");
    }

    async fn check_all(&mut self) {
        if !self.http_url.is_empty() {
            let url = self.http_url.clone();
            let healthy = self.check_http().await;
            self.update(&url, healthy);
        }
        if !self.tcp_addr.is_empty() {
            let addr = self.tcp_addr.clone();
            let healthy = check_tcp(&addr).await;
            self.update(&addr, healthy);
        }
    }

    async fn check_http(&self) -> bool {
        let Some(client) = &self.client else {
            return false;
        };
        match client.get(&self.http_url).send().await {
            Ok(response) => {
                let healthy = response.status().is_success() || response.status().is_redirection();
                if !healthy {
                    tracing::debug!(upstream = %self.http_url, status = %response.status(), "HTTP upstream unhealthy status");
                }
                healthy
            }
            Err(e) => {
                tracing::debug!(upstream = %self.http_url, error = %e, "HTTP upstream probe failed");
                false
            }
        }
    }

    fn update(&mut self, upstream: &str, healthy: bool) {
        let previous = self.health.insert(upstream.to_string(), healthy);
        metrics::set_upstream_health(upstream, healthy);
        if previous != Some(healthy) {
            if healthy {
                tracing::info!(upstream, "Upstream is healthy");
            } else {
                tracing::warn!(upstream, "Upstream is unhealthy");
            }
        }
    }
}

async fn check_tcp(addr: &str) -> bool {
    match timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::debug!(upstream = %addr, error = %e, "TCP upstream probe failed");
            false
        }
        Err(_) => {
            tracing::debug!(upstream = %addr, "TCP upstream probe timed out");
            false
        }
    }
}
