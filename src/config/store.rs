//! External configuration store client.
//!
//! The gateway is strictly READ-ONLY against the store: admin tooling
//! writes configuration, the gateway reads it and subscribes to change
//! notifications. Deny/allow lists live in sets so concurrent admin
//! mutations compose; scalar knobs live in hash fields.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::schema::{parse_bool, parse_duration, BusinessConfig, RedisConfig, SecurityPolicy};
use crate::config::schema::{HttpUpstream, LifecycleConfig, TcpUpstream};

/// Buffered update hints; beyond this, hints are dropped (the consumer
/// reloads everything per hint, so a dropped hint is only staleness
/// until the next one).
const UPDATE_BUFFER: usize = 10;

const SUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Errors from the store client. Only the business-config path is
/// allowed to be fatal to the process.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("config store unreachable: {0}")]
    Unreachable(#[source] RedisError),

    #[error("business config not found at key {0}")]
    NotFound(String),

    #[error("business config missing required field {0}")]
    MissingField(&'static str),

    #[error(transparent)]
    Transport(#[from] RedisError),
}

/// A configuration change notification published on `{prefix}config:changed`.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyUpdate {
    /// What changed ("security", "rate_limit", "waf", ...). The consumer
    /// reloads the full security policy regardless; reload-all bounds
    /// staleness and keeps the consumer trivial.
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Client for the external key-value/pub-sub store.
pub struct ConfigStore {
    client: redis::Client,
    manager: ConnectionManager,
    prefix: String,
}

impl ConfigStore {
    /// Connect and verify reachability with a PING.
    pub async fn connect(cfg: &RedisConfig) -> Result<Self, StoreError> {
        let url = if cfg.password.is_empty() {
            format!("redis://{}/{}", cfg.addr, cfg.db)
        } else {
            format!("redis://:{}@{}/{}", cfg.password, cfg.addr, cfg.db)
        };
        let client = redis::Client::open(url).map_err(StoreError::Unreachable)?;
        let mut manager = client
            .get_connection_manager()
            .await
            .map_err(StoreError::Unreachable)?;

        redis::cmd("PING")
            .query_async::<()>(&mut manager)
            .await
            .map_err(StoreError::Unreachable)?;

        tracing::info!(addr = %cfg.addr, prefix = %cfg.key_prefix, "Config store connected (read-only)");

        Ok(Self {
            client,
            manager,
            prefix: cfg.key_prefix.clone(),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    /// Lightweight reachability probe for the readiness endpoint.
    pub async fn health(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Load business configuration. Missing hash or missing required
    /// fields are errors; the caller treats both as fatal.
    pub async fn load_business(&self) -> Result<BusinessConfig, StoreError> {
        let key = self.key("business:config");
        let mut conn = self.manager.clone();

        let exists: bool = conn.exists(&key).await?;
        if !exists {
            return Err(StoreError::NotFound(key));
        }

        let fields: HashMap<String, String> = conn.hgetall(&key).await?;

        let listen_addr = required(&fields, "server.listen_addr")?;
        let http_url = required(&fields, "backends.http.target_url")?;
        let tcp_addr = required(&fields, "backends.tcp.target_addr")?;

        let lifecycle_defaults = LifecycleConfig::default();
        Ok(BusinessConfig {
            listen_addr,
            max_connections: fields
                .get("server.max_connections")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000),
            http_upstream: HttpUpstream {
                target_url: http_url,
                timeout: duration_field(&fields, "backends.http.timeout", Duration::from_secs(30)),
            },
            tcp_upstream: TcpUpstream {
                target_addr: tcp_addr,
                timeout: duration_field(&fields, "backends.tcp.timeout", Duration::from_secs(5)),
            },
            lifecycle: LifecycleConfig {
                shutdown_timeout: duration_field(
                    &fields,
                    "lifecycle.shutdown_timeout",
                    lifecycle_defaults.shutdown_timeout,
                ),
                drain_wait: duration_field(
                    &fields,
                    "lifecycle.drain_wait_time",
                    lifecycle_defaults.drain_wait,
                ),
            },
        })
    }

    /// Load the security policy. Never fails: any missing key or
    /// transport error degrades the affected section to its default and
    /// logs a warning, leaving the rest intact.
    pub async fn load_security(&self) -> SecurityPolicy {
        let mut conn = self.manager.clone();
        let mut policy = SecurityPolicy::default();

        match conn
            .hgetall::<_, HashMap<String, String>>(self.key("auth:config"))
            .await
        {
            Ok(fields) if !fields.is_empty() => {
                if let Some(v) = fields.get("enabled") {
                    policy.auth.enabled = parse_bool(v);
                }
                if let Some(v) = fields.get("header_subject") {
                    if !v.is_empty() {
                        policy.auth.header_subject = v.clone();
                    }
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to load auth config, using defaults"),
        }

        match conn
            .smembers::<_, Vec<String>>(self.key("auth:allowed_subjects"))
            .await
        {
            Ok(subjects) => policy.auth.allowed_subjects = subjects,
            Err(e) => tracing::warn!(error = %e, "Failed to load allowed subjects, using defaults"),
        }

        match conn
            .hgetall::<_, HashMap<String, String>>(self.key("rate_limit"))
            .await
        {
            Ok(fields) if !fields.is_empty() => {
                if let Some(v) = fields.get("enabled") {
                    policy.rate_limit.enabled = parse_bool(v);
                }
                if let Some(v) = fields.get("rps").and_then(|v| v.parse().ok()) {
                    policy.rate_limit.requests_per_second = v;
                }
                if let Some(v) = fields.get("burst").and_then(|v| v.parse().ok()) {
                    policy.rate_limit.burst = v;
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to load rate limit config, using defaults"),
        }

        match conn
            .hgetall::<_, HashMap<String, String>>(self.key("waf:config"))
            .await
        {
            Ok(fields) if !fields.is_empty() => {
                if let Some(v) = fields.get("enabled") {
                    policy.waf.enabled = parse_bool(v);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to load WAF config, using defaults"),
        }

        match conn
            .smembers::<_, Vec<String>>(self.key("waf:blocked_ips"))
            .await
        {
            Ok(ips) => policy.waf.blocked_ips = ips,
            Err(e) => tracing::warn!(error = %e, "Failed to load blocked IPs, using defaults"),
        }

        match conn
            .smembers::<_, Vec<String>>(self.key("waf:blocked_patterns"))
            .await
        {
            Ok(patterns) => policy.waf.blocked_patterns = patterns,
            Err(e) => tracing::warn!(error = %e, "Failed to load blocked patterns, using defaults"),
        }

        policy
    }

    /// Subscribe to `{prefix}config:changed`.
    ///
    /// A background task owns the pub/sub connection and re-establishes
    /// it with capped exponential backoff when it drops. Hints that
    /// cannot be buffered are discarded with a warning.
    pub fn subscribe_updates(&self) -> mpsc::Receiver<PolicyUpdate> {
        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
        let client = self.client.clone();
        let channel = self.key("config:changed");

        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => match pubsub.subscribe(&channel).await {
                        Ok(()) => {
                            tracing::info!(channel = %channel, "Subscribed to config updates");
                            backoff = Duration::from_secs(1);
                            let mut messages = pubsub.on_message();
                            while let Some(msg) = messages.next().await {
                                let payload: String = match msg.get_payload() {
                                    Ok(p) => p,
                                    Err(e) => {
                                        tracing::warn!(error = %e, "Unreadable config update payload");
                                        continue;
                                    }
                                };
                                let update: PolicyUpdate = match serde_json::from_str(&payload) {
                                    Ok(u) => u,
                                    Err(e) => {
                                        tracing::warn!(error = %e, "Failed to parse config update");
                                        continue;
                                    }
                                };
                                if tx.try_send(update).is_err() {
                                    if tx.is_closed() {
                                        return;
                                    }
                                    tracing::warn!("Config update channel full, dropping update");
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to subscribe to config channel");
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "Config store pub/sub connection failed");
                    }
                }

                if tx.is_closed() {
                    return;
                }
                tracing::warn!(retry_in = ?backoff, "Config update subscription lost, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(SUBSCRIBE_BACKOFF_MAX);
            }
        });

        rx
    }
}

fn required(fields: &HashMap<String, String>, key: &'static str) -> Result<String, StoreError> {
    match fields.get(key) {
        Some(v) if !v.is_empty() => Ok(v.clone()),
        _ => Err(StoreError::MissingField(key)),
    }
}

fn duration_field(fields: &HashMap<String, String>, key: &str, default: Duration) -> Duration {
    match fields.get(key) {
        Some(v) if !v.is_empty() => parse_duration(v).unwrap_or_else(|| {
            tracing::warn!(field = key, value = %v, "Unparsable duration, using default");
            default
        }),
        _ => default,
    }
}
