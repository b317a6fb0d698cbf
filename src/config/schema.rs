//! Configuration schema definitions.
//!
//! Configuration is split in two:
//! - Infrastructure configuration comes from environment variables and is
//!   available before anything else starts (metrics, store connection,
//!   audit sink).
//! - Business configuration comes from the external store and has NO
//!   defaults; the gateway refuses to start without it.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Infrastructure configuration, sourced from environment variables.
#[derive(Debug, Clone)]
pub struct InfraConfig {
    /// Metrics/probe server settings.
    pub metrics: MetricsConfig,

    /// External config store connection settings.
    pub redis: RedisConfig,

    /// Audit sink settings.
    pub audit: AuditConfig,

    /// Kernel socket-redirect settings.
    pub sockmap: SockmapConfig,
}

impl InfraConfig {
    /// Read infrastructure configuration from the environment.
    ///
    /// Business configuration (listen address, upstreams, lifecycle
    /// timeouts) is deliberately absent here; it is loaded from the
    /// external store and its absence is fatal.
    pub fn from_env() -> Self {
        Self {
            metrics: MetricsConfig {
                enabled: env_bool("METRICS_ENABLED", true),
                listen_addr: env_str("METRICS_LISTEN_ADDR", "0.0.0.0:9090"),
            },
            redis: RedisConfig {
                addr: env_str("REDIS_ADDR", "localhost:6379"),
                password: env::var("REDIS_PASSWORD").unwrap_or_default(),
                db: env_i64("REDIS_DB", 0),
                key_prefix: env_str("REDIS_KEY_PREFIX", "gateway:"),
            },
            audit: AuditConfig {
                enabled: env_bool("AUDIT_ENABLED", true),
                sink: env_str("AUDIT_SINK", "stdout"),
            },
            sockmap: SockmapConfig {
                object_path: env::var("SOCKMAP_OBJECT_PATH").ok(),
                cgroup_path: env_str("SOCKMAP_CGROUP_PATH", "/sys/fs/cgroup"),
            },
        }
    }
}

/// Metrics/probe server configuration.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

/// External store connection configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub addr: String,
    pub password: String,
    pub db: i64,
    /// Prefix applied to every key and channel (default `gateway:`).
    pub key_prefix: String,
}

/// Audit log sink configuration.
///
/// `sink` is `stdout`, `stderr`, or `file://<path>`.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub enabled: bool,
    pub sink: String,
}

/// Kernel socket-redirect configuration.
#[derive(Debug, Clone)]
pub struct SockmapConfig {
    /// Path to the compiled BPF object. Unset disables the fast path.
    pub object_path: Option<String>,
    pub cgroup_path: String,
}

/// Business configuration, loaded once from the external store.
///
/// The gateway never writes this back; admin tooling owns it.
#[derive(Debug, Clone)]
pub struct BusinessConfig {
    /// Gateway listen address (e.g. "0.0.0.0:8080"). Required.
    pub listen_addr: String,

    /// Maximum concurrent client connections.
    pub max_connections: usize,

    /// HTTP upstream settings. `target_url` required.
    pub http_upstream: HttpUpstream,

    /// TCP upstream settings. `target_addr` required.
    pub tcp_upstream: TcpUpstream,

    /// Shutdown/drain timing.
    pub lifecycle: LifecycleConfig,
}

/// HTTP backend forwarding configuration.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    /// Upstream base URL (e.g. "http://httpproxy:8181").
    pub target_url: String,

    /// Bound on a single upstream request.
    pub timeout: Duration,
}

/// TCP backend forwarding configuration.
#[derive(Debug, Clone)]
pub struct TcpUpstream {
    /// Upstream host:port (e.g. "game-gateway:9621").
    pub target_addr: String,

    /// Bound on the upstream dial.
    pub timeout: Duration,
}

/// Graceful shutdown timing.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Total time budget for the drain sequence.
    pub shutdown_timeout: Duration,

    /// Time to wait for the orchestrator to deregister endpoints before
    /// the listener closes.
    pub drain_wait: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            drain_wait: Duration::from_secs(5),
        }
    }
}

/// Security policy as stored externally. Mutable at runtime via hot
/// reload; every section degrades to its default when the store has no
/// data for it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityPolicy {
    pub auth: AuthPolicy,
    pub rate_limit: RateLimitPolicy,
    pub waf: WafPolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthPolicy {
    pub enabled: bool,

    /// Header consulted for the client subject.
    pub header_subject: String,

    /// Allowed subjects. Empty means any non-empty subject passes.
    pub allowed_subjects: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitPolicy {
    pub enabled: bool,
    pub requests_per_second: f64,
    pub burst: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WafPolicy {
    pub enabled: bool,
    pub blocked_ips: Vec<String>,
    pub blocked_patterns: Vec<String>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            auth: AuthPolicy {
                enabled: false,
                header_subject: "X-Client-Subject".to_string(),
                allowed_subjects: Vec::new(),
            },
            rate_limit: RateLimitPolicy {
                enabled: false,
                requests_per_second: 100.0,
                burst: 200,
            },
            waf: WafPolicy {
                enabled: false,
                blocked_ips: Vec::new(),
                blocked_patterns: Vec::new(),
            },
        }
    }
}

/// Parse a human-readable duration string: `"500ms"`, `"30s"`, `"5m"`, `"1h"`.
///
/// Bare numbers are taken as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (value, unit) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => (&s[..idx], &s[idx..]),
        None => (s, "s"),
    };
    let value: f64 = value.trim().parse().ok()?;
    if value < 0.0 {
        return None;
    }
    let millis = match unit {
        "ms" => value,
        "s" => value * 1_000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        _ => return None,
    };
    Some(Duration::from_millis(millis as u64))
}

/// Parse a stored boolean: `"true"`/`"1"` are true, everything else false.
pub fn parse_bool(s: &str) -> bool {
    matches!(s.trim(), "true" | "1")
}

fn env_str(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) if !v.is_empty() => parse_bool(&v),
        _ => default,
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
    }

    #[test]
    fn rejects_garbage_durations() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("fast"), None);
        assert_eq!(parse_duration("-5s"), None);
        assert_eq!(parse_duration("5d"), None);
    }

    #[test]
    fn parses_stored_booleans() {
        assert!(parse_bool("true"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("yes"));
    }
}
