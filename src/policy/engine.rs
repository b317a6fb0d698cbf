//! Policy engine: holds the live security policy and evaluates
//! per-connection and per-request admission.
//!
//! The policy is a value, not a graph of shared mutable state: readers
//! load an immutable snapshot for the duration of one decision and
//! writers replace the whole snapshot. The rate-limit bucket is the one
//! piece of genuinely mutable state and sits behind a coarse mutex;
//! contention there is bounded by the configured rate.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::http::Request;
use regex::Regex;
use tokio::sync::{mpsc, watch};

use crate::config::schema::SecurityPolicy;
use crate::config::store::{ConfigStore, PolicyUpdate};
use crate::observability::metrics;
use crate::policy::audit::AuditLog;
use crate::policy::rate_limit::RateLimiter;
use crate::policy::DenyReason;

/// Immutable view of the policy as seen by one admission decision.
#[derive(Debug, Default)]
pub struct PolicySnapshot {
    pub auth_enabled: bool,
    pub header_subject: String,
    pub allowed_subjects: HashSet<String>,

    pub waf_enabled: bool,
    pub blocked_ips: HashSet<IpAddr>,
    pub blocked_patterns: Vec<Regex>,
}

pub struct PolicyEngine {
    snapshot: ArcSwap<PolicySnapshot>,
    limiter: Mutex<Option<RateLimiter>>,
    audit: AuditLog,
}

impl PolicyEngine {
    pub fn new(audit: AuditLog) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(PolicySnapshot {
                header_subject: "X-Client-Subject".to_string(),
                ..PolicySnapshot::default()
            }),
            limiter: Mutex::new(None),
            audit,
        }
    }

    /// Apply a full policy as loaded from the store. Every section is
    /// replaced; empty sets clear their lists.
    pub fn apply(&self, policy: &SecurityPolicy) {
        self.set_auth(policy.auth.enabled, Some(policy.auth.header_subject.clone()));
        self.replace_allowed_subjects(&policy.auth.allowed_subjects);

        if policy.rate_limit.enabled && policy.rate_limit.requests_per_second > 0.0 {
            self.replace_rate_limit(policy.rate_limit.requests_per_second, policy.rate_limit.burst);
        } else {
            self.disable_rate_limit();
        }

        self.set_waf_enabled(policy.waf.enabled);
        self.replace_blocked_ips(&policy.waf.blocked_ips);
        self.replace_blocked_patterns(&policy.waf.blocked_patterns);
    }

    /// Per-connection admission, called once before dispatch.
    ///
    /// IP deny is checked first and does not consume a rate-limit token.
    pub fn check_connection(&self, remote: SocketAddr) -> Result<(), DenyReason> {
        let snapshot = self.snapshot.load();
        if snapshot.waf_enabled && snapshot.blocked_ips.contains(&remote.ip()) {
            let reason = DenyReason::BlockedIp(remote.ip().to_string());
            metrics::record_security_block(reason.metric_label());
            return Err(reason);
        }

        let mut limiter = self.limiter.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(limiter) = limiter.as_mut() {
            if !limiter.allow() {
                metrics::record_security_block(DenyReason::RateLimitExceeded.metric_label());
                return Err(DenyReason::RateLimitExceeded);
            }
        }

        Ok(())
    }

    /// Per-request authentication. The subject comes from the configured
    /// header; the gateway terminates no TLS so there is never a peer
    /// certificate to read.
    pub fn authorize_http<B>(&self, req: &Request<B>) -> Result<(), DenyReason> {
        let snapshot = self.snapshot.load();
        if !snapshot.auth_enabled {
            return Ok(());
        }

        let subject = req
            .headers()
            .get(snapshot.header_subject.as_str())
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if subject.is_empty() {
            metrics::record_security_block(DenyReason::MissingSubject.metric_label());
            return Err(DenyReason::MissingSubject);
        }

        if snapshot.allowed_subjects.is_empty() {
            return Ok(());
        }
        if !snapshot.allowed_subjects.contains(subject) {
            let reason = DenyReason::SubjectNotAllowed(subject.to_string());
            metrics::record_security_block(reason.metric_label());
            return Err(reason);
        }
        Ok(())
    }

    /// Per-request WAF evaluation over `path + "?" + raw_query`.
    ///
    /// The IP is re-checked here in case the connection-level check was
    /// skipped; the rate-limit bucket is NOT consulted again, so an HTTP
    /// request never double-spends tokens.
    pub fn apply_waf<B>(&self, req: &Request<B>, remote_ip: IpAddr) -> Result<(), DenyReason> {
        let snapshot = self.snapshot.load();
        if !snapshot.waf_enabled {
            return Ok(());
        }

        if snapshot.blocked_ips.contains(&remote_ip) {
            let reason = DenyReason::BlockedIp(remote_ip.to_string());
            metrics::record_security_block(reason.metric_label());
            return Err(reason);
        }

        if snapshot.blocked_patterns.is_empty() {
            return Ok(());
        }
        let payload = match req.uri().query() {
            Some(query) => format!("{}?{}", req.uri().path(), query),
            None => req.uri().path().to_string(),
        };
        for pattern in &snapshot.blocked_patterns {
            if pattern.is_match(&payload) {
                let reason = DenyReason::PatternMatch(pattern.as_str().to_string());
                metrics::record_security_block(reason.metric_label());
                return Err(reason);
            }
        }
        Ok(())
    }

    pub fn audit_http(
        &self,
        remote: SocketAddr,
        method: &str,
        path: &str,
        status: u16,
        duration: Duration,
        deny: Option<&DenyReason>,
    ) {
        self.audit.http(remote, method, path, status, duration, deny);
    }

    pub fn audit_tcp(&self, remote: SocketAddr, backend: &str, allowed: bool, detail: &str) {
        self.audit.tcp(remote, backend, allowed, detail);
    }

    /// Replace the rate limiter. Non-positive parameters disable it.
    pub fn replace_rate_limit(&self, requests_per_second: f64, burst: u32) {
        let next = RateLimiter::new(requests_per_second, burst);
        let disabled = next.is_none();
        *self.limiter.lock().unwrap_or_else(|e| e.into_inner()) = next;
        if disabled {
            tracing::info!("Rate limiting disabled");
        } else {
            tracing::info!(rps = requests_per_second, burst, "Rate limiter updated");
        }
    }

    pub fn disable_rate_limit(&self) {
        *self.limiter.lock().unwrap_or_else(|e| e.into_inner()) = None;
        tracing::info!("Rate limiting disabled");
    }

    pub fn set_auth(&self, enabled: bool, header_subject: Option<String>) {
        self.mutate(|s| {
            s.auth_enabled = enabled;
            if let Some(header) = &header_subject {
                if !header.is_empty() {
                    s.header_subject = header.clone();
                }
            }
        });
    }

    pub fn set_waf_enabled(&self, enabled: bool) {
        self.mutate(|s| s.waf_enabled = enabled);
    }

    /// Replace the IP deny list. Unparsable entries are dropped with a
    /// warning.
    pub fn replace_blocked_ips(&self, ips: &[String]) {
        let mut parsed = HashSet::with_capacity(ips.len());
        for ip in ips {
            if ip.is_empty() {
                continue;
            }
            match ip.parse::<IpAddr>() {
                Ok(addr) => {
                    parsed.insert(addr);
                }
                Err(e) => tracing::warn!(ip = %ip, error = %e, "Invalid blocked IP, skipping"),
            }
        }
        let count = parsed.len();
        self.mutate(|s| s.blocked_ips = parsed.clone());
        tracing::info!(count, "Blocked IPs updated");
    }

    /// Replace the WAF pattern list. Patterns that fail to compile are
    /// dropped with a warning and never block the load.
    pub fn replace_blocked_patterns(&self, patterns: &[String]) {
        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            if pattern.is_empty() {
                continue;
            }
            match Regex::new(pattern) {
                Ok(re) => compiled.push(re),
                Err(e) => tracing::warn!(pattern = %pattern, error = %e, "Invalid WAF pattern, skipping"),
            }
        }
        let count = compiled.len();
        self.mutate(|s| s.blocked_patterns = compiled.clone());
        tracing::info!(count, "Blocked patterns updated");
    }

    pub fn replace_allowed_subjects(&self, subjects: &[String]) {
        let parsed: HashSet<String> = subjects
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();
        let count = parsed.len();
        self.mutate(|s| s.allowed_subjects = parsed.clone());
        tracing::info!(count, "Allowed subjects updated");
    }

    /// Current snapshot, for probes and tests.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.snapshot.load_full()
    }

    /// Consume update hints and reload the full security policy on each
    /// one. Reload-all is simpler than diff-apply and bounds staleness.
    /// A failed reload keeps the last-known policy in place.
    pub async fn run_reload_loop(
        self: Arc<Self>,
        store: Arc<ConfigStore>,
        mut updates: mpsc::Receiver<PolicyUpdate>,
        mut closed: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = closed.changed() => break,
                update = updates.recv() => match update {
                    Some(update) => {
                        tracing::info!(kind = %update.kind, "Config update received, reloading security policy");
                        let policy = store.load_security().await;
                        self.apply(&policy);
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("Policy reload loop stopped");
    }

    fn mutate(&self, f: impl Fn(&mut PolicySnapshot)) {
        self.snapshot.rcu(|current| {
            let mut next = PolicySnapshot {
                auth_enabled: current.auth_enabled,
                header_subject: current.header_subject.clone(),
                allowed_subjects: current.allowed_subjects.clone(),
                waf_enabled: current.waf_enabled,
                blocked_ips: current.blocked_ips.clone(),
                blocked_patterns: current.blocked_patterns.clone(),
            };
            f(&mut next);
            next
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn engine() -> PolicyEngine {
        PolicyEngine::new(AuditLog::disabled())
    }

    fn request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn blocked_ip_denies_before_rate_limit() {
        let engine = engine();
        engine.set_waf_enabled(true);
        engine.replace_blocked_ips(&["10.1.2.3".to_string()]);
        engine.replace_rate_limit(1.0, 1);

        let blocked: SocketAddr = "10.1.2.3:40000".parse().unwrap();
        let allowed: SocketAddr = "10.1.2.4:40000".parse().unwrap();

        // The blocked IP must not consume the single token.
        assert_eq!(
            engine.check_connection(blocked),
            Err(DenyReason::BlockedIp("10.1.2.3".to_string()))
        );
        assert_eq!(engine.check_connection(allowed), Ok(()));
        assert_eq!(
            engine.check_connection(allowed),
            Err(DenyReason::RateLimitExceeded)
        );
    }

    #[test]
    fn waf_matches_path_and_query() {
        let engine = engine();
        engine.set_waf_enabled(true);
        engine.replace_blocked_patterns(&[r"(?i)(union.*select)".to_string()]);

        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let bad = request("/x?q=UNION%20SELECT%201");
        let err = engine.apply_waf(&bad, ip).unwrap_err();
        assert!(matches!(err, DenyReason::PatternMatch(_)));

        let fine = request("/x?q=hello");
        assert_eq!(engine.apply_waf(&fine, ip), Ok(()));
    }

    #[test]
    fn invalid_pattern_is_dropped_not_fatal() {
        let engine = engine();
        engine.set_waf_enabled(true);
        engine.replace_blocked_patterns(&["[unclosed".to_string(), "evil".to_string()]);
        assert_eq!(engine.snapshot().blocked_patterns.len(), 1);

        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(engine.apply_waf(&request("/evil"), ip).is_err());
        assert!(engine.apply_waf(&request("/fine"), ip).is_ok());
    }

    #[test]
    fn auth_disabled_allows_everything() {
        let engine = engine();
        assert_eq!(engine.authorize_http(&request("/")), Ok(()));
    }

    #[test]
    fn auth_requires_subject_header() {
        let engine = engine();
        engine.set_auth(true, Some("X-Client-Subject".to_string()));

        assert_eq!(
            engine.authorize_http(&request("/")),
            Err(DenyReason::MissingSubject)
        );

        let with_subject = Request::builder()
            .uri("/")
            .header("X-Client-Subject", "svc-a")
            .body(Body::empty())
            .unwrap();
        // Empty allow list: any non-empty subject passes.
        assert_eq!(engine.authorize_http(&with_subject), Ok(()));

        engine.replace_allowed_subjects(&["svc-b".to_string()]);
        assert_eq!(
            engine.authorize_http(&with_subject),
            Err(DenyReason::SubjectNotAllowed("svc-a".to_string()))
        );
    }

    #[test]
    fn pattern_swap_is_idempotent() {
        let engine = engine();
        engine.set_waf_enabled(true);
        let patterns = vec![r"(?i)select".to_string(), r"\.\./".to_string()];
        let corpus = [
            "/ok",
            "/q?x=select",
            "/a/../b",
            "/SELECT",
            "/nested?q=harmless",
        ];
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        engine.replace_blocked_patterns(&patterns);
        let first: Vec<bool> = corpus
            .iter()
            .map(|uri| engine.apply_waf(&request(uri), ip).is_ok())
            .collect();

        engine.replace_blocked_patterns(&patterns);
        let second: Vec<bool> = corpus
            .iter()
            .map(|uri| engine.apply_waf(&request(uri), ip).is_ok())
            .collect();

        assert_eq!(first, second);
    }

    #[test]
    fn full_apply_replaces_every_section() {
        let engine = engine();
        engine.set_waf_enabled(true);
        engine.replace_blocked_ips(&["10.0.0.1".to_string()]);

        // Re-applying the default policy clears the deny list and
        // disables the WAF.
        engine.apply(&SecurityPolicy::default());
        let snapshot = engine.snapshot();
        assert!(!snapshot.waf_enabled);
        assert!(snapshot.blocked_ips.is_empty());

        let remote: SocketAddr = "10.0.0.1:9999".parse().unwrap();
        assert_eq!(engine.check_connection(remote), Ok(()));
    }
}
