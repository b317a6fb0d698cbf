//! Security policy: admission decisions, hot reload, audit.

pub mod audit;
pub mod engine;
pub mod rate_limit;

use axum::http::StatusCode;

pub use audit::AuditLog;
pub use engine::{PolicyEngine, PolicySnapshot};
pub use rate_limit::RateLimiter;

/// Why an admission decision denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// Source IP is on the deny list.
    BlockedIp(String),

    /// Token bucket empty.
    RateLimitExceeded,

    /// Request matched a WAF pattern.
    PatternMatch(String),

    /// Auth enabled and no subject could be extracted.
    MissingSubject,

    /// Subject extracted but not in the allow list.
    SubjectNotAllowed(String),
}

impl DenyReason {
    /// HTTP status for denials surfaced on the HTTP path. TCP denials
    /// close the connection instead.
    pub fn http_status(&self) -> StatusCode {
        match self {
            DenyReason::MissingSubject | DenyReason::SubjectNotAllowed(_) => {
                StatusCode::UNAUTHORIZED
            }
            DenyReason::BlockedIp(_) | DenyReason::PatternMatch(_) => StatusCode::FORBIDDEN,
            DenyReason::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// Label used on the security-block counter.
    pub fn metric_label(&self) -> &'static str {
        match self {
            DenyReason::BlockedIp(_) => "waf_blocked_ip",
            DenyReason::RateLimitExceeded => "rate_limit",
            DenyReason::PatternMatch(_) => "waf_pattern_match",
            DenyReason::MissingSubject => "auth_missing_subject",
            DenyReason::SubjectNotAllowed(_) => "auth_unauthorized",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::BlockedIp(ip) => write!(f, "blocked IP: {}", ip),
            DenyReason::RateLimitExceeded => write!(f, "rate limit exceeded"),
            DenyReason::PatternMatch(pattern) => write!(f, "blocked by pattern {}", pattern),
            DenyReason::MissingSubject => write!(f, "client subject missing"),
            DenyReason::SubjectNotAllowed(subject) => {
                write!(f, "subject {} not allowed", subject)
            }
        }
    }
}
