//! Security audit log.
//!
//! One JSON line per admission outcome, written to a single append-only
//! sink. Writes are best-effort: a failing sink warns and never blocks
//! the data path.

use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};

use crate::config::schema::AuditConfig;
use crate::policy::DenyReason;

pub struct AuditLog {
    sink: Option<Mutex<Box<dyn Write + Send>>>,
}

impl AuditLog {
    /// Build the sink from configuration. `stdout`, `stderr`, and
    /// `file://<path>` are understood; anything else falls back to
    /// stdout with a warning, and an unopenable file does the same.
    pub fn from_config(cfg: &AuditConfig) -> Self {
        if !cfg.enabled {
            return Self::disabled();
        }

        let sink: Box<dyn Write + Send> = match cfg.sink.as_str() {
            "" | "stdout" => Box::new(std::io::stdout()),
            "stderr" => Box::new(std::io::stderr()),
            other => {
                if let Some(path) = other.strip_prefix("file://") {
                    match open_audit_file(path) {
                        Ok(file) => Box::new(file),
                        Err(e) => {
                            tracing::warn!(path, error = %e, "Failed to open audit log file, falling back to stdout");
                            Box::new(std::io::stdout())
                        }
                    }
                } else {
                    tracing::warn!(sink = other, "Unknown audit sink, falling back to stdout");
                    Box::new(std::io::stdout())
                }
            }
        };

        Self {
            sink: Some(Mutex::new(sink)),
        }
    }

    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// Record one HTTP exchange outcome.
    pub fn http(
        &self,
        remote: SocketAddr,
        method: &str,
        path: &str,
        status: u16,
        duration: Duration,
        deny: Option<&DenyReason>,
    ) {
        let entry = serde_json::json!({
            "ts": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            "protocol": "http",
            "remote_addr": remote.to_string(),
            "method": method,
            "path": path,
            "status": status,
            "action": if deny.is_some() { "deny" } else { "allow" },
            "duration_ms": duration.as_millis() as u64,
            "detail": deny.map(|r| r.to_string()).unwrap_or_default(),
        });
        self.write_line(&entry);
    }

    /// Record one TCP session outcome.
    pub fn tcp(&self, remote: SocketAddr, backend: &str, allowed: bool, detail: &str) {
        let entry = serde_json::json!({
            "ts": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            "protocol": "tcp",
            "remote_addr": remote.to_string(),
            "backend": backend,
            "action": if allowed { "allow" } else { "deny" },
            "detail": detail,
        });
        self.write_line(&entry);
    }

    fn write_line(&self, entry: &serde_json::Value) {
        let Some(sink) = &self.sink else { return };
        let mut sink = match sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(sink, "{}", entry) {
            tracing::warn!(error = %e, "Failed to write audit log");
        }
    }
}

fn open_audit_file(path: &str) -> std::io::Result<std::fs::File> {
    if let Some(dir) = Path::new(path).parent() {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_log_is_silent() {
        let log = AuditLog::disabled();
        let addr: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        log.http(addr, "GET", "/x", 200, Duration::from_millis(1), None);
        log.tcp(addr, "backend:1", true, "");
    }

    #[test]
    fn file_sink_appends_json_lines() {
        let dir = std::env::temp_dir().join("gateway-audit-test");
        let path = dir.join("audit.log");
        let _ = std::fs::remove_file(&path);

        let log = AuditLog::from_config(&AuditConfig {
            enabled: true,
            sink: format!("file://{}", path.display()),
        });
        let addr: SocketAddr = "10.0.0.9:5555".parse().unwrap();
        log.http(
            addr,
            "GET",
            "/healthz",
            200,
            Duration::from_millis(3),
            None,
        );
        log.tcp(addr, "game:9621", false, "blocked IP: 10.0.0.9");

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["protocol"], "http");
        assert_eq!(first["action"], "allow");
        assert_eq!(first["status"], 200);

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["protocol"], "tcp");
        assert_eq!(second["action"], "deny");
        assert_eq!(second["detail"], "blocked IP: 10.0.0.9");
    }
}
