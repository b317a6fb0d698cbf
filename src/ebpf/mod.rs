//! Kernel socket-redirect fast path.
//!
//! When available, established splice sessions are registered in a
//! kernel pair map so a stream-verdict program forwards payload
//! peer-to-peer without surfacing in userspace. The userspace copy
//! loops always run regardless: they flush the sniffed prefix and any
//! traffic the kernel path declines.
//!
//! The facade below is uniform across platforms: on non-Linux targets,
//! or when the `sockmap-accel` feature is off, or when loading fails at
//! runtime, it reports disabled and every call is a no-op. Failure to
//! set up the fast path is never fatal.

#[cfg(all(target_os = "linux", feature = "sockmap-accel"))]
mod sockmap;

use tokio::net::TcpStream;

use crate::config::schema::SockmapConfig;

/// Kernel identities of one spliced socket pair.
#[derive(Debug, Clone, Copy)]
pub struct SocketPair {
    pub client: u64,
    pub upstream: u64,
}

pub struct SockmapRedirector {
    #[cfg(all(target_os = "linux", feature = "sockmap-accel"))]
    inner: Option<sockmap::SockMap>,
}

impl SockmapRedirector {
    /// Attempt to bring up the fast path. Logs a single informational
    /// line either way and degrades silently to userspace-only mode.
    #[cfg(all(target_os = "linux", feature = "sockmap-accel"))]
    pub fn init(cfg: &SockmapConfig) -> Self {
        let Some(object_path) = &cfg.object_path else {
            tracing::info!("SOCKMAP_OBJECT_PATH not set, kernel socket redirect disabled");
            return Self::disabled();
        };
        match sockmap::SockMap::load(object_path, &cfg.cgroup_path) {
            Ok(map) => {
                tracing::info!(object = %object_path, "Kernel socket redirect active");
                Self { inner: Some(map) }
            }
            Err(e) => {
                tracing::info!(error = %e, "Kernel socket redirect unavailable, using userspace relay");
                Self::disabled()
            }
        }
    }

    #[cfg(not(all(target_os = "linux", feature = "sockmap-accel")))]
    pub fn init(_cfg: &SockmapConfig) -> Self {
        tracing::info!("Kernel socket redirect not compiled in, using userspace relay");
        Self::disabled()
    }

    pub fn disabled() -> Self {
        Self {
            #[cfg(all(target_os = "linux", feature = "sockmap-accel"))]
            inner: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        #[cfg(all(target_os = "linux", feature = "sockmap-accel"))]
        {
            self.inner.is_some()
        }
        #[cfg(not(all(target_os = "linux", feature = "sockmap-accel")))]
        {
            false
        }
    }

    /// Register a client/upstream pair for in-kernel forwarding. Returns
    /// the pair's identities on success; `None` means the session runs
    /// userspace-only (disabled fast path or registration failure).
    #[cfg(all(target_os = "linux", feature = "sockmap-accel"))]
    pub fn register_pair(&self, client: &TcpStream, upstream: &TcpStream) -> Option<SocketPair> {
        let map = self.inner.as_ref()?;
        match map.register(client, upstream) {
            Ok(pair) => Some(pair),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to register socket pair, session stays in userspace");
                None
            }
        }
    }

    #[cfg(not(all(target_os = "linux", feature = "sockmap-accel")))]
    pub fn register_pair(&self, _client: &TcpStream, _upstream: &TcpStream) -> Option<SocketPair> {
        None
    }

    /// Remove a registered pair at session teardown.
    #[cfg(all(target_os = "linux", feature = "sockmap-accel"))]
    pub fn unregister_pair(&self, pair: &SocketPair) {
        if let Some(map) = &self.inner {
            map.unregister(pair);
        }
    }

    #[cfg(not(all(target_os = "linux", feature = "sockmap-accel")))]
    pub fn unregister_pair(&self, _pair: &SocketPair) {}
}
