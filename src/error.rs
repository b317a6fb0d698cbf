//! Top-level error taxonomy.
//!
//! Only startup-class errors reach the process boundary; everything on
//! the data path is recovered locally (denials become statuses or
//! closed connections, transport errors close the affected session).

use thiserror::Error;

use crate::config::store::StoreError;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Business/security config could not be obtained.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Listener or metrics server could not bind.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Upstream URL (or another configured value) is malformed.
    #[error("invalid upstream configuration: {0}")]
    InvalidUpstream(String),

    /// Metrics recorder could not be installed.
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}
