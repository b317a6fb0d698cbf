//! Unified access gateway library.
//!
//! One listener, many protocols: each accepted connection is classified
//! by its first bytes and spliced to the matching upstream under the
//! live security policy.

pub mod config;
pub mod ebpf;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod policy;
pub mod proxy;

pub use config::schema::{BusinessConfig, InfraConfig, SecurityPolicy};
pub use error::GatewayError;
pub use lifecycle::Server;
pub use policy::{AuditLog, PolicyEngine};
