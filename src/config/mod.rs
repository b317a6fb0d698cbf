//! Gateway configuration: environment-sourced infrastructure settings
//! and store-sourced business/security configuration.

pub mod schema;
pub mod store;

pub use schema::{BusinessConfig, InfraConfig, SecurityPolicy};
pub use store::{ConfigStore, PolicyUpdate, StoreError};
