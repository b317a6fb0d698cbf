//! Upstream health observation.

pub mod upstream;

pub use upstream::UpstreamHealthChecker;
