//! Process lifecycle: startup, drain mode, ordered shutdown.

pub mod server;
pub mod signals;

pub use server::Server;
pub use signals::shutdown_signal;
