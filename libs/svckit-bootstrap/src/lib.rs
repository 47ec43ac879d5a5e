//! Host-side plumbing for the broker: layered configuration, logging setup
//! and shutdown signals.

pub mod config;
pub mod logging;
pub mod signals;

pub use config::*;
pub use logging::*;
pub use signals::*;
