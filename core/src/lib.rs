//! Cont Core - Foundational Types
//!
//! Error taxonomy, daemon configuration and logging settings shared by the
//! runtime (image acquisition) and the daemon (control plane).

pub mod config;
pub mod error;
pub mod log;

// Re-export commonly used types
pub use config::{DaemonConfig, RegistryConfig, RetryConfig};
pub use error::{ContError, Result};
pub use log::{LogConfig, LogFormat, LogLevel};

/// Cont version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
