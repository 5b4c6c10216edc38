//! Logging infrastructure for Keel
//!
//! Library crates log through the `log` facade; this crate installs a
//! `tracing-subscriber` that receives those records along with native
//! `tracing` events.

pub mod config;
pub mod init;

// Re-export main types for convenience
pub use config::{ConfigError, LogFormat, LogLevel, LoggingConfig};
pub use init::{init_logging, init_simple_tracing};
