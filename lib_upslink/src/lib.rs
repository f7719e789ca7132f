//! # lib_upslink
//!
//! Client library and monitoring core for network-attached UPS status
//! servers: the line-oriented request/response protocol (with optional
//! TLS upgrade), per-UPS state tracking, and the power-budget shutdown
//! coordination used by the `monitor_ups` daemon.

// Declare the modules to re-export
pub mod client;
pub mod configs;
pub mod monitor;

// Re-export the surface the daemon binaries actually use
pub use client::{ClientError, ConnectFlags, ServerError, Session, TlsPolicy, UpsIdentity};
pub use configs::{ConfigError, MonitorConfig, ShutdownExit};
pub use monitor::{debug_level, Monitor, NotifyEvent, SignalFlags};
