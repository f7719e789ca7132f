//! Typed configuration for the monitor daemon.

pub mod monitor_conf;

pub use monitor_conf::{ConfigError, MonitorConfig, MonitorDirective, ShutdownExit};
