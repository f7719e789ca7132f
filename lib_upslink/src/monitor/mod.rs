//! The monitoring core: per-UPS trackers, the status interpreter and
//! critical evaluator, the notification table, and the shutdown
//! coordinator that drives them all.

pub mod coordinator;
pub mod notify;
pub mod pidfile;
pub mod powerflag;
pub mod privilege;
pub mod signals;
pub mod status;
pub mod tracker;

pub use coordinator::{debug_level, Monitor};
pub use notify::{NotifyEvent, NotifyFlags, NotifyTable};
pub use signals::SignalFlags;
pub use status::Status;
pub use tracker::{Role, Timing, UpsTracker};
