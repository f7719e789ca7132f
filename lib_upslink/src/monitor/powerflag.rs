//! # Power-Down Flag File
//!
//! When the monitor triggers a shutdown it drops a marker file so an
//! early-boot script can tell "that reboot was a power event - ask the
//! UPS to cut its output once the OS halts". The file carries a fixed
//! magic string, and the monitor only ever deletes a file whose contents
//! match it: a misconfigured path pointing at something important must
//! not be trashed.

use std::path::Path;

/// Required contents of the flag file.
pub const SHUTDOWN_MAGIC: &str = "upsmon-shutdown-file";

/// What the flag file currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagStatus {
    /// No path configured, or no file there.
    Absent,
    /// Exists and carries the magic string.
    Ours,
    /// Exists but holds something else entirely.
    Foreign,
}

/// Inspect the flag file.
pub fn status(path: Option<&Path>) -> FlagStatus {
    let Some(path) = path else {
        return FlagStatus::Absent;
    };

    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return FlagStatus::Absent,
        Err(e) => {
            log::error!("'{}' exists, but we can't read from it: {e}", path.display());
            return FlagStatus::Foreign;
        }
    };

    if contents.starts_with(SHUTDOWN_MAGIC) {
        FlagStatus::Ours
    } else {
        FlagStatus::Foreign
    }
}

/// Create the flag file. Called on the way down, so a failure is only
/// logged - there is nothing better to do at that point.
pub fn set(path: Option<&Path>) {
    let Some(path) = path else { return };

    if let Err(e) = std::fs::write(path, SHUTDOWN_MAGIC) {
        log::error!("Failed to create power down flag at {}: {e}", path.display());
    }
}

/// Remove a stale flag from a previous shutdown, but only if it is
/// really ours. Returns false when the path holds foreign content and
/// should be treated as unusable for the rest of this run.
pub fn clear(path: Option<&Path>) -> bool {
    match status(path) {
        FlagStatus::Absent => true,
        FlagStatus::Ours => {
            if let Some(path) = path {
                if let Err(e) = std::fs::remove_file(path) {
                    log::error!("Failed to remove power down flag {}: {e}", path.display());
                }
            }
            true
        }
        FlagStatus::Foreign => {
            if let Some(path) = path {
                log::error!(
                    "POWERDOWNFLAG ({}) does not contain the shutdown magic string - disabling!",
                    path.display()
                );
            }
            false
        }
    }
}

/// The `-K` probe: exit code 0 iff the flag exists and is ours.
pub fn check(path: Option<&Path>) -> i32 {
    match status(path) {
        FlagStatus::Ours => {
            log::info!("Power down flag is set");
            0
        }
        FlagStatus::Absent => {
            log::error!("Power down flag is not set");
            1
        }
        FlagStatus::Foreign => {
            if let Some(path) = path {
                log::error!(
                    "POWERDOWNFLAG ({}) does not contain the shutdown magic string",
                    path.display()
                );
            }
            1
        }
    }
}
