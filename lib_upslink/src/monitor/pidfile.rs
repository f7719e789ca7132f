//! PID file handling and the `-c fsd|reload|stop` signalling surface
//! for commanding an already-running daemon.

use std::path::{Path, PathBuf};

/// Commands an operator can send to a running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceCommand {
    /// Shut down all primary-mode UPSes (use with caution).
    Fsd,
    /// Reread the configuration file.
    Reload,
    /// Stop monitoring and exit.
    Stop,
}

impl InstanceCommand {
    pub fn parse(word: &str) -> Option<Self> {
        match word {
            "fsd" => Some(Self::Fsd),
            "reload" => Some(Self::Reload),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }

    fn signal(self) -> libc::c_int {
        match self {
            Self::Fsd => libc::SIGUSR1,
            Self::Reload => libc::SIGHUP,
            Self::Stop => libc::SIGTERM,
        }
    }
}

/// Where the PID file lives by default. `/var/run` needs the daemon to
/// start as root, which it normally does; override with `-f`-relative
/// deployments via the `MONITOR_UPS_PIDFILE` environment variable.
pub fn default_path(progname: &str) -> PathBuf {
    if let Ok(path) = std::env::var("MONITOR_UPS_PIDFILE") {
        return PathBuf::from(path);
    }
    PathBuf::from(format!("/var/run/{progname}.pid"))
}

/// Record our PID. Called before privileges are dropped.
pub fn write(path: &Path) -> std::io::Result<()> {
    let pid = std::process::id();
    std::fs::write(path, format!("{pid}\n"))
}

pub fn remove(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::debug!("couldn't remove PID file {}: {e}", path.display());
        }
    }
}

/// Read the PID recorded in the file, if any.
pub fn read(path: &Path) -> Option<libc::pid_t> {
    let text = std::fs::read_to_string(path).ok()?;
    text.trim().parse::<libc::pid_t>().ok()
}

/// Send a command (or, with `None`, just probe liveness) to a specific
/// PID.
pub fn signal_pid(pid: libc::pid_t, cmd: Option<InstanceCommand>) -> std::io::Result<()> {
    let signum = cmd.map(InstanceCommand::signal).unwrap_or(0);
    let ret = unsafe { libc::kill(pid, signum) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Send a command to the instance recorded in the PID file.
pub fn signal_instance(path: &Path, cmd: Option<InstanceCommand>) -> std::io::Result<()> {
    match read(path) {
        Some(pid) => signal_pid(pid, cmd),
        None => Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no PID file at {}", path.display()),
        )),
    }
}

/// True when the PID file points at a live process - i.e. a competing
/// instance is already running.
pub fn instance_running(path: &Path) -> bool {
    signal_instance(path, None).is_ok()
}
