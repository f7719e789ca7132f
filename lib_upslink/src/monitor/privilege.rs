//! # Privilege Split
//!
//! The monitor normally runs as two processes: a privileged parent whose
//! only job is to execute the shutdown command, and an unprivileged
//! child running the whole monitoring loop. The one-byte pipe between
//! them is the only shared channel, and it is write-once - the shutdown
//! trigger. The split exists because NOTIFYCMD hooks run from the child
//! and have no business inheriting root.
//!
//! The fork happens before the async runtime starts; the parent never
//! touches tokio.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use super::powerflag;

/// The child's handle on the shutdown pipe.
pub struct ShutdownPipe {
    fd: RawFd,
}

impl ShutdownPipe {
    /// Ask the privileged parent to run the shutdown command.
    pub fn trigger(&self) -> std::io::Result<()> {
        let byte: u8 = 1;
        let ret = unsafe { libc::write(self.fd, (&byte as *const u8).cast(), 1) };
        if ret == 1 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    /// Poll the pipe for trouble. While the parent holds the read end
    /// open there is nothing to report on the write end; an error or
    /// hangup condition means the parent died and a later shutdown
    /// trigger would go nowhere.
    pub fn parent_alive(&self) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
        ret == 0
    }
}

impl Drop for ShutdownPipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
impl ShutdownPipe {
    /// Test constructor around a raw write end.
    pub(crate) fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd }
    }
}

pub fn euid_is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Execute the configured SHUTDOWNCMD through the shell and wait for it.
pub fn run_shutdown_command(cmd: Option<&str>) {
    let Some(cmd) = cmd else {
        log::error!("No shutdown command defined!");
        return;
    };

    match std::process::Command::new("sh").arg("-c").arg(cmd).status() {
        Ok(status) if status.success() => {}
        Ok(status) => log::error!("Unable to call shutdown command: {cmd} ({status})"),
        Err(e) => log::error!("Unable to call shutdown command: {cmd} ({e})"),
    }
}

/// Become `user`: resolve the account, then drop group and user ids.
/// A no-op when we are not root to begin with.
pub fn drop_privileges(user: &str) -> std::io::Result<()> {
    if !euid_is_root() {
        log::debug!("not root, no privileges to drop");
        return Ok(());
    }

    let cname = CString::new(user)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad user name"))?;

    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pw.is_null() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("user {user} not found"),
        ));
    }

    let (uid, gid) = unsafe { ((*pw).pw_uid, (*pw).pw_gid) };

    if unsafe { libc::setgid(gid) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::initgroups(cname.as_ptr(), gid) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::setuid(uid) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    log::debug!("dropped privileges to user {user}");
    Ok(())
}

/// Fire up the split parent/child scheme.
///
/// Returns the pipe handle in the (unprivileged) child. The parent
/// never returns: it blocks on the pipe, and once the shutdown byte
/// arrives it writes the power-down flag, runs SHUTDOWNCMD, and exits.
pub fn start_split(
    shutdowncmd: Option<String>,
    powerdownflag: Option<PathBuf>,
) -> std::io::Result<ShutdownPipe> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(std::io::Error::last_os_error());
    }

    if pid != 0 {
        // privileged parent
        unsafe {
            libc::close(fds[1]);
        }
        run_parent(fds[0], shutdowncmd, powerdownflag);
    }

    // unprivileged child: keep the write end, but never leak it to
    // NOTIFYCMD subprocesses
    unsafe {
        libc::close(fds[0]);
        libc::fcntl(fds[1], libc::F_SETFD, libc::FD_CLOEXEC);
    }

    Ok(ShutdownPipe { fd: fds[1] })
}

fn run_parent(fd: RawFd, shutdowncmd: Option<String>, powerdownflag: Option<PathBuf>) -> ! {
    // handling signals is the child's job
    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
        libc::signal(libc::SIGUSR1, libc::SIG_IGN);
        libc::signal(libc::SIGUSR2, libc::SIG_IGN);
    }

    let mut byte: u8 = 0;
    loop {
        let ret = unsafe { libc::read(fd, (&mut byte as *mut u8).cast(), 1) };
        if ret == 1 {
            break;
        }
        if ret == 0 {
            log::info!("parent: exiting (child exited)");
            std::process::exit(1);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            log::error!("parent: pipe read failed: {err}");
            std::process::exit(1);
        }
    }

    if byte != 1 {
        log::error!("parent: got bogus pipe command {byte}");
        std::process::exit(1);
    }

    // has to happen here - the child is unprivileged by now
    powerflag::set(powerdownflag.as_deref());
    run_shutdown_command(shutdowncmd.as_deref());

    unsafe {
        libc::close(fd);
    }
    std::process::exit(0);
}
