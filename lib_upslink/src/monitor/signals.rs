//! Signal wiring: set-flag-and-return handlers, checked once per loop
//! iteration. The flags are the only process-wide mutable state in the
//! daemon, kept behind atomics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};

/// The three things a signal may ask of the running monitor.
#[derive(Default)]
pub struct SignalFlags {
    exit: AtomicBool,
    reload: AtomicBool,
    user_fsd: AtomicBool,
}

impl SignalFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Install the listeners on the current runtime:
    /// SIGHUP reloads, SIGINT/SIGQUIT/SIGTERM exit, SIGUSR1 forces FSD.
    /// SIGPIPE is observed and discarded so a dying peer never kills us.
    pub fn install(self: &Arc<Self>) -> std::io::Result<()> {
        let mut hup = signal(SignalKind::hangup())?;
        let mut int = signal(SignalKind::interrupt())?;
        let mut quit = signal(SignalKind::quit())?;
        let mut term = signal(SignalKind::terminate())?;
        let mut usr1 = signal(SignalKind::user_defined1())?;
        let mut pipe = signal(SignalKind::pipe())?;

        let flags = Arc::clone(self);
        tokio::spawn(async move {
            while hup.recv().await.is_some() {
                flags.reload.store(true, Ordering::SeqCst);
            }
        });

        let flags = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = int.recv() => {}
                    _ = quit.recv() => {}
                    _ = term.recv() => {}
                }
                flags.exit.store(true, Ordering::SeqCst);
            }
        });

        let flags = Arc::clone(self);
        tokio::spawn(async move {
            while usr1.recv().await.is_some() {
                log::info!("Signal: user requested FSD");
                flags.user_fsd.store(true, Ordering::SeqCst);
            }
        });

        tokio::spawn(async move {
            while pipe.recv().await.is_some() {
                log::debug!("SIGPIPE: dazed and confused, but continuing...");
            }
        });

        Ok(())
    }

    pub fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
    }

    /// Read and clear the reload request.
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }

    /// Read and clear the user-requested-FSD flag.
    pub fn take_user_fsd(&self) -> bool {
        self.user_fsd.swap(false, Ordering::SeqCst)
    }
}
