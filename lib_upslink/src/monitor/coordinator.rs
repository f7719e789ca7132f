//! # Shutdown Coordinator
//!
//! The outer loop of the daemon. Owns every tracker (keyed by its
//! identity string), the notification table, the TLS policy, and the
//! signal flags; nothing else mutates monitoring state. Each cycle:
//! handle signal flags, poll every UPS, recalculate the available power
//! against MINSUPPLIES, check on the privileged parent, sleep.
//!
//! When the power budget is violated the coordinator walks the terminal
//! path: FSD on every primary-mode UPS, wait for the secondaries to log
//! out, announce, and hand the host to the shutdown command.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::client::ConnectFlags;
use crate::configs::monitor_conf::{ConfigError, MonitorConfig, MonitorDirective, ShutdownExit};

use super::notify::{self, NotifyEvent, NotifyTable};
use super::powerflag;
use super::privilege::{self, ShutdownPipe};
use super::signals::SignalFlags;
use super::tracker::{PollContext, Role, UpsTracker};

/// Map a `-D` count (or `DEBUG_MIN`) onto a log level.
pub fn debug_level(count: u8) -> log::LevelFilter {
    match count {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

/// The monitor daemon's whole mutable world.
pub struct Monitor {
    config_path: PathBuf,
    cfg: MonitorConfig,
    notify_table: NotifyTable,
    policy: crate::client::TlsPolicy,
    trackers: BTreeMap<String, UpsTracker>,
    signals: Arc<SignalFlags>,
    /// Present in split-process mode; the write-once shutdown trigger.
    pipe: Option<ShutdownPipe>,
    af_flags: ConnectFlags,
    /// Verbosity requested on the command line; `DEBUG_MIN` can only
    /// raise it.
    cli_level: log::LevelFilter,
    last_parent_warn: Option<Instant>,
}

impl Monitor {
    pub fn new(
        config_path: PathBuf,
        cfg: MonitorConfig,
        signals: Arc<SignalFlags>,
        pipe: Option<ShutdownPipe>,
        af_flags: ConnectFlags,
        cli_level: log::LevelFilter,
    ) -> Self {
        let mut monitor = Self {
            config_path,
            notify_table: Self::build_notify_table(&cfg),
            policy: cfg.tls_policy(),
            trackers: BTreeMap::new(),
            signals,
            pipe,
            af_flags,
            cli_level,
            last_parent_warn: None,
            cfg,
        };

        let directives = monitor.cfg.monitors.clone();
        for directive in &directives {
            if monitor.trackers.contains_key(&directive.sys) {
                log::warn!("Warning: ignoring duplicate UPS [{}]", directive.sys);
                continue;
            }
            monitor
                .trackers
                .insert(directive.sys.clone(), Self::new_tracker(directive));
        }

        monitor.apply_log_level();
        monitor
    }

    fn new_tracker(directive: &MonitorDirective) -> UpsTracker {
        if directive.power_value > 0 {
            log::info!(
                "UPS: {} ({}) (power value {})",
                directive.sys,
                match directive.role {
                    Role::Primary => "primary",
                    Role::Secondary => "secondary",
                },
                directive.power_value
            );
        } else {
            log::info!("UPS: {} (monitoring only)", directive.sys);
        }

        UpsTracker::new(
            directive.sys.clone(),
            directive.identity.clone(),
            directive.power_value,
            directive.username.clone(),
            directive.password.clone(),
            directive.role,
        )
    }

    fn build_notify_table(cfg: &MonitorConfig) -> NotifyTable {
        let mut table = NotifyTable::new();
        for (event, template) in &cfg.notify_messages {
            if !table.set_message(event, template) {
                log::warn!("'{event}' is not a valid notify event name");
            }
        }
        for (event, flags) in &cfg.notify_flags {
            if !table.set_flags(event, flags) {
                log::warn!("Warning: invalid notify type [{event}]");
            }
        }
        table
    }

    fn apply_log_level(&self) {
        let floor = self
            .cfg
            .debug_min
            .map(debug_level)
            .unwrap_or(log::LevelFilter::Off);
        log::set_max_level(self.cli_level.max(floor));
    }

    fn notify(&self, upsname: Option<&str>, event: NotifyEvent) {
        self.notify_table
            .dispatch(event, upsname, self.cfg.notifycmd.as_deref());
    }

    /// The sleep for the cycle that just finished: tighter while any
    /// UPS sits in a hot state.
    fn poll_interval(&self) -> u64 {
        if self.trackers.values().any(UpsTracker::is_hot) {
            self.cfg.pollfreqalert
        } else {
            self.cfg.pollfreq
        }
    }

    /// Drive the daemon until an exit signal arrives. Returns the
    /// process exit code; a power-loss shutdown leaves through
    /// [`Self::force_shutdown`] instead and never comes back.
    pub async fn run(&mut self) -> i32 {
        while !self.signals.exit_requested() {
            if self.signals.take_user_fsd() {
                self.force_shutdown().await;
            }

            if self.signals.take_reload() {
                if let Err(e) = self.reload().await {
                    log::error!("Fatal error: {e}");
                    return 1;
                }
            }

            self.poll_all().await;

            if self.recalc() {
                self.force_shutdown().await;
            }

            self.check_parent();

            tokio::time::sleep(Duration::from_secs(self.poll_interval())).await;
        }

        log::info!("Signal: exiting");
        self.disconnect_all().await;
        0
    }

    async fn poll_all(&mut self) {
        let timing = self.cfg.timing();
        let ctx = PollContext {
            policy: &self.policy,
            af_flags: self.af_flags,
            timing: &timing,
            throttle_max: self.cfg.pollfail_log_throttle_max,
            pollfreq: self.cfg.pollfreq,
        };

        for tracker in self.trackers.values_mut() {
            let events = tracker.poll(&ctx).await;
            for event in events {
                self.notify_table
                    .dispatch(event, Some(tracker.sys()), self.cfg.notifycmd.as_deref());
            }
        }
    }

    /// Recalculate the power budget. True means the sum of power values
    /// over non-critical UPSes fell below MINSUPPLIES and the host has
    /// to go down.
    fn recalc(&mut self) -> bool {
        let now = Instant::now();
        let timing = self.cfg.timing();
        let mut available: u32 = 0;

        for tracker in self.trackers.values_mut() {
            // an AWOL on-battery UPS must not stall the host forever
            tracker.promote_if_dead(now, &timing);

            // a UPS that isn't critical is assumed OK; that includes one
            // we have never heard from at all
            if tracker.is_critical(now, &timing) {
                log::debug!("Critical UPS: {}", tracker.sys());
            } else {
                available += tracker.power_value();
            }
        }

        log::debug!("Current power value: {available}");
        log::debug!("Minimum power value: {}", self.cfg.minsupplies);

        available < self.cfg.minsupplies
    }

    /// The terminal path. Raises FSD on every primary-mode UPS, gives
    /// the secondaries their window to log out, then shuts the host
    /// down. Does not return.
    pub async fn force_shutdown(&mut self) {
        log::debug!("Shutting down any UPSes in PRIMARY mode...");

        let mut is_a_primary = false;

        for tracker in self.trackers.values_mut() {
            if tracker.role() != Role::Primary {
                continue;
            }
            is_a_primary = true;

            let upsname = tracker.identity().upsname().to_string();
            let sys = tracker.sys().to_string();

            log::debug!("Setting FSD on UPS [{sys}]");
            match tracker.session_mut() {
                Some(session) => {
                    if let Err(e) = session.fsd(&upsname).await {
                        log::error!("FSD set on UPS [{sys}] failed: {e}");
                    }
                }
                None => log::error!("FSD set on UPS [{sys}] failed: not connected"),
            }
        }

        if is_a_primary {
            log::debug!("This system is a primary... waiting for secondaries to log out...");
            self.sync_secondaries().await;
        }

        self.do_shutdown().await;
    }

    /// Poll `NUMLOGINS` on every primary-mode UPS until only we remain
    /// logged in, or HOSTSYNC runs out.
    async fn sync_secondaries(&mut self) {
        let start = Instant::now();

        loop {
            let mut maxlogins: i64 = 0;

            for tracker in self.trackers.values_mut() {
                if tracker.role() != Role::Primary {
                    continue;
                }
                let upsname = tracker.identity().upsname().to_string();
                if let Some(session) = tracker.session_mut() {
                    match session.numlogins(&upsname).await {
                        Ok(logins) => maxlogins = maxlogins.max(logins),
                        Err(e) => log::debug!("NUMLOGINS during secondary sync failed: {e}"),
                    }
                }
            }

            // one login left is us
            if maxlogins <= 1 {
                return;
            }

            if start.elapsed().as_secs() as i64 > self.cfg.hostsync {
                log::info!("Host sync timer expired, forcing shutdown");
                return;
            }

            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn do_shutdown(&mut self) {
        log::error!("Executing automatic power-fail shutdown");
        notify::wall("Executing automatic power-fail shutdown".to_string());
        self.notify(None, NotifyEvent::Shutdown);

        tokio::time::sleep(Duration::from_secs(self.cfg.finaldelay)).await;

        match &self.pipe {
            // in the split model the privileged parent does the work
            Some(pipe) => {
                if let Err(e) = pipe.trigger() {
                    log::error!("Unable to call parent pipe for shutdown: {e}");
                }
            }
            None => {
                if !privilege::euid_is_root() {
                    log::warn!("Not root, shutdown may fail");
                }
                powerflag::set(self.cfg.powerdownflag.as_deref());
                privilege::run_shutdown_command(self.cfg.shutdowncmd.as_deref());
            }
        }

        match self.cfg.shutdownexit {
            ShutdownExit::Immediate => {
                log::debug!("Exiting immediately after initiating shutdown");
            }
            ShutdownExit::Never => {
                log::warn!("Configured to not exit after initiating shutdown");
                while !self.signals.exit_requested() {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
            ShutdownExit::After(secs) => {
                log::warn!("Configured to only exit {secs} sec after initiating shutdown");
                let mut left = secs;
                while !self.signals.exit_requested() && left > 0 {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    left -= 1;
                }
            }
        }

        std::process::exit(0);
    }

    /// Reread the config file and reconcile the tracker map: surviving
    /// identities are redefined in place (keeping their transient
    /// state), new ones are created, vanished ones are logged out and
    /// dropped. A new configuration that cannot satisfy MINSUPPLIES is
    /// fatal.
    pub async fn reload(&mut self) -> Result<(), ConfigError> {
        log::info!("Reloading configuration");

        if self.cfg.pollfail_log_throttle_max >= 0 {
            log::info!(
                "Forgetting POLLFAIL_LOG_THROTTLE_MAX={} and resetting UPS error-state counters before the configuration reload",
                self.cfg.pollfail_log_throttle_max
            );
            for tracker in self.trackers.values_mut() {
                tracker.reset_throttle();
            }
        }

        let new_cfg = match MonitorConfig::load(&self.config_path) {
            Ok(cfg) => cfg,
            Err(e @ ConfigError::OldStyleMonitor { .. }) => return Err(e),
            Err(e) => {
                log::error!("Reload failed: {e}");
                return Ok(());
            }
        };

        // the parent never hears about reloads
        if self.pipe.is_some() {
            if new_cfg.shutdowncmd != self.cfg.shutdowncmd {
                log::warn!("Warning: SHUTDOWNCMD redefined in split-process mode!");
                log::warn!("You must restart the monitor for this change to work");
            }
            if new_cfg.powerdownflag != self.cfg.powerdownflag {
                log::warn!("Warning: POWERDOWNFLAG redefined in split-process mode!");
                log::warn!("You must restart the monitor for this change to work");
            }
        }

        let mut seen = BTreeSet::new();
        for directive in &new_cfg.monitors {
            if !seen.insert(directive.sys.clone()) {
                log::warn!("Warning: ignoring duplicate UPS [{}]", directive.sys);
                continue;
            }

            match self.trackers.get_mut(&directive.sys) {
                Some(tracker) => {
                    tracker
                        .redefine(
                            directive.power_value,
                            &directive.username,
                            &directive.password,
                            directive.role,
                        )
                        .await
                }
                None => {
                    self.trackers
                        .insert(directive.sys.clone(), Self::new_tracker(directive));
                }
            }
        }

        let stale: Vec<String> = self
            .trackers
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(mut tracker) = self.trackers.remove(&key) {
                log::info!("No longer monitoring UPS [{key}]");
                tracker.drop_connection().await;
            }
        }

        self.policy = new_cfg.tls_policy();
        self.notify_table = Self::build_notify_table(&new_cfg);
        self.cfg = new_cfg;
        self.apply_log_level();

        // see if the user just blew off a foot
        self.cfg.validate()
    }

    /// In split mode, make sure the privileged parent is still there to
    /// run the shutdown command for us. Complains at most every two
    /// minutes.
    fn check_parent(&mut self) {
        let Some(pipe) = &self.pipe else { return };

        if pipe.parent_alive() {
            return;
        }

        let now = Instant::now();
        if let Some(last) = self.last_parent_warn {
            if now.duration_since(last).as_secs() < 120 {
                return;
            }
        }
        self.last_parent_warn = Some(now);

        self.notify(None, NotifyEvent::NoParent);
        log::error!("Parent died - shutdown impossible");
    }

    async fn disconnect_all(&mut self) {
        for tracker in self.trackers.values_mut() {
            tracker.drop_connection().await;
        }
    }
}
