//! # Notification Table & Dispatch
//!
//! Every observable UPS transition maps to a [`NotifyEvent`] with a stock
//! message template (one `%s` slot for the UPS identity) and a set of
//! delivery channels. Both are overridable from the config file
//! (`NOTIFYMSG`, `NOTIFYFLAG`).
//!
//! Delivery must never stall the poll loop: the `wall` broadcast and the
//! NOTIFYCMD hook run as spawned subprocesses that the loop does not wait
//! on.

use std::process::Stdio;

use bitflags::bitflags;
use tokio::io::AsyncWriteExt;

bitflags! {
    /// Delivery channels for one event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NotifyFlags: u8 {
        /// Swallow the event entirely.
        const IGNORE = 1 << 0;
        /// Write the message through the system log.
        const SYSLOG = 1 << 1;
        /// Broadcast the message to logged-in users.
        const WALL   = 1 << 2;
        /// Run the configured NOTIFYCMD with the message.
        const EXEC   = 1 << 3;
    }
}

impl NotifyFlags {
    /// Parse one flag word from a `NOTIFYFLAG` spec.
    pub fn parse_one(word: &str) -> Option<Self> {
        match word {
            "IGNORE" => Some(Self::IGNORE),
            "SYSLOG" => Some(Self::SYSLOG),
            "WALL" => Some(Self::WALL),
            "EXEC" => Some(Self::EXEC),
            _ => None,
        }
    }
}

/// Everything the monitor may announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum NotifyEvent {
    Online,
    OnBatt,
    LowBatt,
    Fsd,
    CommOk,
    CommBad,
    Shutdown,
    ReplBatt,
    NoComm,
    NoParent,
    Cal,
    NotCal,
    Off,
    NotOff,
    Bypass,
    NotBypass,
}

impl NotifyEvent {
    pub const ALL: [NotifyEvent; 16] = [
        Self::Online,
        Self::OnBatt,
        Self::LowBatt,
        Self::Fsd,
        Self::CommOk,
        Self::CommBad,
        Self::Shutdown,
        Self::ReplBatt,
        Self::NoComm,
        Self::NoParent,
        Self::Cal,
        Self::NotCal,
        Self::Off,
        Self::NotOff,
        Self::Bypass,
        Self::NotBypass,
    ];

    /// The event name used in config directives and the `NOTIFYTYPE`
    /// environment variable.
    pub fn name(self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::OnBatt => "ONBATT",
            Self::LowBatt => "LOWBATT",
            Self::Fsd => "FSD",
            Self::CommOk => "COMMOK",
            Self::CommBad => "COMMBAD",
            Self::Shutdown => "SHUTDOWN",
            Self::ReplBatt => "REPLBATT",
            Self::NoComm => "NOCOMM",
            Self::NoParent => "NOPARENT",
            Self::Cal => "CAL",
            Self::NotCal => "NOTCAL",
            Self::Off => "OFF",
            Self::NotOff => "NOTOFF",
            Self::Bypass => "BYPASS",
            Self::NotBypass => "NOTBYPASS",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|event| event.name().eq_ignore_ascii_case(name))
    }

    fn stock_message(self) -> &'static str {
        match self {
            Self::Online => "UPS %s on line power",
            Self::OnBatt => "UPS %s on battery",
            Self::LowBatt => "UPS %s battery is low",
            Self::Fsd => "UPS %s: forced shutdown in progress",
            Self::CommOk => "Communications with UPS %s established",
            Self::CommBad => "Communications with UPS %s lost",
            Self::Shutdown => "Auto logout and shutdown proceeding",
            Self::ReplBatt => "UPS %s battery needs to be replaced",
            Self::NoComm => "UPS %s is unavailable",
            Self::NoParent => "Privileged parent process died - shutdown impossible",
            Self::Cal => "UPS %s: calibration in progress",
            Self::NotCal => "UPS %s: calibration finished",
            Self::Off => "UPS %s: administratively OFF or asleep",
            Self::NotOff => "UPS %s: no longer administratively OFF or asleep",
            Self::Bypass => "UPS %s: on bypass (powered, not protecting)",
            Self::NotBypass => "UPS %s: no longer on bypass",
        }
    }

    fn default_flags(self) -> NotifyFlags {
        match self {
            // calibration chatter stays out of wall broadcasts
            Self::Cal | Self::NotCal => NotifyFlags::SYSLOG,
            _ => NotifyFlags::SYSLOG | NotifyFlags::WALL,
        }
    }
}

struct NotifyEntry {
    message: Option<String>,
    flags: NotifyFlags,
}

/// Per-event message templates and channel masks, fixed-size and indexed
/// by the event itself.
pub struct NotifyTable {
    entries: [NotifyEntry; NotifyEvent::ALL.len()],
}

impl Default for NotifyTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyTable {
    pub fn new() -> Self {
        Self {
            entries: NotifyEvent::ALL.map(|event| NotifyEntry {
                message: None,
                flags: event.default_flags(),
            }),
        }
    }

    /// Override the message template for a named event. Returns false on
    /// an unknown event name so the config parser can complain.
    pub fn set_message(&mut self, event_name: &str, template: &str) -> bool {
        match NotifyEvent::from_name(event_name) {
            Some(event) => {
                self.entries[event as usize].message = Some(template.to_string());
                true
            }
            None => false,
        }
    }

    /// Override the channel mask for a named event from a
    /// `FLAG[+FLAG...]` spec. Unknown individual flags are logged and
    /// skipped; an unknown event name returns false.
    pub fn set_flags(&mut self, event_name: &str, spec: &str) -> bool {
        let Some(event) = NotifyEvent::from_name(event_name) else {
            return false;
        };

        let mut flags = NotifyFlags::empty();
        for word in spec.split('+') {
            match NotifyFlags::parse_one(word) {
                Some(flag) => flags |= flag,
                None => log::warn!("Invalid notify flag: [{word}]"),
            }
        }

        self.entries[event as usize].flags = flags;
        true
    }

    pub fn flags(&self, event: NotifyEvent) -> NotifyFlags {
        self.entries[event as usize].flags
    }

    /// The message for an event, with the `%s` slot filled in.
    pub fn format(&self, event: NotifyEvent, upsname: Option<&str>) -> String {
        let entry = &self.entries[event as usize];
        let template = entry.message.as_deref().unwrap_or_else(|| event.stock_message());
        template.replacen("%s", upsname.unwrap_or(""), 1)
    }

    /// Deliver one event through its configured channels.
    ///
    /// Subprocess channels are fire-and-forget; reaping happens on the
    /// runtime so a hung notifier never blocks a polling cycle.
    pub fn dispatch(
        &self,
        event: NotifyEvent,
        upsname: Option<&str>,
        notifycmd: Option<&str>,
    ) {
        let flags = self.flags(event);

        log::debug!(
            "notify: type {} with flags {:#06x} for [{}]",
            event.name(),
            flags.bits(),
            upsname.unwrap_or("")
        );

        if flags.contains(NotifyFlags::IGNORE) {
            return;
        }

        let message = self.format(event, upsname);

        if flags.contains(NotifyFlags::SYSLOG) {
            log::info!("{message}");
        }

        if flags.contains(NotifyFlags::WALL) {
            wall(message.clone());
        }

        if flags.contains(NotifyFlags::EXEC) {
            match notifycmd {
                Some(cmd) => spawn_notifycmd(cmd, &message, event, upsname),
                None => log::debug!("notify: no NOTIFYCMD configured, skipping EXEC"),
            }
        }
    }
}

/// Broadcast to logged-in users via the system `wall` utility, feeding
/// the message over stdin.
pub fn wall(message: String) {
    let spawned = tokio::process::Command::new("wall")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();

    match spawned {
        Ok(mut child) => {
            tokio::spawn(async move {
                if let Some(mut stdin) = child.stdin.take() {
                    let _ = stdin.write_all(message.as_bytes()).await;
                    let _ = stdin.write_all(b"\n").await;
                    drop(stdin);
                }
                let _ = child.wait().await;
            });
        }
        Err(e) => log::error!("Can't invoke wall: {e}"),
    }
}

/// Run the configured NOTIFYCMD with the formatted message as its first
/// argument and `UPSNAME`/`NOTIFYTYPE` in the environment.
fn spawn_notifycmd(cmd: &str, message: &str, event: NotifyEvent, upsname: Option<&str>) {
    let shell_line = format!("{} \"{}\"", cmd, message);

    let spawned = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(shell_line)
        .env("UPSNAME", upsname.unwrap_or(""))
        .env("NOTIFYTYPE", event.name())
        .stdin(Stdio::null())
        .spawn();

    match spawned {
        Ok(mut child) => {
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
        }
        Err(e) => log::error!("Can't run NOTIFYCMD: {e}"),
    }
}
