//! # UPS Tracker
//!
//! One record per monitored UPS: connection, credentials, the last
//! observed status flags, the timers behind the edge-triggered
//! notifications, and the critical-state evaluation that feeds the
//! shutdown decision.
//!
//! All state transitions return the notifications they produced, in the
//! order they were observed; the coordinator owns delivery. The tracker
//! is mutated from exactly one place - the coordinator's poll loop.

use std::time::Instant;

use crate::client::{ClientError, ConnectFlags, ServerError, Session, TlsPolicy, UpsIdentity};

use super::notify::NotifyEvent;
use super::status::{Status, StatusToken};

/// Managerial role of this monitor toward one UPS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We manage the UPS and may raise FSD on it. On power loss we wait
    /// for the secondaries to log out before shutting down.
    Primary,
    /// We share the UPS's output but hold no managerial permissions.
    Secondary,
}

impl Role {
    /// Parse the MONITOR directive's role word, accepting the legacy
    /// synonyms.
    pub fn parse(word: &str) -> Option<Self> {
        if word.eq_ignore_ascii_case("primary") || word.eq_ignore_ascii_case("master") {
            Some(Self::Primary)
        } else if word.eq_ignore_ascii_case("secondary") || word.eq_ignore_ascii_case("slave") {
            Some(Self::Secondary)
        } else {
            None
        }
    }
}

/// Communication state. Starts at `NeverSeen` so the very first
/// successful contact does not fire COMMOK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommState {
    NeverSeen,
    Lost,
    Ok,
}

/// Line state. Starts at `NeverSeen` so the first ONLINE observation at
/// startup stays quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    NeverSeen,
    Degraded,
    FullyOnline,
}

/// The config-derived intervals the tracker consults, all in seconds.
/// Negative values keep their directive-specific meanings (OFFDURATION
/// < 0 disables the administrative-OFF promotion entirely).
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub hostsync: i64,
    pub deadtime: i64,
    pub offduration: i64,
    pub rbwarntime: i64,
    pub nocommwarntime: i64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            hostsync: 15,
            deadtime: 15,
            offduration: 30,
            rbwarntime: 43200,
            nocommwarntime: 300,
        }
    }
}

/// Everything a polling pass needs besides the tracker itself.
pub struct PollContext<'a> {
    pub policy: &'a TlsPolicy,
    /// Address-family restriction from the command line, or empty.
    pub af_flags: ConnectFlags,
    pub timing: &'a Timing,
    /// POLLFAIL_LOG_THROTTLE_MAX.
    pub throttle_max: i32,
    /// POLLFREQ, only used to render the throttling log message.
    pub pollfreq: u64,
}

/// Seconds since `then`, with "never" reading as forever-ago.
fn secs_since(now: Instant, then: Option<Instant>) -> i64 {
    match then {
        Some(then) => now.saturating_duration_since(then).as_secs() as i64,
        None => i64::MAX,
    }
}

/// Stable identifier of a poll-failure cause, used to collapse repeats.
fn poll_error_key(err: &ClientError) -> &'static str {
    match err {
        ClientError::NoSuchHost => "no-such-host",
        ClientError::SocketFailure(_) => "socket-failure",
        ClientError::ConnectFailure(_) => "connect-failure",
        ClientError::Write(_) => "write-error",
        ClientError::Read(_) => "read-error",
        ClientError::ServerDisconnected => "server-disconnected",
        ClientError::TlsRequired => "tls-required",
        ClientError::Tls(_) => "tls-error",
        ClientError::Protocol => "protocol",
        ClientError::Parse(_) => "parse",
        ClientError::InvalidArgument => "invalid-argument",
        ClientError::InvalidResponse => "invalid-response",
        ClientError::Server(kind) => match kind {
            ServerError::VarNotSupported => "var-not-supported",
            ServerError::UnknownUps => "unknown-ups",
            ServerError::AccessDenied => "access-denied",
            ServerError::PasswordRequired => "password-required",
            ServerError::PasswordIncorrect => "password-incorrect",
            ServerError::MissingArgument => "missing-argument",
            ServerError::DataStale => "data-stale",
            ServerError::VarUnknown => "var-unknown",
            ServerError::AlreadyLoggedIn => "already-logged-in",
            ServerError::AlreadySetPassword => "already-set-password",
            ServerError::UnknownType => "unknown-type",
            ServerError::UnknownVar => "unknown-var",
            ServerError::ReadOnly => "readonly",
            ServerError::TooLong => "too-long",
            ServerError::InvalidValue => "invalid-value",
            ServerError::SetFailed => "set-failed",
            ServerError::UnknownInstcmd => "unknown-instcmd",
            ServerError::InstcmdFailed => "instcmd-failed",
            ServerError::CmdNotSupported => "cmd-not-supported",
            ServerError::InvalidUsername => "invalid-username",
            ServerError::AlreadySetUsername => "already-set-username",
            ServerError::UnknownCommand => "unknown-command",
            ServerError::InvalidPassword => "invalid-password",
            ServerError::UsernameRequired => "username-required",
            ServerError::DriverNotConnected => "driver-not-connected",
            ServerError::Unknown => "unknown",
        },
    }
}

#[derive(Debug, Default)]
struct PollThrottle {
    /// Failure kind currently being collapsed, None while healthy.
    state: Option<&'static str>,
    count: i32,
}

/// One monitored UPS.
pub struct UpsTracker {
    /// The raw `upsname@host[:port]` string from the MONITOR directive;
    /// doubles as the tracker's key and its name in every message.
    sys: String,
    identity: UpsIdentity,
    username: String,
    password: String,
    /// Contribution to the host's power budget; 0 = monitor only.
    power_value: u32,
    role: Role,
    session: Option<Session>,
    status: Status,
    comm_state: CommState,
    line_state: LineState,
    /// Committed belief that the load is unpowered (OFF held longer
    /// than OFFDURATION).
    off_state: bool,
    bypass_state: bool,
    off_since: Option<Instant>,
    last_poll: Option<Instant>,
    last_noncrit: Option<Instant>,
    last_replbatt_warn: Option<Instant>,
    last_nocomm_warn: Option<Instant>,
    throttle: PollThrottle,
}

impl UpsTracker {
    pub fn new(
        sys: String,
        identity: UpsIdentity,
        power_value: u32,
        username: String,
        password: String,
        role: Role,
    ) -> Self {
        Self {
            sys,
            identity,
            username,
            password,
            power_value,
            role,
            session: None,
            status: Status::empty(),
            comm_state: CommState::NeverSeen,
            line_state: LineState::NeverSeen,
            off_state: false,
            bypass_state: false,
            off_since: None,
            last_poll: None,
            last_noncrit: None,
            last_replbatt_warn: None,
            last_nocomm_warn: None,
            throttle: PollThrottle::default(),
        }
    }

    pub fn sys(&self) -> &str {
        &self.sys
    }

    pub fn identity(&self) -> &UpsIdentity {
        &self.identity
    }

    pub fn power_value(&self) -> u32 {
        self.power_value
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn comm_state(&self) -> CommState {
        self.comm_state
    }

    /// True while the UPS sits in a state that warrants the tighter
    /// POLLFREQALERT cadence.
    pub fn is_hot(&self) -> bool {
        self.status.is_hot()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    /// Apply redefinition from a config reload. Credentials changing
    /// while not logged in, or a promotion to primary, force a
    /// reconnect so the new settings take effect.
    pub async fn redefine(
        &mut self,
        power_value: u32,
        username: &str,
        password: &str,
        role: Role,
    ) {
        if self.power_value != power_value {
            log::info!("UPS [{}]: redefined power value to {}", self.sys, power_value);
            self.power_value = power_value;
        }

        if self.username != username {
            log::info!("UPS [{}]: redefined username", self.sys);
            self.username = username.to_string();
            if !self.status.contains(Status::LOGGED_IN) {
                log::info!("UPS [{}]: retrying connection", self.sys);
                self.drop_connection().await;
            }
        }

        if self.password != password {
            // the new password itself stays out of the log
            log::info!("UPS [{}]: redefined password", self.sys);
            self.password = password.to_string();
            if !self.status.contains(Status::LOGGED_IN) {
                log::info!("UPS [{}]: retrying connection", self.sys);
                self.drop_connection().await;
            }
        }

        match (self.role, role) {
            (Role::Secondary, Role::Primary) => {
                log::info!("UPS [{}]: redefined as a primary", self.sys);
                self.role = Role::Primary;
                // reconnect so managerial mode gets requested
                self.drop_connection().await;
            }
            (Role::Primary, Role::Secondary) => {
                log::info!("UPS [{}]: redefined as a secondary", self.sys);
                self.role = Role::Secondary;
            }
            _ => {}
        }
    }

    /// Cleanly close the connection and forget the per-connection state.
    /// No notification fires here; communication-loss events come from
    /// [`Self::mark_gone`].
    pub async fn drop_connection(&mut self) {
        if self.line_state == LineState::FullyOnline && self.status.contains(Status::ONLINE) {
            log::debug!("Dropping connection to UPS [{}], last seen fully online", self.sys);
        } else {
            log::debug!(
                "Dropping connection to UPS [{}], last seen not fully online (may be considered critical later)",
                self.sys
            );
        }

        self.comm_state = CommState::Lost;
        self.throttle = PollThrottle::default();
        self.status.remove(Status::LOGGED_IN | Status::CONNECTED);

        if let Some(session) = self.session.take() {
            session.disconnect().await;
        }
    }

    /// A successful poll: stamp the time and fire COMMOK on the lost->ok
    /// edge (the very first contact stays quiet).
    fn mark_alive(&mut self, now: Instant) -> Vec<NotifyEvent> {
        self.last_poll = Some(now);

        match self.comm_state {
            CommState::Ok => Vec::new(),
            CommState::NeverSeen => {
                self.comm_state = CommState::Ok;
                Vec::new()
            }
            CommState::Lost => {
                self.comm_state = CommState::Ok;
                vec![NotifyEvent::CommOk]
            }
        }
    }

    /// A failed poll: COMMBAD on the edge into loss, then NOCOMM at most
    /// every NOCOMMWARNTIME once the silence has lasted that long.
    pub fn mark_gone(&mut self, now: Instant, timing: &Timing) -> Vec<NotifyEvent> {
        if self.comm_state != CommState::Lost {
            self.comm_state = CommState::Lost;
            return vec![NotifyEvent::CommBad];
        }

        if secs_since(now, self.last_poll) < timing.nocommwarntime {
            return Vec::new();
        }

        if secs_since(now, self.last_nocomm_warn) > timing.nocommwarntime {
            self.last_nocomm_warn = Some(now);
            return vec![NotifyEvent::NoComm];
        }

        Vec::new()
    }

    /// Interpret one `ups.status` value and fire the edge-triggered
    /// notifications.
    ///
    /// Ordering within a cycle: the silent LB/FSD clears, the
    /// clear-and-fire transitions out of CAL/OFF/BYPASS, then each
    /// status token in textual order, with FSD processed last so it
    /// overrides an OL in the same line. An empty status reads as a
    /// dead UPS.
    pub fn apply_status(&mut self, raw: &str, now: Instant, timing: &Timing) -> Vec<NotifyEvent> {
        log::debug!("status of [{}]: [{raw}]", self.sys);

        let tokens: Vec<StatusToken> = raw
            .split_ascii_whitespace()
            .filter_map(StatusToken::parse)
            .collect();

        if raw.trim().is_empty() {
            return self.mark_gone(now, timing);
        }

        let mut events = self.mark_alive(now);

        // flags that just vanish, without ceremony
        if !tokens.contains(&StatusToken::LowBattery) {
            self.status.remove(Status::LOWBATT);
        }
        if !tokens.contains(&StatusToken::ForcedShutdown) {
            self.status.remove(Status::FSD);
        }

        // leaving a hot state is worth announcing
        if !tokens.contains(&StatusToken::Calibrating) && self.status.contains(Status::CAL) {
            self.status.remove(Status::CAL);
            events.push(NotifyEvent::NotCal);
        }
        if !tokens.contains(&StatusToken::Off) {
            self.off_since = None;
            self.off_state = false;
            if self.status.contains(Status::OFF) {
                self.status.remove(Status::OFF);
                events.push(NotifyEvent::NotOff);
            }
        }
        if !tokens.contains(&StatusToken::Bypass) {
            self.bypass_state = false;
            if self.status.contains(Status::BYPASS) {
                self.status.remove(Status::BYPASS);
                events.push(NotifyEvent::NotBypass);
            }
        }

        let mut saw_fsd = false;

        for token in &tokens {
            match token {
                StatusToken::Online => self.on_line(&mut events),
                StatusToken::OnBattery => self.on_batt(&mut events),
                StatusToken::LowBattery => self.low_batt(&mut events),
                StatusToken::ReplaceBattery => self.replbatt(now, timing, &mut events),
                StatusToken::Calibrating => self.is_cal(&mut events),
                StatusToken::Off => self.is_off(now, timing, &mut events),
                StatusToken::Bypass => self.is_bypass(&mut events),
                StatusToken::ForcedShutdown => saw_fsd = true,
            }
            self.update_crittimer(now);
        }

        if saw_fsd {
            if !self.status.contains(Status::FSD) {
                self.status.insert(Status::FSD);
                events.push(NotifyEvent::Fsd);
            }
            self.update_crittimer(now);
        }

        events
    }

    fn on_line(&mut self, events: &mut Vec<NotifyEvent>) {
        if self.status.contains(Status::ONLINE) {
            return;
        }

        // the very first OL at startup stays quiet
        if self.line_state != LineState::NeverSeen {
            events.push(NotifyEvent::Online);
        }
        self.line_state = LineState::FullyOnline;

        self.status.insert(Status::ONLINE);
        self.status.remove(Status::ONBATT);
    }

    fn on_batt(&mut self, events: &mut Vec<NotifyEvent>) {
        if self.status.contains(Status::ONBATT) {
            return;
        }

        self.line_state = LineState::Degraded;
        events.push(NotifyEvent::OnBatt);

        self.status.insert(Status::ONBATT);
        self.status.remove(Status::ONLINE);
    }

    fn low_batt(&mut self, events: &mut Vec<NotifyEvent>) {
        if self.status.contains(Status::LOWBATT) {
            return;
        }
        self.status.insert(Status::LOWBATT);
        events.push(NotifyEvent::LowBatt);
    }

    fn replbatt(&mut self, now: Instant, timing: &Timing, events: &mut Vec<NotifyEvent>) {
        if secs_since(now, self.last_replbatt_warn) > timing.rbwarntime {
            self.last_replbatt_warn = Some(now);
            events.push(NotifyEvent::ReplBatt);
        }
    }

    fn is_cal(&mut self, events: &mut Vec<NotifyEvent>) {
        if self.status.contains(Status::CAL) {
            return;
        }
        self.status.insert(Status::CAL);
        events.push(NotifyEvent::Cal);
    }

    fn is_off(&mut self, now: Instant, timing: &Timing, events: &mut Vec<NotifyEvent>) {
        if self.status.contains(Status::OFF) {
            match self.off_since {
                None => self.off_since = Some(now),
                Some(since) => {
                    let held = now.saturating_duration_since(since).as_secs() as i64;
                    if timing.offduration > 0 && held > timing.offduration && !self.off_state {
                        log::warn!(
                            "UPS [{}] has been in state OFF for {held} sec, assuming the line is not fed \
                             (if it is calibrating, check the OFFDURATION option)",
                            self.sys
                        );
                        self.off_state = true;
                    }
                }
            }
            return;
        }

        self.off_since = Some(now);
        if timing.offduration == 0 {
            log::warn!(
                "UPS [{}] is in state OFF, assuming the line is not fed \
                 (if it is calibrating, check the OFFDURATION option)",
                self.sys
            );
            self.off_state = true;
        } else if timing.offduration < 0 {
            log::debug!(
                "UPS [{}] is in state OFF, but not assuming the line is unfed (OFFDURATION < 0)",
                self.sys
            );
        }

        self.status.insert(Status::OFF);
        events.push(NotifyEvent::Off);
    }

    fn is_bypass(&mut self, events: &mut Vec<NotifyEvent>) {
        if self.status.contains(Status::BYPASS) {
            return;
        }

        // if we lose comms from here, consider the UPS AWOL
        self.bypass_state = true;

        self.status.insert(Status::BYPASS);
        events.push(NotifyEvent::Bypass);
    }

    /// Remember the last moment this UPS was not in a critical battery
    /// state. The HOSTSYNC grace a secondary grants the primary counts
    /// from this stamp.
    fn update_crittimer(&mut self, now: Instant) {
        if !self.status.contains(Status::ONBATT)
            || !self.status.contains(Status::LOWBATT)
            || self.status.contains(Status::CAL)
        {
            self.last_noncrit = Some(now);
        }
    }

    /// Decide whether this UPS can no longer be counted on to feed us.
    pub fn is_critical(&self, now: Instant, timing: &Timing) -> bool {
        // the primary forced a shutdown, or a driver forwarded the flag
        if self.status.contains(Status::FSD) {
            return true;
        }

        if self.comm_state == CommState::Lost {
            if self.status.contains(Status::CAL) {
                log::warn!(
                    "UPS [{}] was last known to be calibrating and is not communicating, assuming dead",
                    self.sys
                );
                return true;
            }

            if self.bypass_state || self.status.contains(Status::BYPASS) {
                log::warn!(
                    "UPS [{}] was last known to be on BYPASS and is not communicating, assuming dead",
                    self.sys
                );
                return true;
            }

            if self.off_state
                || (timing.offduration >= 0 && self.status.contains(Status::OFF))
            {
                log::warn!(
                    "UPS [{}] was last known to be (administratively) OFF and is not communicating, assuming dead",
                    self.sys
                );
                return true;
            }

            if self.line_state == LineState::Degraded {
                log::warn!(
                    "UPS [{}] was last known to be not fully online and is not communicating, assuming dead",
                    self.sys
                );
                return true;
            }
        }

        // administratively OFF for longer than OFFDURATION
        if self.status.contains(Status::OFF) && timing.offduration >= 0 && self.off_state {
            log::warn!("UPS [{}] is reported as (administratively) OFF", self.sys);
            return true;
        }

        if !self.status.contains(Status::ONBATT) || !self.status.contains(Status::LOWBATT) {
            return false;
        }

        // OB+LB during calibration is legitimate, not an outage
        if self.status.contains(Status::CAL) {
            log::warn!(
                "UPS [{}] seems to be OB+LB, but it is also calibrating - not declaring critical",
                self.sys
            );
            return false;
        }

        // a primary acts immediately so FSD reaches the secondaries
        if self.role == Role::Primary {
            return true;
        }

        // a secondary gives the primary HOSTSYNC seconds to set FSD
        let waited = secs_since(now, self.last_noncrit);
        if waited > timing.hostsync {
            log::warn!(
                "Giving up on the primary for UPS [{}] after {waited} sec since last known non-critical state",
                self.sys
            );
            return true;
        }

        false
    }

    /// An on-battery UPS that has been silent past DEADTIME is promoted
    /// to low-battery (no notification) so it can be counted critical
    /// instead of stalling the host forever.
    pub fn promote_if_dead(&mut self, now: Instant, timing: &Timing) {
        if secs_since(now, self.last_poll) > timing.deadtime
            && self.status.contains(Status::ONBATT)
        {
            log::debug!("Promoting dead UPS to low battery: {}", self.sys);
            self.status.insert(Status::LOWBATT);
        }
    }

    /// Forget the poll-failure throttle, e.g. around a config reload.
    pub fn reset_throttle(&mut self) {
        self.throttle = PollThrottle::default();
    }

    /// Note a successful poll for throttling purposes, logging the
    /// recovery if failures were being collapsed.
    fn note_poll_recovered(&mut self, throttle_max: i32) {
        if throttle_max >= 0 {
            if let Some(state) = self.throttle.state {
                log::error!(
                    "Poll UPS [{}] recovered from failure state [{state}]",
                    self.sys
                );
            }
        }
        self.throttle = PollThrottle::default();
    }

    /// Log one poll failure, collapsed per POLLFAIL_LOG_THROTTLE_MAX:
    /// negative logs every cycle, zero logs only the state edges, N > 0
    /// repeats every N cycles.
    fn log_poll_failure(&mut self, err: &ClientError, throttle_max: i32, pollfreq: u64) {
        let key = poll_error_key(err);

        let loud = if throttle_max < 0 {
            true
        } else if self.throttle.state == Some(key) {
            if throttle_max == 0 {
                false
            } else if self.throttle.count >= throttle_max - 1 {
                self.throttle.count = 0;
                true
            } else {
                self.throttle.count += 1;
                false
            }
        } else {
            let previous = self.throttle.state.unwrap_or("none");
            if throttle_max == 0 {
                log::error!(
                    "Poll UPS [{}] failure state changed from [{previous}] to [{key}]; \
                     the report below will not be repeated:",
                    self.sys
                );
            } else {
                log::error!(
                    "Poll UPS [{}] failure state changed from [{previous}] to [{key}]; \
                     the report below repeats every {throttle_max} polling cycles ({} sec):",
                    self.sys,
                    throttle_max as u64 * pollfreq
                );
            }
            self.throttle.state = Some(key);
            self.throttle.count = 0;
            true
        };

        let text = match err.server_error() {
            Some(ServerError::UnknownUps) => format!(
                "Poll UPS [{}] failed - [{}] does not exist on server {}",
                self.sys,
                self.identity.upsname(),
                self.identity.hostname()
            ),
            _ => format!("Poll UPS [{}] failed - {err}", self.sys),
        };

        if loud {
            log::error!("{text}");
        } else {
            log::debug!("{text}");
        }
    }

    /// Connect and run the auth ladder:
    /// connect -> STARTTLS -> USERNAME -> PASSWORD -> LOGIN -> PRIMARY.
    /// On failure the events to deliver (COMMBAD and friends) come back
    /// as the error value.
    async fn connect_and_auth(
        &mut self,
        ctx: &PollContext<'_>,
        now: Instant,
    ) -> Result<(), Vec<NotifyEvent>> {
        log::debug!("Trying to connect to UPS [{}]", self.sys);
        self.status.remove(Status::CONNECTED);

        let (_, force_tls) = ctx.policy.for_host(self.identity.hostname());
        let mut flags = ctx.af_flags;
        flags |= if force_tls {
            ConnectFlags::REQUIRE_TLS
        } else {
            ConnectFlags::TRY_TLS
        };

        let session = match Session::connect(
            self.identity.hostname(),
            self.identity.port(),
            flags,
            ctx.policy,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                log::error!("UPS [{}]: connect failed: {e}", self.sys);
                return Err(self.mark_gone(now, ctx.timing));
            }
        };

        self.session = Some(session);
        self.status.insert(Status::CONNECTED);

        if self.username.is_empty() {
            log::error!("UPS [{}]: no username defined!", self.sys);
            return Err(Vec::new());
        }

        let auth = self.run_auth_ladder().await;

        match auth {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("Login to UPS [{}] failed: {e}", self.sys);
                if e.is_transport() {
                    self.drop_connection().await;
                }
                Err(Vec::new())
            }
        }
    }

    async fn run_auth_ladder(&mut self) -> Result<(), ClientError> {
        let upsname = self.identity.upsname().to_string();
        let username = self.username.clone();
        let password = self.password.clone();
        let role = self.role;
        let sys = self.sys.clone();

        let session = self.session.as_mut().ok_or(ClientError::InvalidArgument)?;

        session.username(&username).await?;
        session.password(&password).await?;
        session.login(&upsname).await?;

        log::debug!("Logged into UPS [{sys}]");
        self.status.insert(Status::LOGGED_IN);

        if role == Role::Primary {
            let session = self.session.as_mut().ok_or(ClientError::InvalidArgument)?;
            match session.primary(&upsname).await {
                Ok(()) => {}
                Err(e) if e.is_transport() => return Err(e),
                Err(e) => {
                    // keep polling without managerial permissions
                    log::error!("Primary managerial privileges unavailable on UPS [{sys}]: {e}");
                }
            }
        }

        Ok(())
    }

    /// One polling pass: reconnect if needed, fetch `ups.status`, run
    /// the interpreter. Returns the notifications to deliver, in order.
    pub async fn poll(&mut self, ctx: &PollContext<'_>) -> Vec<NotifyEvent> {
        let now = Instant::now();

        if !self.status.contains(Status::CONNECTED) || self.session.is_none() {
            if let Err(events) = self.connect_and_auth(ctx, now).await {
                return events;
            }
        }

        let upsname = self.identity.upsname().to_string();
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };

        if session.is_tls() {
            log::debug!("polling UPS [{}] [TLS]", self.sys);
        } else {
            log::debug!("polling UPS [{}]", self.sys);
        }

        match session.ups_status(&upsname).await {
            Ok(raw) => {
                self.note_poll_recovered(ctx.throttle_max);
                self.apply_status(&raw, now, ctx.timing)
            }
            Err(err) => {
                if err.server_error() == Some(ServerError::UnknownCommand) {
                    log::error!("UPS [{}]: server is too old to monitor", self.sys);
                }

                self.log_poll_failure(&err, ctx.throttle_max, ctx.pollfreq);

                let events = self.mark_gone(now, ctx.timing);

                if err.is_transport() {
                    self.drop_connection().await;
                }

                events
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tracker(role: Role) -> UpsTracker {
        UpsTracker::new(
            "myups@localhost".to_string(),
            UpsIdentity::parse("myups@localhost").unwrap(),
            1,
            "monuser".to_string(),
            "secret".to_string(),
            role,
        )
    }

    fn timing() -> Timing {
        Timing::default()
    }

    #[test]
    fn first_online_observation_is_quiet() {
        let mut t = tracker(Role::Secondary);
        let now = Instant::now();

        let events = t.apply_status("OL", now, &timing());
        assert!(events.is_empty());
        assert!(t.status().contains(Status::ONLINE));
    }

    #[test]
    fn online_and_onbatt_exclude_each_other() {
        let mut t = tracker(Role::Secondary);
        let base = Instant::now();

        t.apply_status("OL", base, &timing());
        let events = t.apply_status("OB", base + Duration::from_secs(5), &timing());
        assert_eq!(events, vec![NotifyEvent::OnBatt]);
        assert!(t.status().contains(Status::ONBATT));
        assert!(!t.status().contains(Status::ONLINE));

        let events = t.apply_status("OL", base + Duration::from_secs(10), &timing());
        assert_eq!(events, vec![NotifyEvent::Online]);
        assert!(t.status().contains(Status::ONLINE));
        assert!(!t.status().contains(Status::ONBATT));
    }

    #[test]
    fn repeated_status_is_idempotent() {
        let mut t = tracker(Role::Secondary);
        let base = Instant::now();

        t.apply_status("OB LB", base, &timing());
        let events = t.apply_status("OB LB", base + Duration::from_secs(5), &timing());
        assert!(events.is_empty());
    }

    #[test]
    fn comm_recovery_fires_commok_but_not_on_first_contact() {
        let mut t = tracker(Role::Secondary);
        let base = Instant::now();

        // first contact: quiet
        assert!(t.apply_status("OL", base, &timing()).is_empty());

        // loss fires COMMBAD once
        assert_eq!(t.mark_gone(base + Duration::from_secs(5), &timing()), vec![NotifyEvent::CommBad]);
        assert!(t.mark_gone(base + Duration::from_secs(6), &timing()).is_empty());

        // recovery fires COMMOK
        let events = t.apply_status("OL", base + Duration::from_secs(10), &timing());
        assert_eq!(events, vec![NotifyEvent::CommOk]);
    }

    #[test]
    fn first_failed_contact_fires_commbad() {
        let mut t = tracker(Role::Secondary);
        assert_eq!(
            t.mark_gone(Instant::now(), &timing()),
            vec![NotifyEvent::CommBad]
        );
    }

    #[test]
    fn nocomm_is_paced_by_nocommwarntime() {
        let mut t = tracker(Role::Secondary);
        let base = Instant::now();
        let tm = timing();

        t.apply_status("OL", base, &tm);
        assert_eq!(t.mark_gone(base + Duration::from_secs(1), &tm), vec![NotifyEvent::CommBad]);

        // too early for the persistent-condition nag
        assert!(t.mark_gone(base + Duration::from_secs(100), &tm).is_empty());

        // past NOCOMMWARNTIME since the last poll: NOCOMM, once
        let late = base + Duration::from_secs(tm.nocommwarntime as u64 + 2);
        assert_eq!(t.mark_gone(late, &tm), vec![NotifyEvent::NoComm]);
        assert!(t.mark_gone(late + Duration::from_secs(1), &tm).is_empty());

        // and again a full interval later
        let later = late + Duration::from_secs(tm.nocommwarntime as u64 + 2);
        assert_eq!(t.mark_gone(later, &tm), vec![NotifyEvent::NoComm]);
    }

    #[test]
    fn calibration_with_ob_lb_is_not_critical() {
        let mut t = tracker(Role::Primary);
        let now = Instant::now();

        let events = t.apply_status("OB LB CAL", now, &timing());
        assert_eq!(
            events,
            vec![NotifyEvent::OnBatt, NotifyEvent::LowBatt, NotifyEvent::Cal]
        );
        assert!(!t.is_critical(now, &timing()));

        // leaving calibration announces NOTCAL, then ONLINE
        let events = t.apply_status("OL", now + Duration::from_secs(5), &timing());
        assert_eq!(events, vec![NotifyEvent::NotCal, NotifyEvent::Online]);
        assert!(!t.is_hot());
    }

    #[test]
    fn primary_ob_lb_is_critical_immediately() {
        let mut t = tracker(Role::Primary);
        let now = Instant::now();

        t.apply_status("OB LB", now, &timing());
        assert!(t.is_critical(now, &timing()));
    }

    #[test]
    fn secondary_grants_the_primary_hostsync_grace() {
        let mut t = tracker(Role::Secondary);
        let base = Instant::now();
        let tm = timing();

        t.apply_status("OB LB", base, &tm);
        assert!(!t.is_critical(base + Duration::from_secs(2), &tm));
        assert!(t.is_critical(base + Duration::from_secs(tm.hostsync as u64 + 2), &tm));
    }

    #[test]
    fn fsd_is_always_critical_and_processed_last() {
        let mut t = tracker(Role::Secondary);
        let now = Instant::now();

        let events = t.apply_status("FSD OL", now, &timing());
        assert_eq!(events, vec![NotifyEvent::Fsd]);
        assert!(t.status().contains(Status::FSD));
        assert!(t.is_critical(now, &timing()));
    }

    #[test]
    fn off_promotion_honours_offduration() {
        let mut t = tracker(Role::Primary);
        let base = Instant::now();
        let tm = Timing {
            offduration: 30,
            ..timing()
        };

        let events = t.apply_status("OFF", base, &tm);
        assert_eq!(events, vec![NotifyEvent::Off]);
        assert!(!t.is_critical(base, &tm));

        t.apply_status("OFF", base + Duration::from_secs(20), &tm);
        assert!(!t.is_critical(base + Duration::from_secs(20), &tm));

        t.apply_status("OFF", base + Duration::from_secs(31), &tm);
        assert!(t.is_critical(base + Duration::from_secs(31), &tm));

        // recovery clears the committed OFF belief and announces NOTOFF
        let events = t.apply_status("OL", base + Duration::from_secs(40), &tm);
        assert!(events.contains(&NotifyEvent::NotOff));
        assert!(!t.is_critical(base + Duration::from_secs(40), &tm));
    }

    #[test]
    fn offduration_zero_is_immediate_and_negative_disables() {
        let immediate = Timing { offduration: 0, ..timing() };
        let mut t = tracker(Role::Primary);
        let base = Instant::now();
        t.apply_status("OFF", base, &immediate);
        assert!(t.is_critical(base, &immediate));

        let disabled = Timing { offduration: -1, ..timing() };
        let mut t = tracker(Role::Primary);
        t.apply_status("OFF", base, &disabled);
        t.apply_status("OFF", base + Duration::from_secs(3600), &disabled);
        assert!(!t.is_critical(base + Duration::from_secs(3600), &disabled));
    }

    #[test]
    fn comm_loss_while_calibrating_assumes_dead() {
        let mut t = tracker(Role::Secondary);
        let base = Instant::now();
        let tm = timing();

        t.apply_status("OL CAL", base, &tm);
        assert!(!t.is_critical(base, &tm));

        t.mark_gone(base + Duration::from_secs(16), &tm);
        assert!(t.is_critical(base + Duration::from_secs(16), &tm));
    }

    #[test]
    fn comm_loss_while_fully_online_is_not_critical() {
        let mut t = tracker(Role::Secondary);
        let base = Instant::now();
        let tm = timing();

        t.apply_status("OL", base, &tm);
        t.mark_gone(base + Duration::from_secs(16), &tm);
        assert!(!t.is_critical(base + Duration::from_secs(16), &tm));
    }

    #[test]
    fn comm_loss_after_bypass_assumes_dead() {
        let mut t = tracker(Role::Secondary);
        let base = Instant::now();
        let tm = timing();

        let events = t.apply_status("OL BYPASS", base, &tm);
        assert!(events.contains(&NotifyEvent::Bypass));

        t.mark_gone(base + Duration::from_secs(16), &tm);
        assert!(t.is_critical(base + Duration::from_secs(16), &tm));
    }

    #[test]
    fn replbatt_is_rate_limited() {
        let mut t = tracker(Role::Secondary);
        let base = Instant::now();
        let tm = timing();

        let events = t.apply_status("OL RB", base, &tm);
        assert!(events.contains(&NotifyEvent::ReplBatt));

        let events = t.apply_status("OL RB", base + Duration::from_secs(60), &tm);
        assert!(!events.contains(&NotifyEvent::ReplBatt));

        let events = t.apply_status(
            "OL RB",
            base + Duration::from_secs(tm.rbwarntime as u64 + 2),
            &tm,
        );
        assert!(events.contains(&NotifyEvent::ReplBatt));
    }

    #[test]
    fn dead_onbatt_ups_is_promoted_to_lowbatt() {
        let mut t = tracker(Role::Secondary);
        let base = Instant::now();
        let tm = timing();

        t.apply_status("OB", base, &tm);
        assert!(!t.status().contains(Status::LOWBATT));

        t.promote_if_dead(base + Duration::from_secs(tm.deadtime as u64 + 2), &tm);
        assert!(t.status().contains(Status::LOWBATT));
    }

    #[test]
    fn unknown_tokens_are_ignored() {
        let mut t = tracker(Role::Secondary);
        let now = Instant::now();

        let events = t.apply_status("OL CHRG BOOST", now, &timing());
        assert!(events.is_empty());
        assert_eq!(t.status() & (Status::ONLINE | Status::ONBATT), Status::ONLINE);
    }

    #[test]
    fn empty_status_reads_as_a_dead_ups() {
        let mut t = tracker(Role::Secondary);
        let base = Instant::now();

        t.apply_status("OL", base, &timing());
        let events = t.apply_status("", base + Duration::from_secs(5), &timing());
        assert_eq!(events, vec![NotifyEvent::CommBad]);
    }
}
