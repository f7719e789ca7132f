//! # Monitor Configuration
//!
//! The daemon's config file is line-oriented: one directive per line,
//! whitespace-separated arguments, values quoted when they carry spaces
//! (the wire codec's quoting rules apply), `#` starting a comment.
//!
//! Parsing produces a typed [`MonitorConfig`]; directive errors are
//! logged and counted rather than fatal, with two exceptions that the
//! original treats as unusable configurations: an old-style MONITOR
//! line without a username, and (at validation time) a total power
//! value below MINSUPPLIES.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::client::{words, TlsPolicy, UpsIdentity};
use crate::monitor::tracker::{Role, Timing};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can't open config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: unable to use old-style MONITOR line without a username")]
    OldStyleMonitor { path: PathBuf, line: usize },
    #[error("insufficient power configured: total power value {total} less than MINSUPPLIES {min}")]
    InsufficientPower { total: u32, min: u32 },
}

/// What to do with the daemon itself once the shutdown command has been
/// invoked (`SHUTDOWNEXIT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownExit {
    /// Exit right away (the default).
    Immediate,
    /// Keep sleeping until SIGTERM arrives.
    Never,
    /// Exit after this many seconds.
    After(u64),
}

impl ShutdownExit {
    fn parse(word: &str) -> Self {
        if ["on", "yes", "true"].iter().any(|w| word.eq_ignore_ascii_case(w)) {
            return Self::Immediate;
        }
        if ["off", "no", "false"].iter().any(|w| word.eq_ignore_ascii_case(w)) {
            return Self::Never;
        }
        match word.parse::<i64>() {
            Ok(n) if n < 0 => Self::Never,
            Ok(0) => Self::Immediate,
            Ok(n) => Self::After(n as u64),
            Err(_) => {
                log::warn!("SHUTDOWNEXIT value not recognized, defaulting to 'yes'");
                Self::Immediate
            }
        }
    }
}

/// One `MONITOR` directive.
#[derive(Debug, Clone)]
pub struct MonitorDirective {
    /// The raw identity string, used as the tracker key and in messages.
    pub sys: String,
    pub identity: UpsIdentity,
    pub power_value: u32,
    pub username: String,
    pub password: String,
    pub role: Role,
}

/// A `CERTHOST` directive: per-host certificate expectations.
#[derive(Debug, Clone)]
pub struct CertHost {
    pub hostname: String,
    pub certname: String,
    pub verify: bool,
    pub force_tls: bool,
}

/// The full parsed configuration, defaults matching the original
/// daemon's shipped values.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub monitors: Vec<MonitorDirective>,

    pub minsupplies: u32,
    pub shutdowncmd: Option<String>,
    pub notifycmd: Option<String>,
    pub pollfreq: u64,
    pub pollfreqalert: u64,
    pub hostsync: i64,
    pub deadtime: i64,
    pub offduration: i64,
    pub rbwarntime: i64,
    pub nocommwarntime: i64,
    pub finaldelay: u64,
    pub pollfail_log_throttle_max: i32,
    pub shutdownexit: ShutdownExit,
    pub powerdownflag: Option<PathBuf>,
    pub run_as_user: Option<String>,
    /// Floor for the log verbosity, applied on load and reload.
    pub debug_min: Option<u8>,

    pub cert_path: Option<PathBuf>,
    pub cert_verify: bool,
    pub force_ssl: bool,
    /// Client certificate identity (`CERTIDENT <name> <passwd>`).
    /// Accepted for config compatibility; this build authenticates with
    /// USERNAME/PASSWORD only.
    pub cert_ident: Option<(String, String)>,
    pub cert_hosts: Vec<CertHost>,

    /// Raw `NOTIFYMSG <event> <template>` overrides, applied to the
    /// notification table by the coordinator.
    pub notify_messages: Vec<(String, String)>,
    /// Raw `NOTIFYFLAG <event> <flags>` overrides.
    pub notify_flags: Vec<(String, String)>,

    /// How many directive lines were unusable (logged, not fatal).
    pub parse_errors: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            monitors: Vec::new(),
            minsupplies: 1,
            shutdowncmd: None,
            notifycmd: None,
            pollfreq: 5,
            pollfreqalert: 5,
            hostsync: 15,
            deadtime: 15,
            offduration: 30,
            rbwarntime: 43200,
            nocommwarntime: 300,
            finaldelay: 5,
            pollfail_log_throttle_max: -1,
            shutdownexit: ShutdownExit::Immediate,
            powerdownflag: None,
            run_as_user: None,
            debug_min: None,
            cert_path: None,
            cert_verify: false,
            force_ssl: false,
            cert_ident: None,
            cert_hosts: Vec::new(),
            notify_messages: Vec::new(),
            notify_flags: Vec::new(),
            parse_errors: 0,
        }
    }
}

/// Cut an unquoted `#` comment off a config line, honouring the codec's
/// quoting and escape rules.
fn strip_comment(line: &str) -> &str {
    let mut in_quote = false;
    let mut escaped = false;

    for (idx, ch) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '"' => in_quote = !in_quote,
            '#' if !in_quote => return &line[..idx],
            _ => {}
        }
    }

    line
}

impl MonitorConfig {
    /// Parse the config file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut cfg = Self::default();

        for (lineno, raw_line) in text.lines().enumerate() {
            let lineno = lineno + 1;
            let line = strip_comment(raw_line);

            let args = match words::split(line) {
                Ok(args) => args,
                Err(e) => {
                    log::error!("Parse error: {}:{lineno}: {e}", path.display());
                    cfg.parse_errors += 1;
                    continue;
                }
            };

            if args.is_empty() {
                continue;
            }

            if !cfg.parse_directive(&args, path, lineno)? {
                log::warn!(
                    "{}:{lineno}: invalid directive: {}",
                    path.display(),
                    args.join(" ")
                );
                cfg.parse_errors += 1;
            }
        }

        if cfg.parse_errors > 0 {
            log::error!(
                "Encountered {} config errors, those entries were ignored",
                cfg.parse_errors
            );
        }

        Ok(cfg)
    }

    /// Handle one directive. Returns false when the directive is not
    /// recognised or malformed; hard errors bubble as `Err`.
    fn parse_directive(
        &mut self,
        args: &[String],
        path: &Path,
        lineno: usize,
    ) -> Result<bool, ConfigError> {
        let Some(name) = args.first().map(String::as_str) else {
            return Ok(false);
        };

        // directives taking a single value
        if args.len() >= 2 {
            let value = &args[1];
            match name {
                "SHUTDOWNCMD" => {
                    self.shutdowncmd = Some(value.clone());
                    return Ok(true);
                }
                "NOTIFYCMD" => {
                    self.notifycmd = Some(value.clone());
                    return Ok(true);
                }
                "POWERDOWNFLAG" => {
                    self.powerdownflag = Some(PathBuf::from(value));
                    return Ok(true);
                }
                "RUN_AS_USER" => {
                    self.run_as_user = Some(value.clone());
                    return Ok(true);
                }
                "CERTPATH" => {
                    self.cert_path = Some(PathBuf::from(value));
                    return Ok(true);
                }
                "CERTVERIFY" => {
                    self.cert_verify = value == "1";
                    return Ok(true);
                }
                "FORCESSL" => {
                    self.force_ssl = value == "1";
                    return Ok(true);
                }
                "SHUTDOWNEXIT" => {
                    self.shutdownexit = ShutdownExit::parse(value);
                    return Ok(true);
                }
                "MINSUPPLIES" => {
                    match value.parse::<u32>() {
                        Ok(n) => self.minsupplies = n,
                        Err(_) => log::warn!("Ignoring invalid MINSUPPLIES value: {value}"),
                    }
                    return Ok(true);
                }
                "POLLFREQ" => {
                    match value.parse::<u64>() {
                        Ok(n) => self.pollfreq = n,
                        Err(_) => log::warn!("Ignoring invalid POLLFREQ value: {value}"),
                    }
                    return Ok(true);
                }
                "POLLFREQALERT" => {
                    match value.parse::<u64>() {
                        Ok(n) => self.pollfreqalert = n,
                        Err(_) => log::warn!("Ignoring invalid POLLFREQALERT value: {value}"),
                    }
                    return Ok(true);
                }
                "POLLFAIL_LOG_THROTTLE_MAX" => {
                    match value.parse::<i32>() {
                        Ok(n) if n >= 0 && n != i32::MAX => self.pollfail_log_throttle_max = n,
                        _ => log::warn!("Ignoring invalid POLLFAIL_LOG_THROTTLE_MAX value: {value}"),
                    }
                    return Ok(true);
                }
                "OFFDURATION" => {
                    match value.parse::<i64>() {
                        Ok(n) => self.offduration = n,
                        Err(_) => log::warn!("Ignoring invalid OFFDURATION value: {value}"),
                    }
                    return Ok(true);
                }
                "HOSTSYNC" => {
                    match value.parse::<i64>() {
                        Ok(n) => self.hostsync = n,
                        Err(_) => log::warn!("Ignoring invalid HOSTSYNC value: {value}"),
                    }
                    return Ok(true);
                }
                "DEADTIME" => {
                    match value.parse::<i64>() {
                        Ok(n) => self.deadtime = n,
                        Err(_) => log::warn!("Ignoring invalid DEADTIME value: {value}"),
                    }
                    return Ok(true);
                }
                "RBWARNTIME" => {
                    match value.parse::<i64>() {
                        Ok(n) => self.rbwarntime = n,
                        Err(_) => log::warn!("Ignoring invalid RBWARNTIME value: {value}"),
                    }
                    return Ok(true);
                }
                "NOCOMMWARNTIME" => {
                    match value.parse::<i64>() {
                        Ok(n) => self.nocommwarntime = n,
                        Err(_) => log::warn!("Ignoring invalid NOCOMMWARNTIME value: {value}"),
                    }
                    return Ok(true);
                }
                "FINALDELAY" => {
                    match value.parse::<u64>() {
                        Ok(n) => self.finaldelay = n,
                        Err(_) => log::warn!("Ignoring invalid FINALDELAY value: {value}"),
                    }
                    return Ok(true);
                }
                _ if name.eq_ignore_ascii_case("DEBUG_MIN") => {
                    match value.parse::<u8>() {
                        Ok(n) => self.debug_min = Some(n),
                        Err(_) => log::warn!("Invalid DEBUG_MIN value in config global settings"),
                    }
                    return Ok(true);
                }
                _ => {}
            }
        }

        // directives taking two values
        if args.len() >= 3 {
            match name {
                "NOTIFYMSG" => {
                    self.notify_messages.push((args[1].clone(), args[2].clone()));
                    return Ok(true);
                }
                "NOTIFYFLAG" => {
                    self.notify_flags.push((args[1].clone(), args[2].clone()));
                    return Ok(true);
                }
                "CERTIDENT" => {
                    self.cert_ident = Some((args[1].clone(), args[2].clone()));
                    return Ok(true);
                }
                _ => {}
            }
        }

        // directives taking four or more values
        if args.len() >= 5 {
            if name == "CERTHOST" {
                self.cert_hosts.push(CertHost {
                    hostname: args[1].clone(),
                    certname: args[2].clone(),
                    verify: args[3] == "1",
                    force_tls: args[4] == "1",
                });
                return Ok(true);
            }
        }

        if name == "MONITOR" {
            // old style: <sys> <pv> <pass> <role> - no username
            if args.len() == 5 {
                log::error!("Unable to use old-style MONITOR line without a username");
                log::error!("Convert it and add a username to the server's user table - see the documentation");
                return Err(ConfigError::OldStyleMonitor {
                    path: path.to_path_buf(),
                    line: lineno,
                });
            }

            if args.len() < 6 {
                log::warn!("MONITOR configuration directives require five arguments");
                return Ok(false);
            }

            let sys = args[1].clone();

            let identity = match UpsIdentity::parse(&sys) {
                Ok(identity) => identity,
                Err(e) => {
                    log::error!("Error: unable to split UPS name [{sys}]: {e}");
                    return Ok(false);
                }
            };

            let power_value = match args[2].parse::<u32>() {
                Ok(pv) => pv,
                Err(_) => {
                    log::warn!("UPS [{sys}]: ignoring invalid power value [{}]", args[2]);
                    return Ok(false);
                }
            };

            let Some(role) = Role::parse(&args[5]) else {
                log::warn!("UPS [{sys}]: invalid role [{}]", args[5]);
                return Ok(false);
            };

            self.monitors.push(MonitorDirective {
                sys,
                identity,
                power_value,
                username: args[3].clone(),
                password: args[4].clone(),
                role,
            });
            return Ok(true);
        }

        Ok(false)
    }

    /// Sum of power values over all MONITOR directives.
    pub fn total_power_value(&self) -> u32 {
        self.monitors.iter().map(|m| m.power_value).sum()
    }

    /// The startup/reload sanity check: the configured supplies must be
    /// able to satisfy MINSUPPLIES at all.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let total = self.total_power_value();
        if total < self.minsupplies {
            return Err(ConfigError::InsufficientPower {
                total,
                min: self.minsupplies,
            });
        }
        Ok(())
    }

    /// The tracker-facing view of the configured intervals.
    pub fn timing(&self) -> Timing {
        Timing {
            hostsync: self.hostsync,
            deadtime: self.deadtime,
            offduration: self.offduration,
            rbwarntime: self.rbwarntime,
            nocommwarntime: self.nocommwarntime,
        }
    }

    /// The client-facing TLS policy.
    pub fn tls_policy(&self) -> TlsPolicy {
        let mut policy = TlsPolicy {
            cert_path: self.cert_path.clone(),
            verify: self.cert_verify,
            force_tls: self.force_ssl,
            ..Default::default()
        };
        for host in &self.cert_hosts {
            policy.add_host(&host.hostname, &host.certname, host.verify, host.force_tls);
        }
        policy
    }
}
