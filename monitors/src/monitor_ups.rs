//! # `monitor_ups`: UPS Monitoring & Shutdown Daemon
//!
//! Polls one or more UPS status servers over their line-oriented TCP
//! protocol and, when the available power drops below the configured
//! minimum, coordinates an orderly shutdown of this host and of any
//! peers monitoring the same supplies.
//!
//! ## Key Features:
//! - **Power-budget accounting**: every `MONITOR` entry carries a power
//!   value; the host goes down only when the sum over healthy supplies
//!   falls below `MINSUPPLIES`.
//! - **Primary/secondary coordination**: a primary raises FSD on the
//!   server and waits (up to `HOSTSYNC`) for secondaries to log out.
//! - **Privilege split**: a root parent that only runs `SHUTDOWNCMD`,
//!   an unprivileged child that does everything else.
//! - **Operator control**: `-c fsd|reload|stop` signals the running
//!   instance; `-K` probes the power-down flag for shutdown scripts.
//!
//! ## Usage
//!
//! ```bash
//! monitor_ups -f /etc/monitor_ups.conf
//!
//! # Reload a running instance
//! monitor_ups -c reload
//!
//! # From a late-shutdown script: was this a power-fail shutdown?
//! monitor_ups -K && /sbin/ups-killpower
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use lib_upslink::client::ConnectFlags;
use lib_upslink::configs::{ConfigError, MonitorConfig};
use lib_upslink::monitor::{debug_level, pidfile, powerflag, privilege, Monitor, SignalFlags};
use lib_upslink::monitor::pidfile::InstanceCommand;

const DEFAULT_CONFIG: &str = "/etc/monitor_ups.conf";
const DEFAULT_RUN_AS_USER: &str = "nobody";

/// # Command Line Arguments
///
/// Defines the command-line arguments and options for the monitor,
/// using `clap` for parsing and help generation.
#[derive(Parser, Debug)]
#[command(
    name = "monitor_ups",
    about = "Monitors UPS servers and may initiate a shutdown if necessary",
    version
)]
struct Args {
    /// Use an alternate configuration file.
    #[arg(short = 'f', long = "config", value_name = "FILE", default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Send a command to the running instance: fsd, reload or stop.
    #[arg(short = 'c', value_name = "COMMAND")]
    command: Option<String>,

    /// Send the command to this PID, bypassing the PID file.
    #[arg(short = 'P', value_name = "PID", requires = "command")]
    pid: Option<libc::pid_t>,

    /// Check the power-down flag; exit 0 if it is set.
    #[arg(short = 'K')]
    check_flag: bool,

    /// Always run privileged: disable the parent/child privilege split.
    #[arg(short = 'p')]
    privileged: bool,

    /// Run the unprivileged child as this user (ignored with -p).
    #[arg(short = 'u', value_name = "USER")]
    user: Option<String>,

    /// Raise debug verbosity; may be given more than once.
    #[arg(short = 'D', action = ArgAction::Count)]
    debug: u8,

    /// Use IPv4 addresses only.
    #[arg(short = '4', conflicts_with = "ipv6")]
    ipv4: bool,

    /// Use IPv6 addresses only.
    #[arg(short = '6')]
    ipv6: bool,
}

/// Configure the `fern` logger to write to standard error and, for the
/// long-running daemon, a log file. Messages carry a timestamp, target
/// and level. The effective level starts from the `-D` count and may be
/// raised by `DEBUG_MIN` once the config is loaded.
fn setup_logging(level: log::LevelFilter, with_file: bool) -> Result<()> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log::LevelFilter::Trace)
        .chain(std::io::stderr());

    if with_file {
        dispatch = dispatch.chain(fern::log_file("monitor_ups.log")?);
    }

    dispatch.apply().context("logger already initialized")?;
    log::set_max_level(level);
    Ok(())
}

/// Handle `-c` / `-P`: signal the running instance and exit.
fn signal_running_instance(args: &Args, pidpath: &std::path::Path) -> ! {
    let word = args.command.as_deref().unwrap_or_default();
    let Some(cmd) = InstanceCommand::parse(word) else {
        log::error!("Unknown command [{word}]; expected fsd, reload or stop");
        std::process::exit(1);
    };

    let result = match args.pid {
        Some(pid) => pidfile::signal_pid(pid, Some(cmd)),
        None => pidfile::signal_instance(pidpath, Some(cmd)),
    };

    match result {
        Ok(()) => {
            log::debug!("Signaled running daemon OK");
            std::process::exit(0);
        }
        Err(e) => {
            log::error!("Failed to signal the currently running daemon (if any): {e}");
            if args.pid.is_none() {
                log::info!("Try adding a '-P <pid>' argument");
            }
            std::process::exit(1);
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let cli_level = debug_level(args.debug);
    let quick_path = args.command.is_some() || args.check_flag;
    setup_logging(cli_level, !quick_path).context("Failed to initialize logging")?;

    let pidpath = pidfile::default_path("monitor_ups");

    if args.command.is_some() {
        signal_running_instance(&args, &pidpath);
    }

    let mut cfg =
        MonitorConfig::load(&args.config).context("Fatal error: unusable configuration")?;

    // the config may raise, never lower, the verbosity
    if let Some(min) = cfg.debug_min {
        log::set_max_level(cli_level.max(debug_level(min)));
    }

    if args.check_flag {
        std::process::exit(powerflag::check(cfg.powerdownflag.as_deref()));
    }

    if cfg.shutdowncmd.is_none() {
        println!("Warning: no shutdown command defined!");
    }

    // get rid of a flag left over from a previous shutdown; a path with
    // foreign contents is left alone and disabled for this run
    if !powerflag::clear(cfg.powerdownflag.as_deref()) {
        cfg.powerdownflag = None;
    }

    if let Err(e @ ConfigError::InsufficientPower { .. }) = cfg.validate() {
        println!("\nFatal error: insufficient power configured!\n");
        println!("Sum of power values........: {}", cfg.total_power_value());
        println!("Minimum value (MINSUPPLIES): {}", cfg.minsupplies);
        println!("\nEdit your configuration and change the values.");
        log::error!("{e}");
        std::process::exit(1);
    }

    if pidfile::instance_running(&pidpath) {
        println!("Fatal error: a previous monitor_ups instance is already running!");
        println!("Either stop the previous instance first, or use the 'reload' command.");
        std::process::exit(1);
    }

    let af_flags = if args.ipv4 {
        ConnectFlags::IPV4_ONLY
    } else if args.ipv6 {
        ConnectFlags::IPV6_ONLY
    } else {
        ConnectFlags::empty()
    };

    // privilege split: the parent stays root and waits for the one-byte
    // shutdown trigger, the child drops privileges and runs the loop
    let pipe = if args.privileged {
        log::info!("Warning: running as one big root process by request (monitor_ups -p)");
        if let Err(e) = pidfile::write(&pidpath) {
            log::error!("Fatal error: can't create PID file {}: {e}", pidpath.display());
            std::process::exit(1);
        }
        None
    } else {
        let pipe = privilege::start_split(cfg.shutdowncmd.clone(), cfg.powerdownflag.clone())
            .context("privilege split failed")?;

        // write the PID now, we are about to lose root
        if let Err(e) = pidfile::write(&pidpath) {
            log::error!("Fatal error: can't create PID file {}: {e}", pidpath.display());
            std::process::exit(1);
        }

        let run_as = args
            .user
            .clone()
            .or_else(|| cfg.run_as_user.clone())
            .unwrap_or_else(|| DEFAULT_RUN_AS_USER.to_string());
        if let Err(e) = privilege::drop_privileges(&run_as) {
            log::error!("Fatal error: can't become user {run_as}: {e}");
            std::process::exit(1);
        }

        Some(pipe)
    };

    // single-threaded cooperative: the coordinator loop is the only
    // mutator of monitoring state
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build the async runtime")?;

    let exit_code = runtime.block_on(async {
        let signals = SignalFlags::new();
        if let Err(e) = signals.install() {
            log::error!("Fatal error: can't install signal handlers: {e}");
            return 1;
        }

        let mut monitor = Monitor::new(
            args.config.clone(),
            cfg,
            signals,
            pipe,
            af_flags,
            cli_level,
        );

        monitor.run().await
    });

    pidfile::remove(&pidpath);
    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn cli_parses_the_daemon_surface() {
        let args = Args::try_parse_from([
            "monitor_ups",
            "-f",
            "/tmp/test.conf",
            "-D",
            "-D",
            "-p",
            "-u",
            "upsuser",
            "-4",
        ])
        .unwrap();

        assert_eq!(args.config, PathBuf::from("/tmp/test.conf"));
        assert_eq!(args.debug, 2);
        assert!(args.privileged);
        assert_eq!(args.user.as_deref(), Some("upsuser"));
        assert!(args.ipv4);
        assert!(!args.ipv6);
    }

    #[test]
    fn cli_rejects_conflicting_address_families() {
        assert!(Args::try_parse_from(["monitor_ups", "-4", "-6"]).is_err());
    }

    #[test]
    fn pid_targeting_requires_a_command() {
        assert!(Args::try_parse_from(["monitor_ups", "-P", "1234"]).is_err());
        assert!(Args::try_parse_from(["monitor_ups", "-c", "stop", "-P", "1234"]).is_ok());
    }
}
