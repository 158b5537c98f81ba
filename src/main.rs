use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vpn_failover::{
    Credentials, FileConfig, Overrides, Router, RouterConfig, RouterError, SystemRunner,
    DEFAULT_CONFIG_PATH,
};

/// VPN Failover - WAN failover, tunnel watchdog and kill-switch
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
struct Args {
    /// Path to configuration file
    #[clap(long)]
    config: Option<PathBuf>,

    /// Tunnel interface (e.g., wg0)
    #[clap(short = 't', long)]
    tunnel: Option<String>,

    /// LAN interface whose forwarded traffic must use the tunnel; repeatable
    #[clap(short = 'l', long = "lan")]
    lan: Vec<String>,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run the watchdog until interrupted (default)
    Run {
        /// Remove the kill-switch on exit, allowing traffic outside the tunnel
        #[clap(long)]
        release_firewall: bool,
    },
    /// Run a single watchdog tick and print the resulting status
    Once,
    /// Observe and print the current status
    Status,
    /// Start the tunnel, optionally activating a profile first
    Start { profile: Option<String> },
    /// Stop the tunnel and keep it down until the next start
    Stop,
    /// Restart the tunnel
    Restart,
    /// Make a stored profile the active one
    Activate { profile: String },
    /// Import a profile from a WireGuard or OpenVPN configuration file
    Import {
        name: String,
        file: PathBuf,
        /// OpenVPN username
        #[clap(long, requires = "password")]
        username: Option<String>,
        /// OpenVPN password
        #[clap(long, requires = "username")]
        password: Option<String>,
    },
    /// Delete a stored profile
    Delete { profile: String },
    /// List stored profiles
    Profiles,
    /// Show or change watchdog settings
    Settings {
        #[clap(subcommand)]
        action: Option<SettingsAction>,
    },
}

#[derive(Subcommand, Debug, Clone)]
enum SettingsAction {
    Show,
    Set {
        /// Host pinged through the tunnel
        #[clap(long)]
        ping_target: Option<String>,
        /// Seconds between watchdog ticks (10-300)
        #[clap(long)]
        interval: Option<u64>,
        /// Consecutive failures before backing off or restarting
        #[clap(long)]
        failure_threshold: Option<u32>,
    },
}

impl Command {
    /// Everything except showing settings touches the lifecycle lock, the
    /// firewall or the mode 700 profile directory
    fn needs_root(&self) -> bool {
        !matches!(
            self,
            Command::Settings {
                action: None | Some(SettingsAction::Show)
            }
        )
    }
}

fn log_with_timestamp(msg: &str) {
    info!("[{}] {}", Local::now().format("%Y-%m-%d %H:%M:%S"), msg);
}

fn require_root() -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    if unsafe { libc::geteuid() } != 0 {
        return Err(RouterError::InsufficientPermissions.into());
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<RouterConfig> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let file = FileConfig::read(&config_path)
        .context(format!("Failed to read config file {:?}", config_path))?;
    if file.is_none() {
        log_with_timestamp(
            "Configuration file does not exist, using command line arguments and defaults",
        );
    }
    let overrides = Overrides {
        tunnel_interface: args.tunnel.clone(),
        lan_interfaces: (!args.lan.is_empty()).then(|| args.lan.clone()),
    };
    Ok(RouterConfig::resolve(file, overrides).context("Invalid configuration")?)
}

fn run(router: &Router, release_firewall: bool) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("Failed to install signal handler")?;

    log_with_timestamp("Starting VPN failover watchdog");
    info!("Settings: {:?}", router.get_settings());
    router.watchdog().run(&shutdown);

    if release_firewall {
        warn!("Releasing kill-switch, LAN traffic may now bypass the tunnel");
        router.release_kill_switch().context("Failed to release kill-switch")?;
    }
    log_with_timestamp("Shutdown complete");
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    // For detailed debug logging, set RUST_LOG=debug

    let args = Args::parse();
    let command = args.command.clone().unwrap_or(Command::Run {
        release_firewall: false,
    });
    if command.needs_root() {
        require_root()?;
    }

    let config = load_config(&args)?;
    info!(
        "Tunnel: {}, LAN: {:?}, WAN: {}",
        config.tunnel_interface,
        config.lan_interfaces,
        if config.wan_interfaces.is_empty() {
            "auto-detect".to_string()
        } else {
            format!("{:?}", config.wan_interfaces)
        }
    );
    let router =
        Router::new(&config, Arc::new(SystemRunner)).context("Failed to initialise router")?;

    match command {
        Command::Run { release_firewall } => run(&router, release_firewall)?,
        Command::Once => {
            let outcome = router.watchdog().tick();
            info!("Tick outcome: {:?}", outcome);
            println!("{}", router.get_status().summary());
        }
        Command::Status => {
            let status = router.probe().context("Failed to observe status")?;
            println!("{}", status.summary());
            if status.no_profile_configured() {
                println!("No VPN profile configured; import one with `vpn-failover import`");
            }
        }
        Command::Start { profile } => router
            .request_start(profile.as_deref())
            .context("Start failed")?,
        Command::Stop => router.request_stop().context("Stop failed")?,
        Command::Restart => router.request_restart().context("Restart failed")?,
        Command::Activate { profile } => {
            let activated = router.request_activate(&profile).context("Activate failed")?;
            println!("Active profile: {} ({:?})", activated.name, activated.kind);
        }
        Command::Import {
            name,
            file,
            username,
            password,
        } => {
            let contents = std::fs::read_to_string(&file)
                .context(format!("Failed to read profile {:?}", file))?;
            let credentials = match (username, password) {
                (Some(username), Some(password)) => Some(Credentials { username, password }),
                _ => None,
            };
            let profile = router
                .import_profile(&name, &contents, credentials.as_ref())
                .context("Import failed")?;
            println!("Imported {} ({:?})", profile.name, profile.kind);
        }
        Command::Delete { profile } => router.delete_profile(&profile).context("Delete failed")?,
        Command::Profiles => {
            for entry in router.list_profiles()? {
                let marker = if entry.active { "*" } else { " " };
                println!("{} {} ({:?})", marker, entry.profile.name, entry.profile.kind);
            }
        }
        Command::Settings { action } => match action {
            None | Some(SettingsAction::Show) => {
                let s = router.get_settings();
                println!(
                    "ping_target={} check_interval={}s failure_threshold={}",
                    s.ping_target, s.check_interval_secs, s.failure_threshold
                );
            }
            Some(SettingsAction::Set {
                ping_target,
                interval,
                failure_threshold,
            }) => {
                if ping_target.is_none() && interval.is_none() && failure_threshold.is_none() {
                    bail!(
                        "Nothing to change; pass --ping-target, --interval or --failure-threshold"
                    );
                }
                let current = router.get_settings();
                if ping_target.is_some() || interval.is_some() {
                    router.update_settings(
                        ping_target.as_deref().unwrap_or(&current.ping_target),
                        interval.unwrap_or(current.check_interval_secs),
                    )?;
                }
                if let Some(threshold) = failure_threshold {
                    router.update_failure_threshold(threshold)?;
                }
                log_with_timestamp("Settings updated");
            }
        },
    }
    Ok(())
}
