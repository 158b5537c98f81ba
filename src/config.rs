//! Static deployment configuration.
//!
//! Values come from the command line, then `/etc/vpn-failover/config.toml`,
//! then the defaults below.

use crate::errors::{RouterError, RouterResult};
use crate::exec::validate_interface_name;
use crate::wan::WanInterface;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/vpn-failover/config.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FileConfig {
    pub tunnel: Option<TunnelSection>,
    pub interfaces: Option<InterfaceSection>,
    pub paths: Option<PathSection>,
    pub timeouts: Option<TimeoutSection>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TunnelSection {
    pub interface: Option<String>,
    pub handshake_timeout: Option<u64>,
    pub stall_ticks: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct InterfaceSection {
    pub lan: Option<Vec<String>>,
    pub wan: Option<Vec<WanInterface>>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PathSection {
    pub profiles: Option<PathBuf>,
    pub pointer_dir: Option<PathBuf>,
    pub settings: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TimeoutSection {
    pub command: Option<u64>,
    pub start: Option<u64>,
    pub stop: Option<u64>,
    pub lock_wait: Option<u64>,
    pub ping_ms: Option<u64>,
}

impl FileConfig {
    pub fn read(path: &Path) -> RouterResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Some(toml::from_str(&content)?))
    }
}

/// Command line values that override the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub tunnel_interface: Option<String>,
    pub lan_interfaces: Option<Vec<String>>,
}

/// Resolved configuration of one router
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub tunnel_interface: String,
    pub lan_interfaces: Vec<String>,
    /// Empty means auto-detect
    pub wan_interfaces: Vec<WanInterface>,
    pub profiles_dir: PathBuf,
    /// Directory holding the active-profile link `<tunnel_interface>.conf`
    pub pointer_dir: PathBuf,
    pub settings_path: PathBuf,
    /// Lock file and operator intent; `None` keeps both in memory
    pub state_dir: Option<PathBuf>,
    pub command_timeout: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub poll_interval: Duration,
    pub handshake_timeout: Duration,
    pub stall_ticks: u32,
    pub lock_wait: Duration,
    pub ping_timeout_ms: u64,
    /// Granularity of the watchdog's interruptible sleep
    pub sleep_slice: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            tunnel_interface: "wg0".to_string(),
            lan_interfaces: vec!["br0".to_string()],
            wan_interfaces: Vec::new(),
            profiles_dir: PathBuf::from("/etc/vpn-failover/profiles"),
            pointer_dir: PathBuf::from("/etc/wireguard"),
            settings_path: PathBuf::from("/etc/vpn-failover/settings.toml"),
            state_dir: Some(PathBuf::from("/run/vpn-failover")),
            command_timeout: Duration::from_secs(10),
            start_timeout: Duration::from_secs(20),
            stop_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(180),
            stall_ticks: 3,
            lock_wait: Duration::from_secs(30),
            ping_timeout_ms: 2000,
            sleep_slice: Duration::from_secs(1),
        }
    }
}

impl RouterConfig {
    /// Merge with precedence: overrides -> file -> defaults
    pub fn resolve(file: Option<FileConfig>, overrides: Overrides) -> RouterResult<Self> {
        let file = file.unwrap_or_default();
        let tunnel = file.tunnel.unwrap_or_default();
        let interfaces = file.interfaces.unwrap_or_default();
        let paths = file.paths.unwrap_or_default();
        let timeouts = file.timeouts.unwrap_or_default();
        let d = RouterConfig::default();
        let secs =
            |v: Option<u64>, default: Duration| v.map(Duration::from_secs).unwrap_or(default);

        let config = RouterConfig {
            tunnel_interface: overrides
                .tunnel_interface
                .or(tunnel.interface)
                .unwrap_or(d.tunnel_interface),
            lan_interfaces: overrides
                .lan_interfaces
                .or(interfaces.lan)
                .unwrap_or(d.lan_interfaces),
            wan_interfaces: interfaces.wan.unwrap_or(d.wan_interfaces),
            profiles_dir: paths.profiles.unwrap_or(d.profiles_dir),
            pointer_dir: paths.pointer_dir.unwrap_or(d.pointer_dir),
            settings_path: paths.settings.unwrap_or(d.settings_path),
            state_dir: paths.state_dir.or(d.state_dir),
            command_timeout: secs(timeouts.command, d.command_timeout),
            start_timeout: secs(timeouts.start, d.start_timeout),
            stop_timeout: secs(timeouts.stop, d.stop_timeout),
            poll_interval: d.poll_interval,
            handshake_timeout: secs(tunnel.handshake_timeout, d.handshake_timeout),
            stall_ticks: tunnel.stall_ticks.unwrap_or(d.stall_ticks),
            lock_wait: secs(timeouts.lock_wait, d.lock_wait),
            ping_timeout_ms: timeouts.ping_ms.unwrap_or(d.ping_timeout_ms),
            sleep_slice: d.sleep_slice,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RouterResult<()> {
        validate_interface_name(&self.tunnel_interface)
            .map_err(|e| RouterError::InvalidConfiguration(e.to_string()))?;
        if self.lan_interfaces.is_empty() {
            return Err(RouterError::InvalidConfiguration(
                "at least one LAN interface is required".into(),
            ));
        }
        for lan in &self.lan_interfaces {
            validate_interface_name(lan)
                .map_err(|e| RouterError::InvalidConfiguration(e.to_string()))?;
            if *lan == self.tunnel_interface {
                return Err(RouterError::InvalidConfiguration(format!(
                    "{} is both LAN and tunnel",
                    lan
                )));
            }
        }
        for wan in &self.wan_interfaces {
            validate_interface_name(&wan.name)
                .map_err(|e| RouterError::InvalidConfiguration(e.to_string()))?;
            if self.lan_interfaces.contains(&wan.name) || wan.name == self.tunnel_interface {
                return Err(RouterError::InvalidConfiguration(format!(
                    "{} cannot be a WAN candidate",
                    wan.name
                )));
            }
        }
        if self.stall_ticks == 0 {
            return Err(RouterError::InvalidConfiguration("stall_ticks must be at least 1".into()));
        }
        Ok(())
    }

    pub fn pointer_path(&self) -> PathBuf {
        self.pointer_dir.join(format!("{}.conf", self.tunnel_interface))
    }

    /// Worst case a single tick can spend blocked on commands
    pub fn tick_budget(&self) -> Duration {
        self.start_timeout * 2
            + self.stop_timeout
            + self.command_timeout * 8
            + Duration::from_millis(self.ping_timeout_ms)
    }
}
