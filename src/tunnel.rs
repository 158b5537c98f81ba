//! VPN tunnel lifecycle.
//!
//! ```text
//! Down --start--> Starting --up+addressed--> Up(Healthy | Stale)
//!                    |                          |
//!                    +--timeout / exit!=0--> Failed      Up --stop--> Stopping --> Down
//! ```
//!
//! `NoProfile` is reported instead of `Down`/`Failed` when the active pointer
//! resolves to nothing; it is structural and never retried on its own.

use crate::errors::{RouterError, RouterResult};
use crate::exec::{args, CommandRunner};
use crate::network::InterfaceInspector;
use crate::profiles::{ProfileStore, ProtocolKind, TunnelProfile};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelLifecycle {
    Down,
    Starting,
    Up(Health),
    Stopping,
    Failed(String),
    NoProfile,
}

impl TunnelLifecycle {
    pub fn label(&self) -> &'static str {
        match self {
            TunnelLifecycle::Down => "down",
            TunnelLifecycle::Starting => "starting",
            TunnelLifecycle::Up(Health::Healthy) => "healthy",
            TunnelLifecycle::Up(Health::Stale) => "stale",
            TunnelLifecycle::Stopping => "stopping",
            TunnelLifecycle::Failed(_) => "failed",
            TunnelLifecycle::NoProfile => "no profile configured",
        }
    }
}

/// Snapshot of the tunnel interface, recomputed on every observation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelState {
    pub interface_up: bool,
    pub addresses: Vec<Ipv4Addr>,
    /// `None` when no handshake ever completed or the protocol has none
    pub handshake_age: Option<Duration>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub endpoint: Option<String>,
}

impl TunnelState {
    /// Endpoint address, when it is a literal IPv4 address
    pub fn endpoint_ipv4(&self) -> Option<Ipv4Addr> {
        let endpoint = self.endpoint.as_deref()?;
        match endpoint.parse::<SocketAddr>() {
            Ok(SocketAddr::V4(addr)) => Some(*addr.ip()),
            Ok(_) => None,
            Err(_) => match endpoint.parse::<IpAddr>() {
                Ok(IpAddr::V4(ip)) => Some(ip),
                _ => None,
            },
        }
    }
}

/// Timing and naming knobs for the tunnel controller
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub interface: String,
    pub command_timeout: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub poll_interval: Duration,
    /// Handshake age at which an up tunnel counts as stale
    pub handshake_timeout: Duration,
    /// Consecutive watchdog ticks with unchanged counters before stale
    pub stall_ticks: u32,
    /// Where OpenVPN pid files go
    pub run_dir: PathBuf,
    /// File recording which profile the tunnel was started with, so other
    /// processes stop and observe the right protocol. In memory when unset.
    pub running_record: Option<PathBuf>,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        TunnelOptions {
            interface: "wg0".to_string(),
            command_timeout: Duration::from_secs(10),
            start_timeout: Duration::from_secs(20),
            stop_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(180),
            stall_ticks: 3,
            run_dir: PathBuf::from("/run/vpn-failover"),
            running_record: None,
        }
    }
}

/// The profile a tunnel was brought up with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningTunnel {
    pub name: String,
    pub kind: ProtocolKind,
}

impl From<&TunnelProfile> for RunningTunnel {
    fn from(profile: &TunnelProfile) -> Self {
        RunningTunnel {
            name: profile.name.clone(),
            kind: profile.kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    Failed(String),
}

pub struct TunnelController {
    runner: Arc<dyn CommandRunner>,
    inspector: InterfaceInspector,
    store: ProfileStore,
    opts: TunnelOptions,
    phase: Phase,
    running: Option<RunningTunnel>,
    started_at: Option<Instant>,
    last_counters: Option<(u64, u64)>,
    stalled: u32,
}

impl TunnelController {
    pub fn new(runner: Arc<dyn CommandRunner>, store: ProfileStore, opts: TunnelOptions) -> Self {
        let inspector = InterfaceInspector::new(runner.clone(), opts.command_timeout);
        TunnelController {
            runner,
            inspector,
            store,
            opts,
            phase: Phase::Idle,
            running: None,
            started_at: None,
            last_counters: None,
            stalled: 0,
        }
    }

    pub fn interface(&self) -> &str {
        &self.opts.interface
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    /// Swap the active pointer; the running tunnel is left alone
    pub fn activate(&mut self, name: &str) -> RouterResult<TunnelProfile> {
        let profile = self.store.activate(name)?;
        self.phase = Phase::Idle;
        Ok(profile)
    }

    fn active_profile(&self) -> RouterResult<Option<TunnelProfile>> {
        match self.store.active() {
            Ok(profile) => Ok(profile),
            Err(RouterError::ProfileNotFound(name)) => {
                warn!("Active pointer targets missing profile {}", name);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Profile the tunnel was last started with, if it is still up
    pub fn running(&self) -> Option<RunningTunnel> {
        let Some(path) = &self.opts.running_record else {
            return self.running.clone();
        };
        match fs::read_to_string(path) {
            Ok(body) => match toml::from_str(&body) {
                Ok(running) => Some(running),
                Err(e) => {
                    warn!("Ignoring unreadable {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Could not read {}: {}", path.display(), e);
                self.running.clone()
            }
        }
    }

    fn set_running(&mut self, running: Option<RunningTunnel>) {
        self.running = running.clone();
        let Some(path) = &self.opts.running_record else {
            return;
        };
        let result = match &running {
            Some(running) => write_record(path, running),
            None => match fs::remove_file(path) {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
        };
        if let Err(e) = result {
            warn!("Could not update {}: {}", path.display(), e);
        }
    }

    /// Protocol of an interface nobody recorded, judged from the host
    fn detect_kind(&self) -> Option<ProtocolKind> {
        let wg = self.runner.run(
            "wg",
            &args(["show", &self.opts.interface, "dump"]),
            self.opts.command_timeout,
        );
        if matches!(wg, Ok(ref output) if output.success()) {
            Some(ProtocolKind::WireGuard)
        } else if self.pid_file().exists() {
            Some(ProtocolKind::OpenVpn)
        } else {
            None
        }
    }

    fn pid_file(&self) -> PathBuf {
        self.opts.run_dir.join(format!("openvpn-{}.pid", self.opts.interface))
    }

    fn reset_tracking(&mut self) {
        self.last_counters = None;
        self.stalled = 0;
    }

    /// Observe the tunnel and classify it without advancing stall detection
    pub fn observe(&mut self) -> RouterResult<(TunnelLifecycle, TunnelState)> {
        self.observe_with(false)
    }

    /// Observe the tunnel as one watchdog tick. Only these observations count
    /// towards `stall_ticks`.
    pub fn sample(&mut self) -> RouterResult<(TunnelLifecycle, TunnelState)> {
        self.observe_with(true)
    }

    fn observe_with(&mut self, count_stall: bool) -> RouterResult<(TunnelLifecycle, TunnelState)> {
        let profile = self.active_profile()?;
        let link = match self.inspector.link_state(&self.opts.interface) {
            Ok(link) => link,
            Err(RouterError::InterfaceNotFound(_)) => {
                self.reset_tracking();
                if self.running().is_some() {
                    debug!("Tunnel {} vanished, forgetting its profile", self.opts.interface);
                    self.set_running(None);
                }
                let lifecycle = match (&profile, &self.phase) {
                    (None, _) => TunnelLifecycle::NoProfile,
                    (Some(_), Phase::Failed(reason)) => TunnelLifecycle::Failed(reason.clone()),
                    (Some(_), Phase::Idle) => TunnelLifecycle::Down,
                };
                return Ok((lifecycle, TunnelState::default()));
            }
            Err(e) => return Err(e),
        };

        let mut state = TunnelState {
            interface_up: link.up,
            addresses: link.addresses,
            ..TunnelState::default()
        };
        let kind = match self.running() {
            Some(running) => Some(running.kind),
            None => self.detect_kind(),
        };
        match kind {
            Some(ProtocolKind::WireGuard) => self.read_wireguard(&mut state)?,
            _ => self.read_link_counters(&mut state)?,
        }

        self.phase = Phase::Idle;
        let lifecycle = TunnelLifecycle::Up(self.classify(kind, &state, count_stall));
        debug!("Tunnel {} is {:?}: {:?}", self.opts.interface, lifecycle, state);
        Ok((lifecycle, state))
    }

    fn classify(
        &mut self,
        kind: Option<ProtocolKind>,
        state: &TunnelState,
        count_stall: bool,
    ) -> Health {
        if count_stall {
            let counters = (state.rx_bytes, state.tx_bytes);
            if self.last_counters == Some(counters) {
                self.stalled += 1;
            } else {
                self.stalled = 0;
            }
            self.last_counters = Some(counters);
        }

        if !state.interface_up || state.addresses.is_empty() {
            return Health::Stale;
        }
        let in_grace = self
            .started_at
            .is_some_and(|t| t.elapsed() < self.opts.handshake_timeout);
        if in_grace {
            return Health::Healthy;
        }
        let handshake_stale = kind == Some(ProtocolKind::WireGuard)
            && state
                .handshake_age
                .map_or(true, |age| age >= self.opts.handshake_timeout);
        if handshake_stale || self.stalled >= self.opts.stall_ticks {
            Health::Stale
        } else {
            Health::Healthy
        }
    }

    fn read_wireguard(&self, state: &mut TunnelState) -> RouterResult<()> {
        let output = self.runner.run(
            "wg",
            &args(["show", &self.opts.interface, "dump"]),
            self.opts.command_timeout,
        )?;
        if !output.success() {
            return Err(RouterError::TunnelStatus(output.stderr.trim().to_string()));
        }
        let dump = parse_wg_dump(&output.stdout)?;
        let now = chrono::Utc::now().timestamp();
        state.handshake_age = dump
            .latest_handshake
            .map(|ts| Duration::from_secs(now.saturating_sub(ts).max(0).unsigned_abs()));
        state.rx_bytes = dump.rx_bytes;
        state.tx_bytes = dump.tx_bytes;
        state.endpoint = dump.endpoint;
        Ok(())
    }

    fn read_link_counters(&self, state: &mut TunnelState) -> RouterResult<()> {
        let output = self.runner.run(
            "ip",
            &args(["-s", "-o", "link", "show", "dev", &self.opts.interface]),
            self.opts.command_timeout,
        )?;
        if !output.success() {
            return Err(RouterError::TunnelStatus(output.stderr.trim().to_string()));
        }
        let (rx, tx) = parse_link_counters(&output.stdout);
        state.rx_bytes = rx;
        state.tx_bytes = tx;
        Ok(())
    }

    fn wait_until(
        &self,
        timeout: Duration,
        mut done: impl FnMut(&Self) -> RouterResult<bool>,
    ) -> RouterResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if done(self)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(self.opts.poll_interval);
        }
    }

    fn fail(&mut self, reason: String) -> RouterError {
        warn!("Tunnel {} failed to start: {}", self.opts.interface, reason);
        self.phase = Phase::Failed(reason.clone());
        self.started_at = None;
        RouterError::TunnelStartFailed(reason)
    }

    /// Bring the active profile up and wait for an addressed interface.
    ///
    /// A tunnel already running the active profile is left as is. One running
    /// another profile is stopped first.
    pub fn start(&mut self) -> RouterResult<()> {
        let profile = match self.active_profile()? {
            Some(profile) => profile,
            None => {
                self.phase = Phase::Idle;
                return Err(RouterError::NoActiveProfile);
            }
        };
        let iface = self.opts.interface.clone();
        if self.inspector.interface_exists(&iface) {
            match self.running() {
                Some(running) if running.name == profile.name => {
                    info!("Tunnel {} already running {}", iface, profile.name);
                    return Ok(());
                }
                Some(running) => {
                    info!("Tunnel {} runs {}, switching to {}", iface, running.name, profile.name);
                    self.stop()?;
                }
                None if self.detect_kind() == Some(profile.kind) => {
                    info!("Tunnel {} already present, adopting it as {}", iface, profile.name);
                    self.set_running(Some(RunningTunnel::from(&profile)));
                    return Ok(());
                }
                None => {
                    info!("Tunnel {} is not a {:?} tunnel, replacing it", iface, profile.kind);
                    self.stop()?;
                }
            }
        }

        info!("Starting tunnel {} with profile {}", iface, profile.name);
        let pointer = self.store.pointer().display().to_string();
        let (program, argv) = match profile.kind {
            ProtocolKind::WireGuard => ("wg-quick", args(["up", &pointer])),
            ProtocolKind::OpenVpn => {
                fs::create_dir_all(&self.opts.run_dir)?;
                let pid_file = self.pid_file().display().to_string();
                let mut argv = args([
                    "--daemon",
                    "--config",
                    &pointer,
                    "--dev",
                    &iface,
                    "--writepid",
                    &pid_file,
                ]);
                if let Some(auth) = &profile.credentials {
                    argv.extend(args(["--auth-user-pass", &auth.display().to_string()]));
                }
                ("openvpn", argv)
            }
        };

        let output = match self.runner.run(program, &argv, self.opts.start_timeout) {
            Ok(output) => output,
            Err(e) => return Err(self.fail(e.to_string())),
        };
        if !output.success() {
            let reason = format!(
                "{} exited with {:?}: {}",
                program,
                output.exit_code,
                output.stderr.trim()
            );
            return Err(self.fail(reason));
        }

        let ready = self.wait_until(self.opts.start_timeout, |this| {
            match this.inspector.link_state(&iface) {
                Ok(link) => Ok(link.up && !link.addresses.is_empty()),
                Err(RouterError::InterfaceNotFound(_)) => Ok(false),
                Err(e) => Err(e),
            }
        });
        match ready {
            Ok(true) => {}
            Ok(false) => {
                let reason = format!(
                    "{} not up with an address after {:?}",
                    iface, self.opts.start_timeout
                );
                return Err(self.fail(reason));
            }
            Err(e) => return Err(self.fail(e.to_string())),
        }

        self.phase = Phase::Idle;
        self.started_at = Some(Instant::now());
        self.reset_tracking();
        self.set_running(Some(RunningTunnel::from(&profile)));
        info!("Tunnel {} is up", iface);
        Ok(())
    }

    /// Bring the tunnel down and wait for the interface to disappear.
    ///
    /// The protocol comes from the running profile, not the active pointer,
    /// which may have been moved since the tunnel started.
    pub fn stop(&mut self) -> RouterResult<()> {
        self.phase = Phase::Idle;
        self.started_at = None;
        self.reset_tracking();
        let iface = self.opts.interface.clone();
        if !self.inspector.interface_exists(&iface) {
            debug!("Tunnel {} already down", iface);
            self.set_running(None);
            return Ok(());
        }

        let running = self.running();
        let kind = match &running {
            Some(running) => Some(running.kind),
            None => self.detect_kind(),
        };
        let active = self.active_profile().ok().flatten();
        // wg-quick reads the pointer, which must still be the running config
        let pointer_current = match (&running, &active) {
            (Some(running), Some(active)) => running.name == active.name,
            (None, Some(active)) => kind == Some(active.kind),
            _ => false,
        };

        info!("Stopping tunnel {}", iface);
        let pointer = self.store.pointer().display().to_string();
        let pid_file = self.pid_file();
        let (program, argv) = match kind {
            Some(ProtocolKind::WireGuard) if pointer_current => {
                ("wg-quick", args(["down", &pointer]))
            }
            Some(ProtocolKind::OpenVpn) => {
                ("pkill", args(["-F", &pid_file.display().to_string()]))
            }
            _ => {
                debug!("No usable config for {}, deleting the link", iface);
                ("ip", args(["link", "delete", "dev", &iface]))
            }
        };
        let output = self.runner.run(program, &argv, self.opts.stop_timeout)?;
        if !output.success() {
            warn!("{} exited with {:?}: {}", program, output.exit_code, output.stderr.trim());
        }

        let gone = self.wait_until(self.opts.stop_timeout, |this| {
            Ok(!this.inspector.interface_exists(&iface))
        })?;
        if !gone {
            return Err(RouterError::TunnelStopFailed(format!(
                "{} still present after {:?}",
                iface, self.opts.stop_timeout
            )));
        }
        if kind == Some(ProtocolKind::OpenVpn) {
            if let Err(e) = fs::remove_file(&pid_file) {
                if e.kind() != ErrorKind::NotFound {
                    warn!("Could not remove {}: {}", pid_file.display(), e);
                }
            }
        }
        self.set_running(None);
        info!("Tunnel {} is down", iface);
        Ok(())
    }

    /// Stop then start, so failures are handled exactly like a fresh start
    pub fn restart(&mut self) -> RouterResult<()> {
        self.stop()?;
        self.start()
    }
}

fn write_record(path: &Path, running: &RunningTunnel) -> RouterResult<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, toml::to_string(running)?)?;
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
struct WgDump {
    latest_handshake: Option<i64>,
    rx_bytes: u64,
    tx_bytes: u64,
    endpoint: Option<String>,
}

/// Parse `wg show <iface> dump`: one interface line, then one line per peer
/// `pubkey psk endpoint allowed-ips latest-handshake rx tx keepalive`
fn parse_wg_dump(stdout: &str) -> RouterResult<WgDump> {
    let mut dump = WgDump::default();
    for line in stdout.lines().skip(1) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 7 {
            return Err(RouterError::TunnelStatus(format!(
                "short peer line with {} fields",
                fields.len()
            )));
        }
        let number = |i: usize| -> RouterResult<u64> {
            fields[i]
                .parse()
                .map_err(|_| RouterError::TunnelStatus(format!("bad number {:?}", fields[i])))
        };
        let handshake = number(4)?;
        if handshake > 0 {
            let handshake = i64::try_from(handshake).unwrap_or(i64::MAX);
            dump.latest_handshake =
                Some(dump.latest_handshake.map_or(handshake, |h| h.max(handshake)));
        }
        dump.rx_bytes += number(5)?;
        dump.tx_bytes += number(6)?;
        if dump.endpoint.is_none() && fields[2] != "(none)" {
            dump.endpoint = Some(fields[2].to_string());
        }
    }
    Ok(dump)
}

/// Pull byte counters out of `ip -s -o link show` where sections are
/// separated by backslashes: `... \    RX: bytes ... \    1234 ... \    TX: ...`
fn parse_link_counters(stdout: &str) -> (u64, u64) {
    let segments: Vec<&str> = stdout.split('\\').map(str::trim).collect();
    let first_number = |label: &str| {
        segments
            .iter()
            .position(|s| s.starts_with(label))
            .and_then(|i| segments.get(i + 1))
            .and_then(|s| s.split_whitespace().next())
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    };
    (first_number("RX:"), first_number("TX:"))
}
