//! In-memory stand-in for the router's `ip`, `iptables`, `wg`, `wg-quick`,
//! `openvpn`, `pkill`, `iw` and `ping`, so the lifecycle can be exercised without root.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::TempDir;
use vpn_failover::config::RouterConfig;
use vpn_failover::exec::{CommandOutput, CommandRunner};
use vpn_failover::wan::{WanInterface, WanKind};
use vpn_failover::RouterResult;

pub const TUNNEL: &str = "wg0";
pub const LAN: &str = "br0";
pub const ENDPOINT: &str = "203.0.113.5";

pub const WG_PROFILE: &str = "[Interface]\nPrivateKey = x\nAddress = 10.8.0.2/32\n\n[Peer]\nEndpoint = 203.0.113.5:51820\nAllowedIPs = 0.0.0.0/0\n";

pub const OVPN_PROFILE: &str = "client\ndev tun\nremote vpn.example.net 1194\n";

#[derive(Debug, Clone)]
pub struct FakeLink {
    pub up: bool,
    pub carrier: bool,
    pub addresses: Vec<String>,
    pub wireless: bool,
    pub gateway: Option<String>,
}

impl FakeLink {
    pub fn wired(address: &str, gateway: &str) -> Self {
        FakeLink {
            up: true,
            carrier: true,
            addresses: vec![address.to_string()],
            wireless: false,
            gateway: Some(gateway.to_string()),
        }
    }

    pub fn wireless(address: &str, gateway: &str) -> Self {
        FakeLink {
            wireless: true,
            ..FakeLink::wired(address, gateway)
        }
    }
}

#[derive(Debug)]
pub struct HostState {
    pub links: BTreeMap<String, FakeLink>,
    /// (table, chain) -> rules without the `-A chain` prefix
    pub chains: HashMap<(String, String), Vec<Vec<String>>>,
    /// Every command run, as `program arg arg ...`
    pub calls: Vec<String>,
    /// Kill-switch ordering violations seen after a mutating iptables call
    pub violations: Vec<String>,
    pub routes: Vec<String>,
    /// `wg-quick up` fails while set
    pub start_fails: bool,
    /// Handshake age reported for a tunnel brought up by `wg-quick up`
    pub fresh_handshake_age: Option<u64>,
    /// Handshake age currently reported by `wg show`
    pub handshake_age: Option<u64>,
    /// Counters advance on every `wg show` or `ip -s link` while set
    pub traffic: bool,
    pub rx: u64,
    pub tx: u64,
    /// Answer pings sent through the tunnel
    pub tunnel_reachable: bool,
    /// Every mutating iptables command fails while set
    pub firewall_broken: bool,
    /// Device created by the running `openvpn --daemon`
    pub openvpn_dev: Option<String>,
}

const BUILTIN: &[(&str, &str)] = &[("filter", "FORWARD"), ("nat", "POSTROUTING")];

fn is_builtin(table: &str, chain: &str) -> bool {
    BUILTIN.iter().any(|(t, c)| *t == table && *c == chain)
}

fn target(rule: &[String]) -> Option<&str> {
    rule.windows(2).find(|w| w[0] == "-j").map(|w| w[1].as_str())
}

fn out(stdout: impl Into<String>) -> RouterResult<CommandOutput> {
    Ok(CommandOutput::ok(stdout))
}

fn fail(code: i32, stderr: impl Into<String>) -> RouterResult<CommandOutput> {
    Ok(CommandOutput::failed(code, stderr))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn rule(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

pub fn deny(lan: &str) -> Vec<String> {
    rule(&["-i", lan, "!", "-o", TUNNEL, "-j", "DROP"])
}

pub fn allow_out(lan: &str) -> Vec<String> {
    rule(&["-i", lan, "-o", TUNNEL, "-j", "ACCEPT"])
}

impl HostState {
    fn new() -> Self {
        let mut chains = HashMap::new();
        for (table, chain) in BUILTIN {
            chains.insert((table.to_string(), chain.to_string()), Vec::new());
        }
        HostState {
            links: BTreeMap::new(),
            chains,
            calls: Vec::new(),
            violations: Vec::new(),
            routes: Vec::new(),
            start_fails: false,
            fresh_handshake_age: Some(5),
            handshake_age: None,
            traffic: true,
            rx: 0,
            tx: 0,
            tunnel_reachable: true,
            firewall_broken: false,
            openvpn_dev: None,
        }
    }

    pub fn rules(&self, table: &str, chain: &str) -> Vec<Vec<String>> {
        self.chains
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn rules_mut(&mut self, table: &str, chain: &str) -> &mut Vec<Vec<String>> {
        self.chains
            .entry((table.to_string(), chain.to_string()))
            .or_default()
    }

    /// Bring the tunnel interface up as if by `wg-quick up`
    pub fn raise_tunnel(&mut self, handshake_age: Option<u64>) {
        self.links.insert(
            TUNNEL.to_string(),
            FakeLink {
                up: true,
                carrier: true,
                addresses: vec!["10.8.0.2".to_string()],
                wireless: false,
                gateway: None,
            },
        );
        self.handshake_age = handshake_age;
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls.iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn ip(&mut self, argv: &[&str]) -> RouterResult<CommandOutput> {
        let missing = |dev: &str| fail(1, format!("Device \"{}\" does not exist.", dev));
        match argv {
            ["-o", "link", "show"] => {
                let mut lines =
                    vec!["1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 state UNKNOWN".to_string()];
                for (i, name) in self.links.keys().enumerate() {
                    lines.push(self.link_line(i + 2, name));
                }
                out(lines.join("\n") + "\n")
            }
            ["-o", "link", "show", "dev", dev] | ["-s", "-o", "link", "show", "dev", dev] => {
                if !self.links.contains_key(*dev) {
                    return missing(*dev);
                }
                let idx = self.index_of(dev);
                let mut line = self.link_line(idx, dev);
                if argv[0] == "-s" {
                    if self.traffic {
                        self.rx += 1000;
                        self.tx += 500;
                    }
                    line.push_str(&format!(
                        " \\    RX:  bytes packets errors \\    {} 1 0 \\    TX:  bytes packets errors \\    {} 1 0",
                        self.rx, self.tx
                    ));
                }
                out(line + "\n")
            }
            ["-o", "-4", "addr", "show", "dev", dev] => match self.links.get(*dev) {
                None => missing(*dev),
                Some(link) => {
                    let idx = self.index_of(dev);
                    let lines: Vec<String> = link
                        .addresses
                        .iter()
                        .map(|a| {
                            format!(
                                "{}: {}    inet {}/24 scope global {}\\       valid_lft forever",
                                idx, dev, a, dev
                            )
                        })
                        .collect();
                    out(lines.join("\n"))
                }
            },
            ["route", "show", "dev", dev] => match self.links.get(*dev) {
                None => fail(1, "Cannot find device"),
                Some(link) => out(link
                    .gateway
                    .as_ref()
                    .map(|gw| format!("default via {} proto dhcp metric 100\n", gw))
                    .unwrap_or_default()),
            },
            ["route", "replace", ..] => {
                self.routes.push(argv[2..].join(" "));
                out("")
            }
            ["link", "delete", "dev", dev] => {
                if self.links.remove(*dev).is_none() {
                    return missing(*dev);
                }
                if self.openvpn_dev.as_deref() == Some(*dev) {
                    self.openvpn_dev = None;
                }
                out("")
            }
            _ => fail(2, format!("unsupported ip invocation: {:?}", argv)),
        }
    }

    fn index_of(&self, dev: &str) -> usize {
        self.links.keys().position(|k| k == dev).map_or(0, |i| i + 2)
    }

    fn link_line(&self, idx: usize, name: &str) -> String {
        let link = &self.links[name];
        let mut flags = vec!["BROADCAST", "MULTICAST"];
        if link.up {
            flags.push("UP");
        }
        if link.carrier {
            flags.push("LOWER_UP");
        }
        format!("{}: {}: <{}> mtu 1500 qdisc noqueue state UP", idx, name, flags.join(","))
    }

    fn iptables(&mut self, argv: &[&str]) -> RouterResult<CommandOutput> {
        let (table, op, rest) = match argv {
            ["-w", "-t", table, op, rest @ ..] => (table.to_string(), *op, rest),
            _ => return fail(2, "unsupported iptables invocation"),
        };
        let no_chain = || fail(1, "iptables: No chain/target/match by that name.");
        let chain = match rest.first() {
            Some(c) => c.to_string(),
            None => return fail(2, "chain required"),
        };
        let key = (table.clone(), chain.clone());
        let spec: Vec<String> = rest[1..].iter().map(|s| s.to_string()).collect();

        let mutating = matches!(op, "-N" | "-A" | "-I" | "-D" | "-F" | "-X");
        if mutating && self.firewall_broken {
            return fail(4, "iptables: Resource temporarily unavailable.");
        }

        let result = match op {
            "-S" => match self.chains.get(&key) {
                None => return no_chain(),
                Some(rules) => {
                    let mut lines = vec![if is_builtin(&table, &chain) {
                        format!("-P {} ACCEPT", chain)
                    } else {
                        format!("-N {}", chain)
                    }];
                    lines.extend(rules.iter().map(|r| format!("-A {} {}", chain, r.join(" "))));
                    return out(lines.join("\n") + "\n");
                }
            },
            "-C" => match self.chains.get(&key) {
                None => return no_chain(),
                Some(rules) if rules.contains(&spec) => return out(""),
                Some(_) => return fail(1, "iptables: Bad rule (does a matching rule exist in that chain?)."),
            },
            "-N" => {
                if self.chains.contains_key(&key) {
                    return fail(1, "iptables: Chain already exists.");
                }
                self.chains.insert(key, Vec::new());
                out("")
            }
            "-A" | "-I" => {
                let (position, spec) = if op == "-I" {
                    match spec.first().and_then(|n| n.parse::<usize>().ok()) {
                        Some(n) => (Some(n.saturating_sub(1)), spec[1..].to_vec()),
                        None => (Some(0), spec),
                    }
                } else {
                    (None, spec)
                };
                if let Some(t) = target(&spec) {
                    let known = matches!(t, "ACCEPT" | "DROP" | "REJECT" | "MASQUERADE" | "RETURN");
                    if !known && !self.chains.contains_key(&(table.clone(), t.to_string())) {
                        return fail(2, format!("iptables v1.8.9: Couldn't load target `{}'", t));
                    }
                }
                let Some(rules) = self.chains.get_mut(&key) else {
                    return no_chain();
                };
                match position {
                    Some(p) => rules.insert(p.min(rules.len()), spec),
                    None => rules.push(spec),
                }
                out("")
            }
            "-D" => {
                let Some(rules) = self.chains.get_mut(&key) else {
                    return no_chain();
                };
                let index = match spec.as_slice() {
                    [n] if n.parse::<usize>().is_ok() => {
                        n.parse::<usize>().ok().and_then(|n| n.checked_sub(1))
                    }
                    _ => rules.iter().position(|r| *r == spec),
                };
                match index {
                    Some(i) if i < rules.len() => {
                        rules.remove(i);
                        out("")
                    }
                    _ => return fail(1, "iptables: Bad rule (does a matching rule exist in that chain?)."),
                }
            }
            "-F" => match self.chains.get_mut(&key) {
                None => return no_chain(),
                Some(rules) => {
                    rules.clear();
                    out("")
                }
            },
            "-X" => {
                let referenced = self
                    .chains
                    .iter()
                    .filter(|((t, _), _)| *t == table)
                    .any(|(_, rules)| rules.iter().any(|r| target(r) == Some(chain.as_str())));
                match self.chains.get(&key) {
                    None => return no_chain(),
                    Some(rules) if !rules.is_empty() || referenced => {
                        return fail(1, "iptables: Directory not empty.")
                    }
                    Some(_) => {
                        self.chains.remove(&key);
                        out("")
                    }
                }
            }
            _ => return fail(2, format!("unsupported iptables op {}", op)),
        };
        self.check_kill_switch();
        result
    }

    /// Every ACCEPT in the kill-switch chain must sit below a drop for each LAN
    fn check_kill_switch(&mut self) {
        let chain = self.rules("filter", "VPNFO_FWD");
        let Some(first_accept) = chain.iter().position(|r| target(r) == Some("ACCEPT")) else {
            return;
        };
        let denied = chain[..first_accept].contains(&deny(LAN));
        if !denied {
            self.violations.push(format!("{:?}", chain));
        }
    }

    fn wg(&mut self, argv: &[&str]) -> RouterResult<CommandOutput> {
        match argv {
            ["show", dev, "dump"] => {
                if !self.links.contains_key(*dev) {
                    return fail(1, "Unable to access interface: No such device");
                }
                if self.openvpn_dev.as_deref() == Some(*dev) {
                    return fail(1, "Unable to access interface: Protocol not supported");
                }
                if self.traffic {
                    self.rx += 1000;
                    self.tx += 500;
                }
                let handshake = self.handshake_age.map_or(0, |age| now_secs().saturating_sub(age));
                out(format!(
                    "cHJpdmF0ZQ==\tcHVibGlj\t51820\toff\npeer\t(none)\t{}:51820\t0.0.0.0/0\t{}\t{}\t{}\t25\n",
                    ENDPOINT, handshake, self.rx, self.tx
                ))
            }
            _ => fail(1, "unsupported wg invocation"),
        }
    }

    fn wg_quick(&mut self, argv: &[&str]) -> RouterResult<CommandOutput> {
        match argv {
            ["up", _] => {
                if self.links.contains_key(TUNNEL) {
                    return fail(1, format!("wg-quick: `{}' already exists", TUNNEL));
                }
                if self.start_fails {
                    return fail(1, "RTNETLINK answers: Operation not supported");
                }
                let age = self.fresh_handshake_age;
                self.raise_tunnel(age);
                out("")
            }
            ["down", _] => {
                if self.openvpn_dev.is_some() || self.links.remove(TUNNEL).is_none() {
                    return fail(1, format!("wg-quick: `{}' is not a WireGuard interface", TUNNEL));
                }
                out("")
            }
            _ => fail(1, "unsupported wg-quick invocation"),
        }
    }

    fn openvpn(&mut self, argv: &[&str]) -> RouterResult<CommandOutput> {
        let value = |flag: &str| argv.windows(2).find(|w| w[0] == flag).map(|w| w[1]);
        let (Some(dev), Some(pid_file)) = (value("--dev"), value("--writepid")) else {
            return fail(1, "Options error: --dev and --writepid are required");
        };
        if self.links.contains_key(dev) {
            return fail(1, "ERROR: Cannot ioctl TUNSETIFF: Device or resource busy");
        }
        if self.start_fails {
            return fail(1, "Exiting due to fatal error");
        }
        if let Err(e) = std::fs::write(pid_file, "4242\n") {
            return fail(1, format!("Cannot open PID file: {}", e));
        }
        self.links.insert(
            dev.to_string(),
            FakeLink {
                up: true,
                carrier: true,
                addresses: vec!["10.9.0.2".to_string()],
                wireless: false,
                gateway: None,
            },
        );
        self.openvpn_dev = Some(dev.to_string());
        self.handshake_age = None;
        out("")
    }

    fn pkill(&mut self, argv: &[&str]) -> RouterResult<CommandOutput> {
        match argv {
            ["-F", pid_file] => {
                if !Path::new(pid_file).exists() {
                    return fail(2, format!("pkill: opening pidfile {}", pid_file));
                }
                match self.openvpn_dev.take() {
                    Some(dev) => {
                        self.links.remove(&dev);
                        out("")
                    }
                    None => fail(1, ""),
                }
            }
            _ => fail(2, "unsupported pkill invocation"),
        }
    }

    fn ping(&self, argv: &[&str]) -> RouterResult<CommandOutput> {
        let via = match argv {
            ["-I", via, ..] => *via,
            _ => return fail(2, "ping: interface required"),
        };
        let reachable = match self.links.get(via) {
            Some(link) if link.up => via != TUNNEL || self.tunnel_reachable,
            _ => false,
        };
        if reachable {
            out("1 packets transmitted, 1 received, 0% packet loss\n")
        } else {
            fail(1, "1 packets transmitted, 0 received, 100% packet loss\n")
        }
    }
}

/// Scriptable host shared between the router under test and the test body
#[derive(Debug)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeHost {
            state: Mutex::new(HostState::new()),
        })
    }

    /// Ethernet `eth0` and WiFi `wlan0` uplinks plus the LAN bridge
    pub fn with_uplinks() -> Arc<Self> {
        let host = FakeHost::new();
        {
            let mut s = host.state();
            s.links.insert("eth0".into(), FakeLink::wired("192.0.2.10", "192.0.2.1"));
            s.links.insert("wlan0".into(), FakeLink::wireless("198.51.100.10", "198.51.100.1"));
            s.links.insert(LAN.into(), FakeLink::wired("192.168.1.1", "192.168.1.1"));
        }
        host
    }

    pub fn state(&self) -> MutexGuard<'_, HostState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl CommandRunner for FakeHost {
    fn run(
        &self,
        program: &str,
        args: &[String],
        _timeout: Duration,
    ) -> RouterResult<CommandOutput> {
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        let mut s = self.state();
        s.calls.push(format!("{} {}", program, args.join(" ")));
        match program {
            "ip" => s.ip(&argv),
            "iptables" => s.iptables(&argv),
            "wg" => s.wg(&argv),
            "wg-quick" => s.wg_quick(&argv),
            "openvpn" => s.openvpn(&argv),
            "pkill" => s.pkill(&argv),
            "ping" => s.ping(&argv),
            "iw" => match argv.as_slice() {
                ["dev", dev, "info"] if s.links.get(*dev).is_some_and(|l| l.wireless) => {
                    out("Interface wlan0\n")
                }
                _ => fail(237, "command failed: No such device (-19)"),
            },
            _ => fail(127, format!("{}: command not found", program)),
        }
    }
}

/// Configuration rooted in a temporary directory with short timeouts
pub fn test_config(tmp: &TempDir) -> RouterConfig {
    let root = tmp.path();
    RouterConfig {
        tunnel_interface: TUNNEL.to_string(),
        lan_interfaces: vec![LAN.to_string()],
        wan_interfaces: vec![
            WanInterface {
                name: "eth0".into(),
                kind: WanKind::Ethernet,
            },
            WanInterface {
                name: "wlan0".into(),
                kind: WanKind::WiFi,
            },
        ],
        profiles_dir: root.join("profiles"),
        pointer_dir: root.join("wireguard"),
        settings_path: root.join("settings.toml"),
        state_dir: Some(root.join("state")),
        command_timeout: Duration::from_secs(1),
        start_timeout: Duration::from_millis(300),
        stop_timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(10),
        lock_wait: Duration::from_millis(200),
        sleep_slice: Duration::from_millis(10),
        ..RouterConfig::default()
    }
}

pub fn profile_path(tmp: &TempDir, name: &str) -> PathBuf {
    tmp.path().join("profiles").join(format!("{}.conf", name))
}
