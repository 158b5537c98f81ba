use crate::errors::{RouterError, RouterResult};
use crate::exec::{args, validate_host, validate_interface_name, CommandOutput, CommandRunner};
use log::debug;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

/// Link level view of one interface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkState {
    /// Administratively up (`UP` flag)
    pub up: bool,
    /// Cable or radio present (`LOWER_UP` flag)
    pub carrier: bool,
    pub addresses: Vec<Ipv4Addr>,
}

impl LinkState {
    pub fn is_usable(&self) -> bool {
        self.up && self.carrier
    }
}

/// Read-only queries against the host's interfaces, plus endpoint route pinning
#[derive(Clone)]
pub struct InterfaceInspector {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl InterfaceInspector {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        InterfaceInspector { runner, timeout }
    }

    fn ip(&self, argv: Vec<String>) -> RouterResult<CommandOutput> {
        self.runner.run("ip", &argv, self.timeout)
    }

    /// Query flags and IPv4 addresses of `iface`.
    ///
    /// Returns [`RouterError::InterfaceNotFound`] if the device does not exist,
    /// including when it disappears between the link and address queries.
    pub fn link_state(&self, iface: &str) -> RouterResult<LinkState> {
        validate_interface_name(iface)?;
        debug!("Reading link state of {}", iface);

        let link = self.ip(args(["-o", "link", "show", "dev", iface]))?;
        check_device(iface, &link)?;
        let (up, carrier) = parse_link_flags(&link.stdout);

        let addr = self.ip(args(["-o", "-4", "addr", "show", "dev", iface]))?;
        check_device(iface, &addr)?;
        let addresses = parse_ipv4_addresses(&addr.stdout);

        debug!("{}: up={} carrier={} addresses={:?}", iface, up, carrier, addresses);
        Ok(LinkState { up, carrier, addresses })
    }

    pub fn interface_exists(&self, iface: &str) -> bool {
        match self.link_state(iface) {
            Ok(_) => true,
            Err(RouterError::InterfaceNotFound(_)) => false,
            Err(e) => {
                debug!("Could not determine whether {} exists: {}", iface, e);
                false
            }
        }
    }

    /// Check if `target` answers a ping sent out of `via`
    pub fn ping(&self, target: &str, via: &str, timeout_ms: u64) -> bool {
        if validate_host(target).is_err() || validate_interface_name(via).is_err() {
            debug!("Refusing to ping {:?} via {:?}", target, via);
            return false;
        }
        debug!("Pinging {} from interface {}", target, via);

        let wait_secs = timeout_ms.div_ceil(1000).max(1);
        let argv = args(["-I", via, "-c", "1", "-W", &wait_secs.to_string(), target]);
        let budget = Duration::from_millis(timeout_ms) + Duration::from_secs(2);

        match self.runner.run("ping", &argv, budget) {
            Ok(o) => o.success(),
            Err(e) => {
                debug!("Ping via {} failed to run: {}", via, e);
                false
            }
        }
    }

    /// Whether the interface is a WiFi device
    pub fn is_wireless(&self, iface: &str) -> bool {
        if validate_interface_name(iface).is_err() {
            return false;
        }
        self.runner
            .run("iw", &args(["dev", iface, "info"]), self.timeout)
            .map(|o| o.success())
            .unwrap_or(false)
    }

    /// Get available network interfaces
    pub fn list_interfaces(&self) -> RouterResult<Vec<String>> {
        let output = self.ip(args(["-o", "link", "show"]))?;
        if !output.success() {
            return Err(RouterError::CommandExecution(output.stderr));
        }
        Ok(parse_interface_names(&output.stdout))
    }

    /// Retrieve the default gateway for a specific interface
    pub fn gateway_for(&self, iface: &str) -> RouterResult<Option<Ipv4Addr>> {
        validate_interface_name(iface)?;
        let output = self.ip(args(["route", "show", "dev", iface]))?;
        check_device(iface, &output)?;
        Ok(parse_default_gateway(&output.stdout))
    }

    /// Route `host` over `iface` so the tunnel endpoint follows the selected WAN
    pub fn pin_route(&self, host: Ipv4Addr, iface: &str) -> RouterResult<()> {
        let gateway = self.gateway_for(iface)?;
        debug!("Pinning route for {} to {} (gw: {:?})", host, iface, gateway);

        let mut argv = args(["route", "replace", &host.to_string()]);
        if let Some(gw) = gateway {
            argv.extend(args(["via", &gw.to_string()]));
        }
        argv.extend(args(["dev", iface, "metric", "100"]));

        let output = self.ip(argv)?;
        if !output.success() {
            return Err(RouterError::RouteModificationFailed(format!(
                "{} via {}: {}",
                host,
                iface,
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}

fn check_device(iface: &str, output: &CommandOutput) -> RouterResult<()> {
    if output.success() {
        return Ok(());
    }
    if output.stderr.contains("does not exist") || output.stderr.contains("Cannot find device") {
        return Err(RouterError::InterfaceNotFound(iface.to_string()));
    }
    Err(RouterError::CommandExecution(format!(
        "ip query for {} failed: {}",
        iface,
        output.stderr.trim()
    )))
}

/// `2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 ...` -> (up, carrier)
fn parse_link_flags(stdout: &str) -> (bool, bool) {
    let flags = stdout
        .split_once('<')
        .and_then(|(_, rest)| rest.split_once('>'))
        .map(|(flags, _)| flags)
        .unwrap_or("");
    let mut up = false;
    let mut carrier = false;
    for flag in flags.split(',') {
        match flag {
            "UP" => up = true,
            "LOWER_UP" => carrier = true,
            _ => {}
        }
    }
    (up, carrier)
}

fn parse_ipv4_addresses(stdout: &str) -> Vec<Ipv4Addr> {
    let mut addresses = Vec::new();
    for line in stdout.lines() {
        let mut parts = line.split_whitespace();
        if parts.by_ref().any(|p| p == "inet") {
            if let Some(cidr) = parts.next() {
                let addr = cidr.split('/').next().unwrap_or(cidr);
                if let Ok(ip) = addr.parse() {
                    addresses.push(ip);
                }
            }
        }
    }
    addresses
}

fn parse_interface_names(stdout: &str) -> Vec<String> {
    let mut interfaces = Vec::new();
    for line in stdout.lines() {
        if let Some(name) = line.split(": ").nth(1) {
            // veth pairs and vlans show up as `name@parent`
            let name = name.split('@').next().unwrap_or(name);
            if !name.is_empty() && name != "lo" {
                interfaces.push(name.to_string());
            }
        }
    }
    interfaces
}

/// Look for lines like `default via 192.168.1.1 ...`
fn parse_default_gateway(stdout: &str) -> Option<Ipv4Addr> {
    stdout.lines().find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["default", "via", gw, ..] => gw.parse().ok(),
            _ => None,
        }
    })
}
