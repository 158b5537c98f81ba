//! iptables kill-switch.
//!
//! All rules live in two dedicated chains, `VPNFO_FWD` (filter) hooked as the
//! first rule of `FORWARD` and `VPNFO_NAT` (nat) hooked from `POSTROUTING`.
//!
//! Ordering invariant: an ACCEPT rule for a LAN interface only ever exists
//! while that LAN's `! -o <tunnel> -j DROP` rule is present at a lower index.
//! Setup inserts the drops first, teardown removes the accepts first.

use crate::errors::{RouterError, RouterResult};
use crate::exec::{args, validate_interface_name, CommandOutput, CommandRunner};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

pub const FORWARD_CHAIN: &str = "VPNFO_FWD";
pub const NAT_CHAIN: &str = "VPNFO_NAT";

const FILTER: &str = "filter";
const NAT: &str = "nat";

type RuleSpec = Vec<String>;

fn deny_rule(lan: &str, tunnel: &str) -> RuleSpec {
    args(["-i", lan, "!", "-o", tunnel, "-j", "DROP"])
}

fn allow_out_rule(lan: &str, tunnel: &str) -> RuleSpec {
    args(["-i", lan, "-o", tunnel, "-j", "ACCEPT"])
}

fn allow_return_rule(lan: &str, tunnel: &str) -> RuleSpec {
    args([
        "-i",
        tunnel,
        "-o",
        lan,
        "-m",
        "conntrack",
        "--ctstate",
        "RELATED,ESTABLISHED",
        "-j",
        "ACCEPT",
    ])
}

fn masquerade_rule(tunnel: &str) -> RuleSpec {
    args(["-o", tunnel, "-j", "MASQUERADE"])
}

fn jump(chain: &str) -> RuleSpec {
    args(["-j", chain])
}

fn is_accept(rule: &[String]) -> bool {
    rule.windows(2).any(|w| w[0] == "-j" && w[1] == "ACCEPT")
}

/// Observed kill-switch posture
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirewallState {
    /// `VPNFO_FWD` is the first rule of `FORWARD`
    pub hooked: bool,
    /// LAN interfaces whose drop rule is missing
    pub missing_deny: Vec<String>,
    /// LAN interfaces whose drop rule sits below an ACCEPT
    pub misranked_deny: Vec<String>,
    /// LAN interfaces without their tunnel allow pair
    pub missing_allow: Vec<String>,
    /// ACCEPT rules that are not one of the expected tunnel pairs
    pub unexpected_accepts: Vec<String>,
    /// Masquerade for the tunnel exists and its chain is hooked
    pub masquerade: bool,
}

impl FirewallState {
    pub fn is_consistent(&self) -> bool {
        self.hooked
            && self.missing_deny.is_empty()
            && self.misranked_deny.is_empty()
            && self.missing_allow.is_empty()
            && self.unexpected_accepts.is_empty()
            && self.masquerade
    }

    /// Forwarding from every LAN is denied unless it leaves through the tunnel
    pub fn denies_bypass(&self) -> bool {
        self.hooked
            && self.missing_deny.is_empty()
            && self.misranked_deny.is_empty()
            && self.unexpected_accepts.is_empty()
    }
}

/// Installs, verifies and removes the kill-switch rules
#[derive(Clone)]
pub struct FirewallController {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl FirewallController {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        FirewallController { runner, timeout }
    }

    fn iptables(&self, table: &str, op: &[&str], spec: &[String]) -> RouterResult<CommandOutput> {
        let mut argv = args(["-w", "-t", table]);
        argv.extend(op.iter().map(|s| s.to_string()));
        argv.extend(spec.iter().cloned());
        self.runner.run("iptables", &argv, self.timeout)
    }

    fn must(&self, table: &str, op: &[&str], spec: &[String]) -> RouterResult<()> {
        let output = self.iptables(table, op, spec)?;
        if output.success() {
            Ok(())
        } else {
            Err(RouterError::Firewall(format!(
                "iptables -t {} {} {} failed: {}",
                table,
                op.join(" "),
                spec.join(" "),
                output.stderr.trim()
            )))
        }
    }

    fn rule_exists(&self, table: &str, chain: &str, spec: &[String]) -> RouterResult<bool> {
        Ok(self.iptables(table, &["-C", chain], spec)?.success())
    }

    fn ensure_chain(&self, table: &str, chain: &str) -> RouterResult<()> {
        let output = self.iptables(table, &["-N", chain], &[])?;
        if output.success() || output.stderr.contains("already exists") {
            Ok(())
        } else {
            Err(RouterError::Firewall(format!(
                "cannot create chain {}: {}",
                chain,
                output.stderr.trim()
            )))
        }
    }

    /// Rules of `chain` in evaluation order, without the `-A <chain>` prefix.
    /// A missing chain reads as empty.
    fn list_rules(&self, table: &str, chain: &str) -> RouterResult<Vec<RuleSpec>> {
        let output = self.iptables(table, &["-S", chain], &[])?;
        if !output.success() {
            if output.stderr.contains("No chain") {
                return Ok(Vec::new());
            }
            return Err(RouterError::Firewall(format!(
                "cannot list {}: {}",
                chain,
                output.stderr.trim()
            )));
        }
        Ok(parse_rules(&output.stdout, chain))
    }

    /// Keep the first occurrence of `spec` in `chain`, delete the rest by number
    fn dedupe(&self, table: &str, chain: &str, spec: &[String]) -> RouterResult<()> {
        let rules = self.list_rules(table, chain)?;
        let positions: Vec<usize> = rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.as_slice() == spec)
            .map(|(i, _)| i + 1)
            .collect();
        for number in positions.iter().skip(1).rev() {
            self.must(table, &["-D", chain, &number.to_string()], &[])?;
        }
        Ok(())
    }

    /// Put `spec` at the top of `chain` unless it already outranks `before`
    fn ensure_first(
        &self,
        table: &str,
        chain: &str,
        spec: &[String],
        before: impl Fn(&[String]) -> bool,
    ) -> RouterResult<()> {
        let rules = self.list_rules(table, chain)?;
        let own = rules.iter().position(|r| r.as_slice() == spec);
        let competitor = rules
            .iter()
            .position(|r| r.as_slice() != spec && before(r.as_slice()));
        let ranked = match (own, competitor) {
            (Some(o), Some(c)) => o < c,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !ranked {
            self.must(table, &["-I", chain, "1"], spec)?;
        }
        self.dedupe(table, chain, spec)
    }

    /// Install the kill-switch for `tunnel` and the given LAN interfaces.
    ///
    /// Safe to call repeatedly; existing rules are not duplicated and drift
    /// (foreign ACCEPTs in our chain, our hook no longer first) is repaired.
    /// Returns an error unless the resulting rule set verifies.
    pub fn apply_kill_switch(&self, tunnel: &str, lans: &[String]) -> RouterResult<()> {
        validate_interface_name(tunnel)?;
        for lan in lans {
            validate_interface_name(lan)?;
        }
        debug!("Applying kill-switch for {} on {:?}", tunnel, lans);

        self.ensure_chain(FILTER, FORWARD_CHAIN)?;
        self.ensure_chain(NAT, NAT_CHAIN)?;

        // Drops go in before anything that accepts
        for lan in lans {
            self.ensure_first(FILTER, FORWARD_CHAIN, &deny_rule(lan, tunnel), |r| is_accept(r))?;
        }

        // Remove accepts we did not put there; removing an ACCEPT never opens a path
        let expected: Vec<RuleSpec> = lans
            .iter()
            .flat_map(|lan| [allow_out_rule(lan, tunnel), allow_return_rule(lan, tunnel)])
            .collect();
        for rule in self.list_rules(FILTER, FORWARD_CHAIN)? {
            if is_accept(&rule) && !expected.contains(&rule) {
                warn!("Removing unexpected forward rule: {}", rule.join(" "));
                self.must(FILTER, &["-D", FORWARD_CHAIN], &rule)?;
            }
        }

        self.ensure_first(FILTER, "FORWARD", &jump(FORWARD_CHAIN), |_| true)?;

        for rule in &expected {
            if !self.rule_exists(FILTER, FORWARD_CHAIN, rule)? {
                self.must(FILTER, &["-A", FORWARD_CHAIN], rule)?;
            }
        }

        let masq = masquerade_rule(tunnel);
        if !self.rule_exists(NAT, NAT_CHAIN, &masq)? {
            self.must(NAT, &["-A", NAT_CHAIN], &masq)?;
        }
        if !self.rule_exists(NAT, "POSTROUTING", &jump(NAT_CHAIN))? {
            self.must(NAT, &["-I", "POSTROUTING", "1"], &jump(NAT_CHAIN))?;
        }

        let state = self.inspect(tunnel, lans)?;
        if !state.is_consistent() {
            return Err(RouterError::Firewall(format!(
                "kill-switch did not verify after apply: {:?}",
                state
            )));
        }
        info!("Kill-switch applied for {} ({} LAN interfaces)", tunnel, lans.len());
        Ok(())
    }

    /// Remove every kill-switch rule: accepts, then drops, then hooks, then chains
    pub fn teardown(&self) -> RouterResult<()> {
        let rules = self.list_rules(FILTER, FORWARD_CHAIN)?;
        let (accepts, others): (Vec<_>, Vec<_>) = rules.into_iter().partition(|r| is_accept(r));
        for rule in accepts.iter().chain(others.iter()) {
            self.must(FILTER, &["-D", FORWARD_CHAIN], rule)?;
        }
        while self.rule_exists(FILTER, "FORWARD", &jump(FORWARD_CHAIN))? {
            self.must(FILTER, &["-D", "FORWARD"], &jump(FORWARD_CHAIN))?;
        }
        while self.rule_exists(NAT, "POSTROUTING", &jump(NAT_CHAIN))? {
            self.must(NAT, &["-D", "POSTROUTING"], &jump(NAT_CHAIN))?;
        }
        for (table, chain) in [(FILTER, FORWARD_CHAIN), (NAT, NAT_CHAIN)] {
            let flushed = self.iptables(table, &["-F", chain], &[])?;
            if flushed.success() {
                self.must(table, &["-X", chain], &[])?;
            }
        }
        info!("Kill-switch removed");
        Ok(())
    }

    /// Re-read the live rule set and describe it relative to the expected posture
    pub fn inspect(&self, tunnel: &str, lans: &[String]) -> RouterResult<FirewallState> {
        let forward = self.list_rules(FILTER, "FORWARD")?;
        let chain = self.list_rules(FILTER, FORWARD_CHAIN)?;
        let nat_rules = self.list_rules(NAT, NAT_CHAIN)?;
        let postrouting = self.list_rules(NAT, "POSTROUTING")?;

        let mut state = FirewallState {
            hooked: forward.first() == Some(&jump(FORWARD_CHAIN)),
            masquerade: nat_rules.contains(&masquerade_rule(tunnel))
                && postrouting.contains(&jump(NAT_CHAIN)),
            ..FirewallState::default()
        };

        let first_accept = chain.iter().position(|r| is_accept(r));
        let mut expected = Vec::new();
        for lan in lans {
            match chain.iter().position(|r| *r == deny_rule(lan, tunnel)) {
                None => state.missing_deny.push(lan.clone()),
                Some(idx) if first_accept.is_some_and(|a| a < idx) => {
                    state.misranked_deny.push(lan.clone())
                }
                Some(_) => {}
            }
            let pair = [allow_out_rule(lan, tunnel), allow_return_rule(lan, tunnel)];
            if !pair.iter().all(|r| chain.contains(r)) {
                state.missing_allow.push(lan.clone());
            }
            expected.extend(pair);
        }
        state.unexpected_accepts = chain
            .iter()
            .filter(|r| is_accept(r) && !expected.contains(*r))
            .map(|r| r.join(" "))
            .collect();

        debug!("Firewall state for {}: {:?}", tunnel, state);
        Ok(state)
    }

    pub fn is_consistent(&self, tunnel: &str, lans: &[String]) -> RouterResult<bool> {
        Ok(self.inspect(tunnel, lans)?.is_consistent())
    }
}

/// Parse `iptables -S <chain>` output into rule specs
fn parse_rules(stdout: &str, chain: &str) -> Vec<RuleSpec> {
    let prefix = format!("-A {} ", chain);
    stdout
        .lines()
        .filter_map(|line| line.trim_end().strip_prefix(&prefix))
        .map(|rest| rest.split_whitespace().map(str::to_string).collect())
        .collect()
}
