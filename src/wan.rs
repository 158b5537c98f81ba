use crate::errors::{RouterError, RouterResult};
use crate::network::InterfaceInspector;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WanKind {
    Ethernet,
    WiFi,
}

impl WanKind {
    /// Lower ranks win; Ethernet always outranks WiFi
    pub fn rank(self) -> u8 {
        match self {
            WanKind::Ethernet => 0,
            WanKind::WiFi => 1,
        }
    }

    /// Classify by the usual Linux naming schemes
    pub fn from_name(name: &str) -> Option<Self> {
        if name.starts_with("eth") || name.starts_with("en") {
            Some(WanKind::Ethernet)
        } else if name.starts_with("wlan") || name.starts_with("wl") {
            Some(WanKind::WiFi)
        } else {
            None
        }
    }
}

/// An interface that may carry WAN traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WanCandidate {
    pub name: String,
    pub kind: WanKind,
    pub carrier: bool,
    pub rank: u8,
}

/// Configured interface eligible to become WAN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WanInterface {
    pub name: String,
    pub kind: WanKind,
}

/// Picks the WAN interface from live link state on every call
pub struct WanSelector {
    inspector: InterfaceInspector,
    configured: Vec<WanInterface>,
    /// Never offered as WAN (tunnel, LAN bridge, ...)
    excluded: Vec<String>,
}

impl WanSelector {
    pub fn new(
        inspector: InterfaceInspector,
        configured: Vec<WanInterface>,
        excluded: Vec<String>,
    ) -> Self {
        WanSelector {
            inspector,
            configured,
            excluded,
        }
    }

    /// Interfaces to consider this tick, configured ones or auto-detected
    fn interfaces(&self) -> RouterResult<Vec<WanInterface>> {
        if !self.configured.is_empty() {
            return Ok(self.configured.clone());
        }
        let mut found = Vec::new();
        for name in self.inspector.list_interfaces()? {
            if self.excluded.contains(&name) {
                continue;
            }
            let kind = if self.inspector.is_wireless(&name) {
                Some(WanKind::WiFi)
            } else {
                WanKind::from_name(&name)
            };
            if let Some(kind) = kind {
                found.push(WanInterface { name, kind });
            }
        }
        debug!("Auto-detected WAN interfaces: {:?}", found);
        Ok(found)
    }

    /// Query every candidate's link state. Interfaces that vanished are skipped.
    pub fn candidates(&self) -> RouterResult<Vec<WanCandidate>> {
        let mut candidates = Vec::new();
        for iface in self.interfaces()? {
            match self.inspector.link_state(&iface.name) {
                Ok(link) => candidates.push(WanCandidate {
                    carrier: link.is_usable(),
                    rank: iface.kind.rank(),
                    name: iface.name,
                    kind: iface.kind,
                }),
                Err(RouterError::InterfaceNotFound(name)) => {
                    debug!("WAN candidate {} is not present", name);
                }
                Err(e) => warn!("Could not read link state of {}: {}", iface.name, e),
            }
        }
        Ok(candidates)
    }

    /// The current WAN, or `None` when every candidate is down
    pub fn select(&self) -> RouterResult<Option<WanCandidate>> {
        Ok(choose(self.candidates()?))
    }
}

/// Best candidate with carrier: lowest rank, then configured order
pub fn choose(candidates: Vec<WanCandidate>) -> Option<WanCandidate> {
    candidates
        .into_iter()
        .enumerate()
        .filter(|(_, c)| c.carrier)
        .min_by_key(|(order, c)| (c.rank, *order))
        .map(|(_, c)| c)
}
