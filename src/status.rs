use crate::errors::{ErrorClass, RouterError};
use crate::tunnel::{TunnelLifecycle, TunnelState};
use crate::wan::{WanCandidate, WanKind};
use chrono::{DateTime, Local};
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WanStatus {
    pub interface: String,
    pub kind: WanKind,
}

impl From<&WanCandidate> for WanStatus {
    fn from(c: &WanCandidate) -> Self {
        WanStatus {
            interface: c.name.clone(),
            kind: c.kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusError {
    pub class: ErrorClass,
    pub message: String,
}

impl From<&RouterError> for StatusError {
    fn from(e: &RouterError) -> Self {
        StatusError {
            class: e.class(),
            message: e.to_string(),
        }
    }
}

/// What callers see of the last reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub tunnel: TunnelLifecycle,
    pub tunnel_state: TunnelState,
    /// Profile the active pointer targets
    pub profile: Option<String>,
    /// Profile the tunnel is actually running; differs from `profile` after an
    /// activate until the next restart
    pub running_profile: Option<String>,
    pub wan: Option<WanStatus>,
    /// `false` until a kill-switch apply or check succeeds; deny is presumed meanwhile
    pub firewall_consistent: bool,
    /// Last ping through the tunnel, `None` if not attempted
    pub reachable: Option<bool>,
    pub consecutive_failures: u32,
    pub stop_requested: bool,
    pub last_error: Option<StatusError>,
    pub updated_at: Option<DateTime<Local>>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        StatusSnapshot {
            tunnel: TunnelLifecycle::Down,
            tunnel_state: TunnelState::default(),
            profile: None,
            running_profile: None,
            wan: None,
            firewall_consistent: false,
            reachable: None,
            consecutive_failures: 0,
            stop_requested: false,
            last_error: None,
            updated_at: None,
        }
    }
}

impl StatusSnapshot {
    pub fn no_profile_configured(&self) -> bool {
        self.tunnel == TunnelLifecycle::NoProfile
    }

    /// One line for logs and the CLI
    pub fn summary(&self) -> String {
        let wan = self
            .wan
            .as_ref()
            .map_or_else(|| "none".to_string(), |w| format!("{} ({:?})", w.interface, w.kind));
        let mut line = format!(
            "tunnel={} profile={} wan={} kill-switch={} reachable={}",
            self.tunnel.label(),
            self.profile.as_deref().unwrap_or("-"),
            wan,
            if self.firewall_consistent { "consistent" } else { "INCONSISTENT" },
            self.reachable.map_or("unknown", |r| if r { "yes" } else { "no" }),
        );
        if let Some(running) = &self.running_profile {
            if self.profile.as_deref() != Some(running.as_str()) {
                line.push_str(&format!(" running={}", running));
            }
        }
        if self.stop_requested {
            line.push_str(" (stopped by operator)");
        }
        if let Some(err) = &self.last_error {
            line.push_str(&format!(" last-error[{:?}]={}", err.class, err.message));
        }
        line
    }
}

/// Last snapshot, readable at any time without touching the OS
#[derive(Debug, Default)]
pub struct StatusBoard {
    inner: RwLock<StatusSnapshot>,
}

impl StatusBoard {
    pub fn snapshot(&self) -> StatusSnapshot {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
        guard.updated_at = Some(Local::now());
    }
}
