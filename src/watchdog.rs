//! The reconciliation loop.
//!
//! Each tick re-reads the settings, picks the WAN, then, holding the lifecycle
//! lock, observes the tunnel and applies at most one corrective action. Any
//! error aborts the rest of the tick; a firewall error additionally marks the
//! kill-switch as inconsistent so callers see that traffic is presumed denied.

use crate::control::{Core, Lifecycle};
use crate::errors::{ErrorClass, RouterError, RouterResult};
use crate::settings::WatchdogSettings;
use crate::status::{StatusError, WanStatus};
use crate::tunnel::{Health, TunnelLifecycle};
use crate::wan::WanCandidate;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// What a tick decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No WAN candidate has carrier
    NoWan,
    /// An administrative request held the lifecycle lock
    Busy,
    /// Nothing to start
    NoProfile,
    /// Tunnel left down because an operator stopped it
    HeldByOperator,
    Started,
    StartFailed,
    /// Retry skipped this tick after too many consecutive failures
    BackedOff,
    Restarted,
    Healthy,
    /// Tunnel up but the ping target did not answer
    Unreachable,
    Aborted(ErrorClass),
}

pub struct Watchdog {
    core: Arc<Core>,
    /// Consecutive ticks that found the tunnel failed
    failures: u32,
    /// Consecutive unanswered pings through an up tunnel
    missed_pings: u32,
    backoff_skipped: bool,
    last_wan: Option<String>,
}

impl Watchdog {
    pub fn new(core: Arc<Core>) -> Self {
        Watchdog {
            core,
            failures: 0,
            missed_pings: 0,
            backoff_skipped: false,
            last_wan: None,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// Run ticks until `shutdown` is set
    pub fn run(&mut self, shutdown: &AtomicBool) {
        let interval = self.core.settings.get().check_interval();
        if interval < self.core.tick_budget {
            info!(
                "Worst-case tick ({:?}) exceeds the check interval ({:?}); slow ticks will run back to back",
                self.core.tick_budget, interval
            );
        }
        info!("Watchdog started");

        while !shutdown.load(Ordering::SeqCst) {
            let outcome = self.tick();
            debug!("Tick outcome: {:?}", outcome);
            info!("{}", self.core.status.snapshot().summary());
            self.sleep(shutdown);
        }
        info!("Watchdog stopped");
    }

    /// Sleep for the configured interval in short slices so shutdown is prompt
    fn sleep(&self, shutdown: &AtomicBool) {
        let started = Instant::now();
        loop {
            let interval = self.core.settings.get().check_interval();
            let elapsed = started.elapsed();
            if shutdown.load(Ordering::SeqCst) || elapsed >= interval {
                return;
            }
            thread::sleep(self.core.sleep_slice.min(interval - elapsed));
        }
    }

    /// One observe-decide-act cycle
    pub fn tick(&mut self) -> TickOutcome {
        self.core.settings.refresh();
        let settings = self.core.settings.get();

        let wan = match self.core.wan.select() {
            Ok(Some(wan)) => wan,
            Ok(None) => {
                warn!("No WAN interface has carrier, skipping tick");
                self.core.status.update(|s| {
                    s.wan = None;
                    s.reachable = None;
                });
                return TickOutcome::NoWan;
            }
            Err(e) => return self.abort(e),
        };
        self.core.status.update(|s| s.wan = Some(WanStatus::from(&wan)));

        let core = self.core.clone();
        let mut life = match core.lock() {
            Ok(life) => life,
            Err(e) => {
                info!("{}; retrying next tick", e);
                let err = StatusError::from(&e);
                self.core.status.update(|s| s.last_error = Some(err));
                return TickOutcome::Busy;
            }
        };

        match self.reconcile(&mut life, &settings, &wan) {
            Ok(outcome) => {
                let failures = self.failures;
                self.core.status.update(|s| {
                    s.consecutive_failures = failures;
                    s.last_error = None;
                });
                outcome
            }
            Err(e) => self.abort(e),
        }
    }

    fn abort(&self, e: RouterError) -> TickOutcome {
        let class = e.class();
        if class == ErrorClass::SafetyCritical {
            error!("Kill-switch could not be confirmed, presuming deny: {}", e);
            self.core.status.update(|s| s.firewall_consistent = false);
        } else {
            warn!("Tick aborted ({:?}): {}", class, e);
        }
        let failures = self.failures;
        let err = StatusError::from(&e);
        self.core.status.update(|s| {
            s.consecutive_failures = failures;
            s.last_error = Some(err);
        });
        TickOutcome::Aborted(class)
    }

    fn reconcile(
        &mut self,
        life: &mut Lifecycle,
        settings: &WatchdogSettings,
        wan: &WanCandidate,
    ) -> RouterResult<TickOutcome> {
        let wan_changed = self.last_wan.as_deref() != Some(wan.name.as_str());
        if wan_changed {
            info!("WAN is now {} ({:?}), was {:?}", wan.name, wan.kind, self.last_wan);
            life.apply_kill_switch()?;
            self.last_wan = Some(wan.name.clone());
            // A new path must prove itself before the tunnel counts as usable
            self.core.status.update(|s| s.reachable = None);
        }

        let (lifecycle, state) = life.sample()?;
        if wan_changed {
            if let Some(endpoint) = state.endpoint_ipv4() {
                if let Err(e) = self.core.inspector.pin_route(endpoint, &wan.name) {
                    warn!("Could not route endpoint {} via {}: {}", endpoint, wan.name, e);
                }
            }
        }

        let held = life.intent.stop_requested();
        match lifecycle {
            TunnelLifecycle::NoProfile => {
                self.failures = 0;
                debug!("No VPN profile configured, nothing to do");
                Ok(TickOutcome::NoProfile)
            }
            TunnelLifecycle::Down
            | TunnelLifecycle::Failed(_)
            | TunnelLifecycle::Up(Health::Stale)
                if held =>
            {
                debug!("Tunnel held down by operator");
                Ok(TickOutcome::HeldByOperator)
            }
            TunnelLifecycle::Down => self.start(life),
            TunnelLifecycle::Failed(reason) => {
                self.failures += 1;
                warn!(
                    "Tunnel failed ({}/{}): {}",
                    self.failures, settings.failure_threshold, reason
                );
                if self.failures >= settings.failure_threshold && !self.backoff_skipped {
                    self.backoff_skipped = true;
                    info!("Backing off, next start attempt on the following tick");
                    return Ok(TickOutcome::BackedOff);
                }
                self.backoff_skipped = false;
                self.start(life)
            }
            TunnelLifecycle::Up(Health::Stale) => {
                warn!(
                    "Tunnel stale (handshake age {:?}, rx={} tx={}), restarting",
                    state.handshake_age, state.rx_bytes, state.tx_bytes
                );
                self.restart(life)
            }
            TunnelLifecycle::Up(Health::Healthy) => self.verify(life, settings),
            TunnelLifecycle::Starting | TunnelLifecycle::Stopping => Ok(TickOutcome::Busy),
        }
    }

    fn start(&mut self, life: &mut Lifecycle) -> RouterResult<TickOutcome> {
        let outcome = match life.bring_up() {
            Ok(()) => {
                self.missed_pings = 0;
                TickOutcome::Started
            }
            Err(RouterError::NoActiveProfile) => TickOutcome::NoProfile,
            Err(RouterError::TunnelStartFailed(reason)) => {
                warn!("Start attempt failed: {}", reason);
                TickOutcome::StartFailed
            }
            Err(e) => return Err(e),
        };
        life.refresh()?;
        Ok(outcome)
    }

    fn restart(&mut self, life: &mut Lifecycle) -> RouterResult<TickOutcome> {
        self.missed_pings = 0;
        let outcome = match life.cycle() {
            Ok(()) => TickOutcome::Restarted,
            Err(RouterError::TunnelStartFailed(reason)) => {
                warn!("Restart failed to bring the tunnel back: {}", reason);
                TickOutcome::StartFailed
            }
            Err(e) => return Err(e),
        };
        life.refresh()?;
        Ok(outcome)
    }

    fn verify(
        &mut self,
        life: &mut Lifecycle,
        settings: &WatchdogSettings,
    ) -> RouterResult<TickOutcome> {
        self.failures = 0;
        self.backoff_skipped = false;

        let firewall = life.firewall_state()?;
        if firewall.is_consistent() {
            self.core.status.update(|s| s.firewall_consistent = true);
        } else {
            warn!("Kill-switch drifted, reapplying: {:?}", firewall);
            life.apply_kill_switch()?;
        }

        let reachable = self
            .core
            .inspector
            .ping(&settings.ping_target, life.tunnel.interface(), self.core.ping_timeout_ms);
        self.core.status.update(|s| s.reachable = Some(reachable));
        if reachable {
            self.missed_pings = 0;
            return Ok(TickOutcome::Healthy);
        }

        self.missed_pings += 1;
        warn!(
            "{} unreachable through {} ({}/{})",
            settings.ping_target,
            life.tunnel.interface(),
            self.missed_pings,
            settings.failure_threshold
        );
        if self.missed_pings >= settings.failure_threshold {
            return self.restart(life);
        }
        Ok(TickOutcome::Unreachable)
    }
}
