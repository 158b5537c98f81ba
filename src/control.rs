//! Control surface shared by the watchdog and administrative callers.
//!
//! [`Router`] is what an HTTP layer or the CLI talks to. Every operation that
//! touches the tunnel, the active pointer or the firewall goes through the
//! [`Lifecycle`] behind the lifecycle lock; [`Router::get_status`] only reads
//! the last published snapshot.

use crate::config::RouterConfig;
use crate::errors::{RouterError, RouterResult};
use crate::exec::CommandRunner;
use crate::firewall::{FirewallController, FirewallState};
use crate::lock::{LifecycleGuard, LifecycleLock, OperatorIntent};
use crate::network::InterfaceInspector;
use crate::profiles::{Credentials, ProfileStore, TunnelProfile};
use crate::settings::{SettingsStore, WatchdogSettings};
use crate::status::{StatusBoard, StatusError, StatusSnapshot, WanStatus};
use crate::tunnel::{TunnelController, TunnelLifecycle, TunnelOptions, TunnelState};
use crate::wan::WanSelector;
use crate::watchdog::Watchdog;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

/// State mutated only while holding the lifecycle lock
pub struct Lifecycle {
    pub tunnel: TunnelController,
    pub firewall: FirewallController,
    pub intent: OperatorIntent,
    lans: Vec<String>,
    status: Arc<StatusBoard>,
}

impl Lifecycle {
    pub fn lans(&self) -> &[String] {
        &self.lans
    }

    fn mark(&self, lifecycle: TunnelLifecycle) {
        self.status.update(|s| s.tunnel = lifecycle);
    }

    /// Install or repair the kill-switch. On failure the posture is reported
    /// as inconsistent and traffic is presumed denied.
    pub fn apply_kill_switch(&self) -> RouterResult<()> {
        let result = self.firewall.apply_kill_switch(self.tunnel.interface(), &self.lans);
        let ok = result.is_ok();
        self.status.update(|s| s.firewall_consistent = ok);
        result
    }

    pub fn firewall_state(&self) -> RouterResult<FirewallState> {
        self.firewall.inspect(self.tunnel.interface(), &self.lans)
    }

    /// Kill-switch first, then the tunnel
    pub fn bring_up(&mut self) -> RouterResult<()> {
        self.apply_kill_switch()?;
        self.mark(TunnelLifecycle::Starting);
        self.tunnel.start()
    }

    pub fn take_down(&mut self) -> RouterResult<()> {
        self.mark(TunnelLifecycle::Stopping);
        self.tunnel.stop()
    }

    pub fn cycle(&mut self) -> RouterResult<()> {
        self.apply_kill_switch()?;
        self.mark(TunnelLifecycle::Stopping);
        self.tunnel.restart()
    }

    /// Observe the tunnel and publish what was seen
    pub fn refresh(&mut self) -> RouterResult<(TunnelLifecycle, TunnelState)> {
        let observed = self.tunnel.observe()?;
        self.publish(observed)
    }

    /// The watchdog's once-per-tick observation
    pub fn sample(&mut self) -> RouterResult<(TunnelLifecycle, TunnelState)> {
        let observed = self.tunnel.sample()?;
        self.publish(observed)
    }

    fn publish(
        &self,
        observed: (TunnelLifecycle, TunnelState),
    ) -> RouterResult<(TunnelLifecycle, TunnelState)> {
        let profile = self.tunnel.store().active().ok().flatten().map(|p| p.name);
        let running = self.tunnel.running().map(|r| r.name);
        let stop_requested = self.intent.stop_requested();
        let (lifecycle, state) = observed.clone();
        self.status.update(|s| {
            s.tunnel = lifecycle;
            s.tunnel_state = state;
            s.profile = profile;
            s.running_profile = running;
            s.stop_requested = stop_requested;
        });
        Ok(observed)
    }
}

/// Everything the watchdog and the control surface share
pub struct Core {
    pub settings: SettingsStore,
    pub wan: WanSelector,
    pub inspector: InterfaceInspector,
    pub lifecycle: LifecycleLock<Lifecycle>,
    pub status: Arc<StatusBoard>,
    pub lock_wait: Duration,
    pub ping_timeout_ms: u64,
    pub tick_budget: Duration,
    pub sleep_slice: Duration,
}

impl Core {
    pub fn new(config: &RouterConfig, runner: Arc<dyn CommandRunner>) -> RouterResult<Self> {
        config.validate()?;
        let settings = SettingsStore::load(&config.settings_path)?;
        let inspector = InterfaceInspector::new(runner.clone(), config.command_timeout);

        let mut excluded = config.lan_interfaces.clone();
        excluded.push(config.tunnel_interface.clone());
        let wan = WanSelector::new(inspector.clone(), config.wan_interfaces.clone(), excluded);

        let store = ProfileStore::new(&config.profiles_dir, config.pointer_path());
        let tunnel = TunnelController::new(
            runner.clone(),
            store,
            TunnelOptions {
                interface: config.tunnel_interface.clone(),
                command_timeout: config.command_timeout,
                start_timeout: config.start_timeout,
                stop_timeout: config.stop_timeout,
                poll_interval: config.poll_interval,
                handshake_timeout: config.handshake_timeout,
                stall_ticks: config.stall_ticks,
                run_dir: config
                    .state_dir
                    .clone()
                    .unwrap_or_else(|| TunnelOptions::default().run_dir),
                running_record: config.state_dir.as_ref().map(|dir| dir.join("running.toml")),
            },
        );
        let firewall = FirewallController::new(runner, config.command_timeout);
        let status = Arc::new(StatusBoard::default());

        let intent = match &config.state_dir {
            Some(dir) => OperatorIntent::persisted(dir.join("stop-requested")),
            None => OperatorIntent::in_memory(),
        };
        let lifecycle = Lifecycle {
            tunnel,
            firewall,
            intent,
            lans: config.lan_interfaces.clone(),
            status: status.clone(),
        };
        let lifecycle = match &config.state_dir {
            Some(dir) => LifecycleLock::with_lock_file(lifecycle, dir.join("lifecycle.lock")),
            None => LifecycleLock::new(lifecycle),
        };

        Ok(Core {
            settings,
            wan,
            inspector,
            lifecycle,
            status,
            lock_wait: config.lock_wait,
            ping_timeout_ms: config.ping_timeout_ms,
            tick_budget: config.tick_budget(),
            sleep_slice: config.sleep_slice,
        })
    }

    pub fn lock(&self) -> RouterResult<LifecycleGuard<'_, Lifecycle>> {
        self.lifecycle.acquire(self.lock_wait)
    }
}

/// A stored profile and whether it is the active one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileEntry {
    pub profile: TunnelProfile,
    pub active: bool,
}

/// Boundary for the HTTP layer and the CLI
#[derive(Clone)]
pub struct Router {
    core: Arc<Core>,
}

impl Router {
    pub fn new(config: &RouterConfig, runner: Arc<dyn CommandRunner>) -> RouterResult<Self> {
        Ok(Router {
            core: Arc::new(Core::new(config, runner)?),
        })
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// The reconciliation loop bound to this router's state
    pub fn watchdog(&self) -> Watchdog {
        Watchdog::new(self.core.clone())
    }

    /// Last published snapshot; never runs a command
    pub fn get_status(&self) -> StatusSnapshot {
        self.core.status.snapshot()
    }

    fn record<T>(&self, result: RouterResult<T>) -> RouterResult<T> {
        if let Err(e) = &result {
            warn!("Administrative request failed: {}", e);
            let err = StatusError::from(e);
            if !matches!(e, RouterError::Busy) {
                self.core.status.update(|s| s.last_error = Some(err));
            }
        }
        result
    }

    /// Start the tunnel, first activating `profile` when given. A tunnel
    /// running some other profile is taken down before the pointer moves.
    pub fn request_start(&self, profile: Option<&str>) -> RouterResult<()> {
        let result = (|| -> RouterResult<()> {
            let mut life = self.core.lock()?;
            if let Some(name) = profile {
                let target = life.tunnel.store().get(name)?;
                if life.tunnel.running().is_some_and(|r| r.name != target.name) {
                    life.take_down()?;
                }
                life.tunnel.activate(name)?;
            }
            life.intent.clear()?;
            let started = life.bring_up();
            life.refresh()?;
            started
        })();
        self.record(result)
    }

    /// Stop the tunnel and keep it down until the next start or activate.
    /// The kill-switch stays in place.
    pub fn request_stop(&self) -> RouterResult<()> {
        let result = (|| -> RouterResult<()> {
            let mut life = self.core.lock()?;
            life.intent.request_stop()?;
            info!("Operator requested tunnel stop");
            let stopped = life.take_down();
            life.refresh()?;
            stopped
        })();
        self.record(result)
    }

    pub fn request_restart(&self) -> RouterResult<()> {
        let result = (|| -> RouterResult<()> {
            let mut life = self.core.lock()?;
            life.intent.clear()?;
            let restarted = life.cycle();
            life.refresh()?;
            restarted
        })();
        self.record(result)
    }

    /// Switch the active profile; the watchdog brings it up if the tunnel is down
    pub fn request_activate(&self, profile: &str) -> RouterResult<TunnelProfile> {
        let result = (|| -> RouterResult<TunnelProfile> {
            let mut life = self.core.lock()?;
            let activated = life.tunnel.activate(profile)?;
            life.intent.clear()?;
            life.refresh()?;
            Ok(activated)
        })();
        self.record(result)
    }

    pub fn get_settings(&self) -> WatchdogSettings {
        self.core.settings.get()
    }

    pub fn update_settings(
        &self,
        ping_target: &str,
        check_interval_secs: u64,
    ) -> RouterResult<WatchdogSettings> {
        self.core.settings.update(ping_target, check_interval_secs)
    }

    pub fn update_failure_threshold(
        &self,
        failure_threshold: u32,
    ) -> RouterResult<WatchdogSettings> {
        self.core.settings.update_failure_threshold(failure_threshold)
    }

    /// Store a profile; it becomes active when no other profile is
    pub fn import_profile(
        &self,
        name: &str,
        contents: &str,
        credentials: Option<&Credentials>,
    ) -> RouterResult<TunnelProfile> {
        let result = (|| -> RouterResult<TunnelProfile> {
            let mut life = self.core.lock()?;
            let profile = life.tunnel.store().import(name, contents, credentials)?;
            let has_active = matches!(life.tunnel.store().active(), Ok(Some(_)));
            if !has_active {
                life.tunnel.activate(&profile.name)?;
            }
            Ok(profile)
        })();
        self.record(result)
    }

    /// Delete a profile, bringing the tunnel down first when it is active or running
    pub fn delete_profile(&self, name: &str) -> RouterResult<()> {
        let result = (|| -> RouterResult<()> {
            let mut life = self.core.lock()?;
            let target = life.tunnel.store().get(name)?;
            let is_active = matches!(
                life.tunnel.store().active(),
                Ok(Some(ref p)) if p.name == target.name
            );
            let is_running = life.tunnel.running().is_some_and(|r| r.name == target.name);
            if is_active || is_running {
                life.take_down()?;
            }
            life.tunnel.store().delete(name)?;
            life.refresh()?;
            Ok(())
        })();
        self.record(result)
    }

    pub fn list_profiles(&self) -> RouterResult<Vec<ProfileEntry>> {
        let life = self.core.lock()?;
        let store = life.tunnel.store();
        let active = store.active().ok().flatten().map(|p| p.name);
        Ok(store
            .list()?
            .into_iter()
            .map(|profile| ProfileEntry {
                active: active.as_deref() == Some(profile.name.as_str()),
                profile,
            })
            .collect())
    }

    /// Observe everything now instead of waiting for the next tick
    pub fn probe(&self) -> RouterResult<StatusSnapshot> {
        let wan = self.core.wan.select()?;
        let mut life = self.core.lock()?;
        life.refresh()?;
        let firewall = life.firewall_state()?;
        self.core.status.update(|s| {
            s.wan = wan.as_ref().map(WanStatus::from);
            s.firewall_consistent = firewall.is_consistent();
        });
        Ok(self.core.status.snapshot())
    }

    /// Remove the kill-switch entirely, for uninstall or an explicit operator exit
    pub fn release_kill_switch(&self) -> RouterResult<()> {
        let life = self.core.lock()?;
        life.firewall.teardown()?;
        self.core.status.update(|s| s.firewall_consistent = false);
        Ok(())
    }
}
