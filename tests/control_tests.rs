mod common;

use common::{test_config, FakeHost, OVPN_PROFILE, WG_PROFILE};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use vpn_failover::errors::{ErrorClass, RouterError};
use vpn_failover::settings::SettingsStore;
use vpn_failover::tunnel::{Health, TunnelLifecycle};
use vpn_failover::{Router, TickOutcome};

fn router(tmp: &TempDir, host: &Arc<FakeHost>) -> Router {
    Router::new(&test_config(tmp), host.clone()).unwrap()
}

#[test]
fn first_import_becomes_active_later_ones_do_not() {
    let tmp = TempDir::new().unwrap();
    let host = FakeHost::with_uplinks();
    let router = router(&tmp, &host);

    router.import_profile("home", WG_PROFILE, None).unwrap();
    router.import_profile("office", OVPN_PROFILE, None).unwrap();

    let profiles = router.list_profiles().unwrap();
    let active: Vec<&str> = profiles
        .iter()
        .filter(|p| p.active)
        .map(|p| p.profile.name.as_str())
        .collect();
    assert_eq!(profiles.len(), 2);
    assert_eq!(active, vec!["home"]);
}

#[test]
fn concurrent_starts_spawn_one_tunnel() {
    let tmp = TempDir::new().unwrap();
    let host = FakeHost::with_uplinks();
    let router = router(&tmp, &host);
    router.import_profile("home", WG_PROFILE, None).unwrap();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let router = router.clone();
            thread::spawn(move || router.request_start(None))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(host.state().count("wg-quick up"), 1);
    assert_eq!(router.get_status().tunnel, TunnelLifecycle::Up(Health::Healthy));
}

#[test]
fn start_without_profile_reports_structural_error() {
    let tmp = TempDir::new().unwrap();
    let host = FakeHost::with_uplinks();
    let router = router(&tmp, &host);

    let err = router.request_start(None).unwrap_err();
    assert!(matches!(err, RouterError::NoActiveProfile));
    let status = router.get_status();
    assert!(status.no_profile_configured());
    assert_eq!(status.last_error.unwrap().class, ErrorClass::Structural);
    assert_eq!(host.state().count("wg-quick"), 0);
}

#[test]
fn activating_missing_profile_keeps_current_one() {
    let tmp = TempDir::new().unwrap();
    let host = FakeHost::with_uplinks();
    let router = router(&tmp, &host);
    router.import_profile("home", WG_PROFILE, None).unwrap();

    let err = router.request_activate("nope").unwrap_err();
    assert!(matches!(err, RouterError::ProfileNotFound(_)));
    let err = router.request_activate("../../etc/passwd").unwrap_err();
    assert!(matches!(err, RouterError::InvalidInput { .. }));

    let active: Vec<_> = router
        .list_profiles()
        .unwrap()
        .into_iter()
        .filter(|p| p.active)
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].profile.name, "home");
}

#[test]
fn deleting_active_profile_stops_tunnel_first() {
    let tmp = TempDir::new().unwrap();
    let host = FakeHost::with_uplinks();
    let router = router(&tmp, &host);
    router.import_profile("home", WG_PROFILE, None).unwrap();
    router.request_start(None).unwrap();

    router.delete_profile("home").unwrap();

    let s = host.state();
    let down = s.calls.iter().position(|c| c.starts_with("wg-quick down")).unwrap();
    assert!(!s.links.contains_key("wg0"));
    assert!(down > 0);
    drop(s);
    assert!(router.list_profiles().unwrap().is_empty());
    assert!(router.get_status().no_profile_configured());
    assert_eq!(router.watchdog().tick(), TickOutcome::NoProfile);
}

#[test]
fn restart_is_safe_to_repeat() {
    let tmp = TempDir::new().unwrap();
    let host = FakeHost::with_uplinks();
    let router = router(&tmp, &host);
    router.import_profile("home", WG_PROFILE, None).unwrap();
    router.request_start(None).unwrap();

    router.request_restart().unwrap();
    router.request_restart().unwrap();

    let s = host.state();
    assert_eq!(s.count("wg-quick down"), 2);
    assert_eq!(s.count("wg-quick up"), 3);
    assert!(s.links.contains_key("wg0"));
    assert!(s.violations.is_empty());
    drop(s);

    let status = router.get_status();
    assert_eq!(status.tunnel, TunnelLifecycle::Up(Health::Healthy));
    assert!(status.tunnel_state.handshake_age.unwrap() < Duration::from_secs(180));
}

#[test]
fn interleaved_activations_leave_exactly_one_active_profile() {
    let tmp = TempDir::new().unwrap();
    let host = FakeHost::with_uplinks();
    let mut config = test_config(&tmp);
    config.lock_wait = Duration::from_secs(5);
    let router = Router::new(&config, host.clone()).unwrap();
    for name in ["alpha", "beta"] {
        router.import_profile(name, WG_PROFILE, None).unwrap();
    }

    let writers: Vec<_> = ["alpha", "beta"]
        .into_iter()
        .map(|name| {
            let router = router.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    router.request_activate(name).unwrap();
                }
            })
        })
        .collect();
    for _ in 0..20 {
        let active: Vec<_> = router
            .list_profiles()
            .unwrap()
            .into_iter()
            .filter(|p| p.active)
            .collect();
        assert_eq!(active.len(), 1);
    }
    for writer in writers {
        writer.join().unwrap();
    }
}

#[test]
fn stop_keeps_kill_switch_in_place() {
    let tmp = TempDir::new().unwrap();
    let host = FakeHost::with_uplinks();
    let router = router(&tmp, &host);
    router.import_profile("home", WG_PROFILE, None).unwrap();
    router.request_start(None).unwrap();

    router.request_stop().unwrap();

    assert!(!host.state().links.contains_key("wg0"));
    let status = router.probe().unwrap();
    assert_eq!(status.tunnel, TunnelLifecycle::Down);
    assert!(status.firewall_consistent);
    assert!(status.stop_requested);
}

#[test]
fn stop_issued_by_another_instance_is_honoured() {
    let tmp = TempDir::new().unwrap();
    let host = FakeHost::with_uplinks();
    let daemon = router(&tmp, &host);
    daemon.import_profile("home", WG_PROFILE, None).unwrap();
    let mut watchdog = daemon.watchdog();
    assert_eq!(watchdog.tick(), TickOutcome::Started);

    let cli = router(&tmp, &host);
    cli.request_stop().unwrap();

    assert_eq!(watchdog.tick(), TickOutcome::HeldByOperator);
    assert!(!host.state().links.contains_key("wg0"));
}

#[test]
fn settings_are_validated_and_persisted() {
    let tmp = TempDir::new().unwrap();
    let host = FakeHost::with_uplinks();
    let router = router(&tmp, &host);
    let before = router.get_settings();

    assert!(matches!(
        router.update_settings("1.1.1.1", 5),
        Err(RouterError::InvalidSettings(_))
    ));
    assert!(matches!(
        router.update_settings("1.1.1.1", 301),
        Err(RouterError::InvalidSettings(_))
    ));
    assert!(matches!(
        router.update_settings("  ", 60),
        Err(RouterError::InvalidSettings(_))
    ));
    assert_eq!(router.get_settings(), before);

    let updated = router.update_settings("9.9.9.9", 60).unwrap();
    assert_eq!(updated.check_interval_secs, 60);
    let reloaded = SettingsStore::load(tmp.path().join("settings.toml")).unwrap().get();
    assert_eq!(reloaded, updated);
}

#[test]
fn settings_changed_by_another_instance_apply_on_next_tick() {
    let tmp = TempDir::new().unwrap();
    let host = FakeHost::with_uplinks();
    let daemon = router(&tmp, &host);
    daemon.import_profile("home", WG_PROFILE, None).unwrap();
    let mut watchdog = daemon.watchdog();
    assert_eq!(watchdog.tick(), TickOutcome::Started);

    let cli = router(&tmp, &host);
    cli.update_settings("9.9.9.9", 60).unwrap();
    cli.update_failure_threshold(5).unwrap();

    assert_eq!(watchdog.tick(), TickOutcome::Healthy);
    let settings = daemon.get_settings();
    assert_eq!(settings.ping_target, "9.9.9.9");
    assert_eq!(settings.check_interval_secs, 60);
    assert_eq!(settings.failure_threshold, 5);
    assert!(host
        .state()
        .calls
        .iter()
        .any(|c| c.starts_with("ping -I wg0") && c.ends_with("9.9.9.9")));
}

#[test]
fn status_reads_never_touch_the_host() {
    let tmp = TempDir::new().unwrap();
    let host = FakeHost::with_uplinks();
    let router = router(&tmp, &host);
    router.watchdog().tick();
    let calls = host.state().calls.len();

    let _ = router.get_status();
    let _ = router.get_settings();

    assert_eq!(host.state().calls.len(), calls);
}

#[test]
fn release_removes_kill_switch_chains() {
    let tmp = TempDir::new().unwrap();
    let host = FakeHost::with_uplinks();
    let router = router(&tmp, &host);
    router.watchdog().tick();
    assert!(router.get_status().firewall_consistent);

    router.release_kill_switch().unwrap();

    let s = host.state();
    assert!(s.rules("filter", "FORWARD").is_empty());
    assert!(s.rules("nat", "POSTROUTING").is_empty());
    assert!(!router.get_status().firewall_consistent);
}
