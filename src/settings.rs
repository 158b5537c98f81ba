//! Operator-tunable watchdog policy, persisted as a small TOML file.

use crate::errors::{RouterError, RouterResult};
use crate::exec::validate_host;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

pub const MIN_CHECK_INTERVAL_SECS: u64 = 10;
pub const MAX_CHECK_INTERVAL_SECS: u64 = 300;
pub const MAX_FAILURE_THRESHOLD: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    /// Host pinged through the tunnel to prove reachability
    pub ping_target: String,
    pub check_interval_secs: u64,
    /// Consecutive failed checks before a restart
    pub failure_threshold: u32,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        WatchdogSettings {
            ping_target: "1.1.1.1".to_string(),
            check_interval_secs: 30,
            failure_threshold: 3,
        }
    }
}

impl WatchdogSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn validate(&self) -> RouterResult<()> {
        if self.ping_target.trim().is_empty() {
            return Err(RouterError::InvalidSettings("ping target must not be blank".into()));
        }
        validate_host(&self.ping_target).map_err(|_| {
            RouterError::InvalidSettings(format!(
                "ping target {:?} is not a host",
                self.ping_target
            ))
        })?;
        let interval_bounds = MIN_CHECK_INTERVAL_SECS..=MAX_CHECK_INTERVAL_SECS;
        if !interval_bounds.contains(&self.check_interval_secs) {
            return Err(RouterError::InvalidSettings(format!(
                "check interval {}s outside [{}, {}]",
                self.check_interval_secs, MIN_CHECK_INTERVAL_SECS, MAX_CHECK_INTERVAL_SECS
            )));
        }
        if !(1..=MAX_FAILURE_THRESHOLD).contains(&self.failure_threshold) {
            return Err(RouterError::InvalidSettings(format!(
                "failure threshold {} outside [1, {}]",
                self.failure_threshold, MAX_FAILURE_THRESHOLD
            )));
        }
        Ok(())
    }
}

/// Identity of the file last read or written: inode, size and mtime. A
/// persist renames a new file into place, so any write changes the inode.
type FileStamp = (u64, u64, Option<SystemTime>);

fn stamp(path: &Path) -> Option<FileStamp> {
    let meta = fs::metadata(path).ok()?;
    Some((meta.ino(), meta.len(), meta.modified().ok()))
}

/// Parse the file at `path`; `None` when it does not exist
fn read_file(path: &Path) -> RouterResult<Option<(WatchdogSettings, Option<FileStamp>)>> {
    // stamp first, so a write racing the read is picked up next time
    let stamp = stamp(path);
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let parsed: WatchdogSettings = toml::from_str(&content)?;
    parsed.validate()?;
    Ok(Some((parsed, stamp)))
}

#[derive(Debug)]
struct Loaded {
    settings: WatchdogSettings,
    stamp: Option<FileStamp>,
}

/// Settings shared between the watchdog and administrative callers.
///
/// Reads never block on disk. Writes happen under the write guard: pick up
/// what another process persisted, apply the change, validate, persist
/// through a temporary file renamed into place, and only then publish.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    current: Arc<RwLock<Loaded>>,
}

impl SettingsStore {
    /// Load from `path`; a missing file yields defaults
    pub fn load(path: impl Into<PathBuf>) -> RouterResult<Self> {
        let path = path.into();
        let loaded = match read_file(&path)? {
            Some((settings, stamp)) => Loaded { settings, stamp },
            None => {
                info!("No settings at {}, using defaults", path.display());
                Loaded {
                    settings: WatchdogSettings::default(),
                    stamp: None,
                }
            }
        };
        Ok(SettingsStore {
            path,
            current: Arc::new(RwLock::new(loaded)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> WatchdogSettings {
        match self.current.read() {
            Ok(guard) => guard.settings.clone(),
            Err(poisoned) => poisoned.into_inner().settings.clone(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Loaded> {
        match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Pick up settings another process persisted since the last read.
    /// An unreadable or invalid file is logged and the current values kept.
    pub fn refresh(&self) {
        let mut guard = self.write();
        self.reload(&mut guard);
    }

    fn reload(&self, loaded: &mut Loaded) {
        let current = stamp(&self.path);
        if current.is_none() || current == loaded.stamp {
            return;
        }
        match read_file(&self.path) {
            Ok(Some((settings, stamp))) => {
                if settings != loaded.settings {
                    info!(
                        "Settings reloaded: target={} interval={}s threshold={}",
                        settings.ping_target,
                        settings.check_interval_secs,
                        settings.failure_threshold
                    );
                }
                loaded.settings = settings;
                loaded.stamp = stamp;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Keeping current settings, {} is unusable: {}", self.path.display(), e);
                loaded.stamp = current;
            }
        }
    }

    pub fn update(
        &self,
        ping_target: &str,
        check_interval_secs: u64,
    ) -> RouterResult<WatchdogSettings> {
        self.modify(|next| {
            next.ping_target = ping_target.trim().to_string();
            next.check_interval_secs = check_interval_secs;
        })
    }

    pub fn update_failure_threshold(
        &self,
        failure_threshold: u32,
    ) -> RouterResult<WatchdogSettings> {
        self.modify(|next| next.failure_threshold = failure_threshold)
    }

    fn modify(&self, change: impl FnOnce(&mut WatchdogSettings)) -> RouterResult<WatchdogSettings> {
        let mut guard = self.write();
        self.reload(&mut guard);
        let mut next = guard.settings.clone();
        change(&mut next);
        if let Err(e) = next.validate() {
            warn!("Rejected settings update: {}", e);
            return Err(e);
        }
        persist(&self.path, &next)?;
        guard.settings = next.clone();
        guard.stamp = stamp(&self.path);
        info!(
            "Settings updated: target={} interval={}s threshold={}",
            next.ping_target, next.check_interval_secs, next.failure_threshold
        );
        Ok(next)
    }
}

fn persist(path: &Path, settings: &WatchdogSettings) -> RouterResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let body = toml::to_string(settings)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(body.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| RouterError::IOError(e.error))?;
    Ok(())
}
