//! Tunnel profile storage and the active-profile pointer.
//!
//! Profiles live in a mode 700 directory as `NAME.conf` (WireGuard) or
//! `NAME.ovpn` (OpenVPN), each mode 600. The active profile is a single
//! symlink `POINTER_DIR/<tunnel>.conf` into that directory, swapped with
//! `rename(2)` so a reader sees either the old or the new target.

use crate::errors::{RouterError, RouterResult};
use crate::exec::validate_profile_name;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{symlink, DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    WireGuard,
    OpenVpn,
}

impl ProtocolKind {
    pub fn extension(self) -> &'static str {
        match self {
            ProtocolKind::WireGuard => "conf",
            ProtocolKind::OpenVpn => "ovpn",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "conf" => Some(ProtocolKind::WireGuard),
            "ovpn" => Some(ProtocolKind::OpenVpn),
            _ => None,
        }
    }

    /// Guess the protocol from a configuration blob
    pub fn detect(contents: &str) -> Option<Self> {
        let mut openvpn_hint = false;
        for line in contents.lines().map(str::trim) {
            if line.eq_ignore_ascii_case("[Interface]") {
                return Some(ProtocolKind::WireGuard);
            }
            let directive = line.split_whitespace().next().unwrap_or("");
            if matches!(directive, "client" | "remote" | "dev" | "<ca>") {
                openvpn_hint = true;
            }
        }
        openvpn_hint.then_some(ProtocolKind::OpenVpn)
    }
}

/// A named VPN configuration on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelProfile {
    pub name: String,
    pub kind: ProtocolKind,
    pub path: PathBuf,
    /// `NAME.auth` holding OpenVPN username and password
    pub credentials: Option<PathBuf>,
}

/// Username/password pair referenced by an OpenVPN profile
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
    pointer: PathBuf,
}

impl ProfileStore {
    /// `pointer` is the active-profile symlink, e.g. `/etc/wireguard/wg0.conf`
    pub fn new(dir: impl Into<PathBuf>, pointer: impl Into<PathBuf>) -> Self {
        ProfileStore {
            dir: dir.into(),
            pointer: pointer.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pointer(&self) -> &Path {
        &self.pointer
    }

    /// Create the profile directory with mode 700
    pub fn ensure_dir(&self) -> RouterResult<()> {
        fs::DirBuilder::new().recursive(true).mode(0o700).create(&self.dir)?;
        fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))?;
        Ok(())
    }

    fn path_for(&self, name: &str, kind: ProtocolKind) -> PathBuf {
        self.dir.join(format!("{}.{}", name, kind.extension()))
    }

    fn auth_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.auth", name))
    }

    fn load(&self, name: &str, kind: ProtocolKind) -> RouterResult<TunnelProfile> {
        let path = self.path_for(name, kind);
        let mode = fs::metadata(&path)?.permissions().mode();
        if mode & 0o077 != 0 {
            warn!("Profile {} had mode {:o}, restricting to 600", name, mode & 0o777);
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }
        let auth = self.auth_path(name);
        let credentials = (kind == ProtocolKind::OpenVpn && auth.exists()).then_some(auth);
        Ok(TunnelProfile {
            name: name.to_string(),
            kind,
            path,
            credentials,
        })
    }

    pub fn get(&self, name: &str) -> RouterResult<TunnelProfile> {
        validate_profile_name(name)?;
        for kind in [ProtocolKind::WireGuard, ProtocolKind::OpenVpn] {
            if self.path_for(name, kind).is_file() {
                return self.load(name, kind);
            }
        }
        Err(RouterError::ProfileNotFound(name.to_string()))
    }

    pub fn list(&self) -> RouterResult<Vec<TunnelProfile>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut profiles = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let kind = path
                .extension()
                .and_then(|e| e.to_str())
                .and_then(ProtocolKind::from_extension);
            let name = path.file_stem().and_then(|s| s.to_str());
            if let (Some(kind), Some(name)) = (kind, name) {
                if validate_profile_name(name).is_ok() {
                    profiles.push(self.load(name, kind)?);
                }
            }
        }
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(profiles)
    }

    /// Store a profile, replacing an existing one of the same protocol
    pub fn import(
        &self,
        name: &str,
        contents: &str,
        credentials: Option<&Credentials>,
    ) -> RouterResult<TunnelProfile> {
        validate_profile_name(name)?;
        let kind = ProtocolKind::detect(contents).ok_or_else(|| RouterError::InvalidProfile {
            name: name.to_string(),
            reason: "neither a WireGuard nor an OpenVPN configuration".to_string(),
        })?;
        let other = match kind {
            ProtocolKind::WireGuard => ProtocolKind::OpenVpn,
            ProtocolKind::OpenVpn => ProtocolKind::WireGuard,
        };
        if self.path_for(name, other).exists() {
            return Err(RouterError::InvalidProfile {
                name: name.to_string(),
                reason: "name already used by a profile of another protocol".to_string(),
            });
        }

        self.ensure_dir()?;
        self.write_private(&self.path_for(name, kind), contents.as_bytes())?;
        match (kind, credentials) {
            (ProtocolKind::OpenVpn, Some(c)) => {
                let body = format!("{}\n{}\n", c.username, c.password);
                self.write_private(&self.auth_path(name), body.as_bytes())?;
            }
            (ProtocolKind::WireGuard, Some(_)) => {
                warn!("Ignoring credentials for WireGuard profile {}; keys are embedded", name);
            }
            _ => {}
        }
        info!("Imported {:?} profile {}", kind, name);
        self.load(name, kind)
    }

    fn write_private(&self, path: &Path, data: &[u8]) -> RouterResult<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.as_file().set_permissions(fs::Permissions::from_mode(0o600))?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| RouterError::IOError(e.error))?;
        Ok(())
    }

    /// Profile the pointer currently resolves to
    pub fn active(&self) -> RouterResult<Option<TunnelProfile>> {
        let target = match fs::read_link(&self.pointer) {
            Ok(target) => target,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) if e.kind() == ErrorKind::InvalidInput => {
                return Err(RouterError::InvalidConfiguration(format!(
                    "{} is a regular file, not an active-profile link",
                    self.pointer.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let name = target
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                RouterError::InvalidConfiguration(format!(
                    "unusable link target {}",
                    target.display()
                ))
            })?;
        self.get(name).map(Some)
    }

    /// Point the active pointer at `name` in one atomic step.
    /// Does not start anything; a missing profile leaves the pointer untouched.
    pub fn activate(&self, name: &str) -> RouterResult<TunnelProfile> {
        let profile = self.get(name)?;
        let parent = self.pointer.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;

        let file_name = self
            .pointer
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("active");
        let staging = parent.join(format!(".{}.{}.tmp", file_name, std::process::id()));
        match fs::remove_file(&staging) {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        symlink(&profile.path, &staging)?;
        if let Err(e) = fs::rename(&staging, &self.pointer) {
            let _ = fs::remove_file(&staging);
            return Err(e.into());
        }
        debug!("{} -> {}", self.pointer.display(), profile.path.display());
        info!("Activated profile {}", name);
        Ok(profile)
    }

    pub fn deactivate(&self) -> RouterResult<()> {
        match fs::remove_file(&self.pointer) {
            Ok(()) => {
                info!("Active profile cleared");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the profile files. Clears the pointer when it targeted this
    /// profile; the caller stops the tunnel beforehand.
    pub fn delete(&self, name: &str) -> RouterResult<bool> {
        let profile = self.get(name)?;
        let was_active = matches!(self.active(), Ok(Some(ref p)) if p.name == profile.name);
        if was_active {
            self.deactivate()?;
        }
        fs::remove_file(&profile.path)?;
        if let Some(auth) = &profile.credentials {
            fs::remove_file(auth)?;
        }
        info!("Deleted profile {}", name);
        Ok(was_active)
    }
}
