//! VPN uplink profiles and the active-profile pointer.
//!
//! A profile is a WireGuard client config stored as `<name>.conf` in the
//! profiles directory. The active profile is recorded twice: a symlink the
//! gateway container mounts as its config, and a plain-text file holding the
//! display name for the dashboard. The symlink is always updated first, so
//! a crash in between leaves the right config with a stale name.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{HubError, HubResult};
use crate::fsutil;
use crate::validation;

/// Name reported when the active name file is missing or empty
pub const UNKNOWN_PROFILE: &str = "Unknown";

/// Fallback when neither the caller nor the config supplies a name
const DEFAULT_PROFILE_NAME: &str = "vpn-profile";

/// Longest comment accepted as a display name
const MAX_COMMENT_NAME_LEN: usize = 50;

/// A profile on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    /// File stem, used for activate/delete
    pub name: String,
    /// Name extracted from the config comments, else the file stem
    pub display_name: String,
    /// Whether the active pointer resolves to this file
    pub active: bool,
}

/// Extract a display name from WireGuard config comments.
///
/// Looks for the first non-empty comment inside `[Peer]`, then for the first
/// comment line anywhere that is not a commented-out `key = value`.
pub fn extract_profile_name(config: &str) -> Option<String> {
    let mut in_peer = false;
    for line in config.lines() {
        let line = line.trim();
        if line.eq_ignore_ascii_case("[peer]") {
            in_peer = true;
            continue;
        }
        if in_peer {
            if line.starts_with('[') {
                break;
            }
            if let Some(comment) = line.strip_prefix('#') {
                let name = comment.trim_start_matches('#').trim();
                if !name.is_empty() {
                    return Some(name.to_string());
                }
            }
        }
    }

    config
        .lines()
        .filter_map(|line| line.trim().strip_prefix('#'))
        .map(|comment| comment.trim_start_matches('#').trim())
        .find(|name| !name.is_empty() && !name.contains('='))
        .map(str::to_string)
}

/// Profile files in one directory
#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a profile's config file; validates the name
    pub fn path_for(&self, name: &str) -> HubResult<PathBuf> {
        validation::validate_profile_name(name)?;
        Ok(self.dir.join(format!("{}.conf", name)))
    }

    /// Path of an existing profile, `NotFound` otherwise
    pub fn existing(&self, name: &str) -> HubResult<PathBuf> {
        let path = self.path_for(name)?;
        if !path.is_file() {
            return Err(HubError::NotFound(format!("VPN profile '{}' not found", name)));
        }
        Ok(path)
    }

    pub fn read(&self, name: &str) -> HubResult<String> {
        let path = self.existing(name)?;
        Ok(std::fs::read_to_string(path)?)
    }

    /// Profile names, sorted; the active pointer is excluded
    pub fn names(&self) -> HubResult<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(HubError::Io(e)),
        };

        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let file_name = entry.file_name().to_string_lossy().to_string();
                let stem = file_name.strip_suffix(".conf")?.to_string();
                if stem == "active" || validation::validate_profile_name(&stem).is_err() {
                    return None;
                }
                let is_file = std::fs::symlink_metadata(entry.path())
                    .map(|m| m.file_type().is_file())
                    .unwrap_or(false);
                is_file.then_some(stem)
            })
            .collect();
        names.sort();
        Ok(names)
    }

    /// Profiles with display names and active flags
    pub fn list(&self, active: &ActiveVpnState) -> HubResult<Vec<Profile>> {
        let active_target = active.target();
        let mut profiles = Vec::new();

        for name in self.names()? {
            let path = self.dir.join(format!("{}.conf", name));
            let display_name = std::fs::read_to_string(&path)
                .ok()
                .and_then(|content| extract_profile_name(&content))
                .unwrap_or_else(|| name.clone());
            let is_active = match (&active_target, path.canonicalize()) {
                (Some(target), Ok(canonical)) => *target == canonical,
                _ => false,
            };
            profiles.push(Profile {
                name,
                display_name,
                active: is_active,
            });
        }

        Ok(profiles)
    }

    /// Write a profile and return the name it was stored under.
    ///
    /// Name precedence: `name` argument, then the config's comment name,
    /// then `vpn-profile`. The resulting name must pass validation as-is.
    pub fn save(&self, name: Option<&str>, config: &str) -> HubResult<String> {
        let config = config.trim();
        if config.is_empty() {
            return Err(HubError::InvalidParameter("Config content is required".to_string()));
        }

        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .or_else(|| {
                extract_profile_name(config).filter(|n| n.chars().count() < MAX_COMMENT_NAME_LEN)
            })
            .unwrap_or_else(|| DEFAULT_PROFILE_NAME.to_string());

        let path = self.path_for(&name)?;
        let mut content = config.to_string();
        content.push('\n');
        fsutil::atomic_write(&path, content.as_bytes(), Some(0o600))?;

        info!("VPN profile '{}' saved to {:?}", name, path);
        Ok(name)
    }

    /// Remove a profile's config file
    pub fn remove(&self, name: &str) -> HubResult<()> {
        let path = self.existing(name)?;
        std::fs::remove_file(&path)?;
        debug!("Removed {:?}", path);
        Ok(())
    }
}

/// The pointer/name pair describing the active profile
#[derive(Debug, Clone)]
pub struct ActiveVpnState {
    link: PathBuf,
    name_file: PathBuf,
}

impl ActiveVpnState {
    pub fn new(link: impl Into<PathBuf>, name_file: impl Into<PathBuf>) -> Self {
        Self {
            link: link.into(),
            name_file: name_file.into(),
        }
    }

    pub fn link(&self) -> &Path {
        &self.link
    }

    /// Display name of the active profile, `"Unknown"` if unreadable or empty.
    ///
    /// Safe to call while an activation is rewriting the file.
    pub fn read_name(&self) -> String {
        match std::fs::read_to_string(&self.name_file) {
            Ok(content) => {
                let name = content.trim();
                if name.is_empty() {
                    UNKNOWN_PROFILE.to_string()
                } else {
                    name.to_string()
                }
            }
            Err(e) => {
                debug!("Active profile name unavailable: {}", e);
                UNKNOWN_PROFILE.to_string()
            }
        }
    }

    /// Resolved config file the pointer refers to, if any
    pub fn target(&self) -> Option<PathBuf> {
        self.link.canonicalize().ok()
    }

    /// Point at `config_path` and record `display_name`.
    ///
    /// The symlink is swapped in with a rename so readers never see it
    /// missing; the name file is replaced afterwards.
    pub fn point_to(&self, config_path: &Path, display_name: &str) -> HubResult<()> {
        let dir = self.link.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let tmp_link = dir.join(format!(".active.{}.tmp", uuid::Uuid::new_v4().simple()));
        #[cfg(unix)]
        std::os::unix::fs::symlink(config_path, &tmp_link)?;
        #[cfg(not(unix))]
        std::fs::copy(config_path, &tmp_link)?;

        if let Err(e) = std::fs::rename(&tmp_link, &self.link) {
            let _ = std::fs::remove_file(&tmp_link);
            return Err(HubError::Io(e));
        }

        let name = validation::sanitize_json_string(display_name.trim());
        fsutil::atomic_write(&self.name_file, format!("{}\n", name).as_bytes(), None)?;
        Ok(())
    }
}
