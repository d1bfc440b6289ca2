//! Lock files for plugins/channels/skills pulled from a Git reference.
//!
//! Fetching and building the artifacts is the installer's job; the broker
//! only consumes the lock contract: a resolution is sticky — believed when
//! the recorded `github` + `ref` match the request and the resolved
//! artifact path still exists on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BrokerError, Result};

pub const PLUGINS_LOCK: &str = "plugins.lock";
pub const CHANNELS_LOCK: &str = "channels.lock";
pub const SKILLS_LOCK: &str = "skills.lock";
pub const LUA_PLUGINS_LOCK: &str = "lua_plugins.lock";

/// One pinned resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    pub github: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Resolved commit SHA.
    pub resolved: String,
    /// Built artifact path on disk.
    pub path: String,
}

/// A name-keyed lock file (`plugins.lock`, `channels.lock`, …).
pub struct LockFile {
    path: PathBuf,
    entries: BTreeMap<String, LockEntry>,
}

impl LockFile {
    /// Load the lock file, or start empty when it does not exist.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_yaml::from_str(&raw)
                .map_err(|e| BrokerError::LockFile(format!("{}: {e}", path.display())))?,
            Err(_) => BTreeMap::new(),
        };
        Ok(Self { path, entries })
    }

    /// Return the pinned entry for `name` when it is still believable:
    /// same github + ref, non-empty resolved SHA, and the artifact path
    /// present on disk. Anything else means the caller must re-resolve.
    pub fn sticky(&self, name: &str, github: &str, git_ref: &str) -> Option<&LockEntry> {
        let entry = self.entries.get(name)?;
        if entry.github != github || entry.git_ref != git_ref {
            return None;
        }
        if entry.resolved.is_empty() || !Path::new(&entry.path).exists() {
            return None;
        }
        debug!(name, resolved = %entry.resolved, "lock entry reused");
        Some(entry)
    }

    /// Record a fresh resolution and persist immediately.
    pub fn pin(&mut self, name: impl Into<String>, entry: LockEntry) -> Result<()> {
        self.entries.insert(name.into(), entry);
        self.save()
    }

    pub fn get(&self, name: &str) -> Option<&LockEntry> {
        self.entries.get(name)
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_yaml::to_string(&self.entries)
            .map_err(|e| BrokerError::LockFile(e.to_string()))?;
        let tmp = self.path.with_extension("lock.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
