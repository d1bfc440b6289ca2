use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::RwLock;

use tracing::debug;

use crate::error::Result;
use crate::types::Memory;

struct State {
    entries: Vec<Memory>,
    next_id: u64,
}

/// In-memory note store with optional single-file YAML persistence.
pub struct MemoryStore {
    inner: RwLock<State>,
    persist_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(State { entries: Vec::new(), next_id: 1 }),
            persist_path: None,
        }
    }

    /// Persisted store. `next_id` is rebuilt from the highest id observed in
    /// the file so ids stay monotonic across restarts.
    pub fn with_persistence(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let entries: Vec<Memory> = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_yaml::from_str(&raw)?,
            Err(_) => Vec::new(),
        };
        let next_id = entries
            .iter()
            .filter_map(|m| m.id.strip_prefix("mem_")?.parse::<u64>().ok())
            .max()
            .map_or(1, |n| n + 1);
        debug!(count = entries.len(), next_id, "memories loaded");

        Ok(Self {
            inner: RwLock::new(State { entries, next_id }),
            persist_path: Some(path),
        })
    }

    /// Add a globally visible note.
    pub fn add(&self, content: impl Into<String>, tags: &[&str]) -> Result<Memory> {
        self.insert(content.into(), tags, None)
    }

    /// Add a note visible only to `actor_id` (besides global queries that
    /// carry that actor).
    pub fn add_for_actor(
        &self,
        actor_id: impl Into<String>,
        content: impl Into<String>,
        tags: &[&str],
    ) -> Result<Memory> {
        self.insert(content.into(), tags, Some(actor_id.into()))
    }

    fn insert(&self, content: String, tags: &[&str], actor_id: Option<String>) -> Result<Memory> {
        let memory = {
            let mut state = self.inner.write().unwrap();
            let memory = Memory {
                id: format!("mem_{}", state.next_id),
                content,
                tags: tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
                actor_id,
                created_at: chrono::Utc::now().to_rfc3339(),
            };
            state.next_id += 1;
            state.entries.push(memory.clone());
            memory
        };
        self.persist()?;
        Ok(memory)
    }

    /// Case-insensitive substring search over content.
    pub fn search(&self, query: &str) -> Vec<Memory> {
        let needle = query.to_lowercase();
        self.inner
            .read()
            .unwrap()
            .entries
            .iter()
            .filter(|m| m.content.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    /// Exact tag-membership filter.
    pub fn search_by_tag(&self, tag: &str) -> Vec<Memory> {
        self.inner
            .read()
            .unwrap()
            .entries
            .iter()
            .filter(|m| m.has_tag(tag))
            .cloned()
            .collect()
    }

    /// Union of global memories and memories scoped to `actor_id`,
    /// optionally restricted to one tag.
    pub fn memories_for_actor(&self, actor_id: Option<&str>, tag: Option<&str>) -> Vec<Memory> {
        self.inner
            .read()
            .unwrap()
            .entries
            .iter()
            .filter(|m| m.is_global() || m.actor_id.as_deref() == actor_id)
            .filter(|m| tag.map_or(true, |t| m.has_tag(t)))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Memory> {
        self.inner.read().unwrap().entries.clone()
    }

    fn persist(&self) -> Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };
        let entries = self.inner.read().unwrap().entries.clone();
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, serde_yaml::to_string(&entries)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}
