use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, warn};

use talon_core::types::Message;

use crate::error::{Result, SessionError};
use crate::types::Session;

/// Thread-safe session store.
///
/// Backed by an in-memory map; when constructed with a persistence
/// directory, every mutation writes the affected session out as
/// `<dir>/<id>.yaml` atomically (temp file + rename).
pub struct SessionStore {
    inner: RwLock<HashMap<String, Session>>,
    persist_dir: Option<PathBuf>,
}

impl SessionStore {
    /// Purely in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            persist_dir: None,
        }
    }

    /// Store persisted under `dir` (normally `<data_dir>/sessions`).
    /// Existing session files are loaded eagerly; unreadable files are
    /// skipped with a warning so one corrupt session cannot prevent boot.
    pub fn with_persistence(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut sessions = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            match load_session(&path) {
                Ok(session) => {
                    sessions.insert(session.id.clone(), session);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable session file"),
            }
        }
        debug!(count = sessions.len(), dir = %dir.display(), "sessions loaded");

        Ok(Self {
            inner: RwLock::new(sessions),
            persist_dir: Some(dir),
        })
    }

    /// Create the session if absent. Idempotent.
    pub fn ensure(&self, id: &str) -> Result<()> {
        let created = {
            let mut inner = self.inner.write().unwrap();
            if inner.contains_key(id) {
                None
            } else {
                let session = Session::new(id);
                inner.insert(id.to_string(), session.clone());
                Some(session)
            }
        };
        if let Some(session) = created {
            debug!(session = %id, "session created");
            self.persist(&session)?;
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.read().unwrap().get(id).cloned()
    }

    /// Message history for one session.
    pub fn messages(&self, id: &str) -> Result<Vec<Message>> {
        self.inner
            .read()
            .unwrap()
            .get(id)
            .map(|s| s.messages.clone())
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })
    }

    /// Append one message and bump `updated_at`.
    pub fn add_message(&self, id: &str, msg: Message) -> Result<()> {
        let snapshot = {
            let mut inner = self.inner.write().unwrap();
            let session = inner
                .get_mut(id)
                .ok_or_else(|| SessionError::NotFound { id: id.to_string() })?;
            session.messages.push(msg);
            session.updated_at = chrono::Utc::now().to_rfc3339();
            session.clone()
        };
        self.persist(&snapshot)
    }

    /// Summarization hook: replace the history with `new_messages` and
    /// record the summary.
    pub fn set_summary(&self, id: &str, summary: String, new_messages: Vec<Message>) -> Result<()> {
        let snapshot = {
            let mut inner = self.inner.write().unwrap();
            let session = inner
                .get_mut(id)
                .ok_or_else(|| SessionError::NotFound { id: id.to_string() })?;
            session.summary = Some(summary);
            session.messages = new_messages;
            session.updated_at = chrono::Utc::now().to_rfc3339();
            session.clone()
        };
        self.persist(&snapshot)
    }

    pub fn set_active_model(&self, id: &str, model: Option<String>) -> Result<()> {
        let snapshot = {
            let mut inner = self.inner.write().unwrap();
            let session = inner
                .get_mut(id)
                .ok_or_else(|| SessionError::NotFound { id: id.to_string() })?;
            session.active_model = model;
            session.updated_at = chrono::Utc::now().to_rfc3339();
            session.clone()
        };
        self.persist(&snapshot)
    }

    fn persist(&self, session: &Session) -> Result<()> {
        let Some(ref dir) = self.persist_dir else {
            return Ok(());
        };
        let path = dir.join(format!("{}.yaml", file_stem(&session.id)));
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, serde_yaml::to_string(session)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn load_session(path: &Path) -> Result<Session> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&raw)?)
}

/// Session ids are key strings that may contain path separators; flatten
/// them so each session maps to exactly one file.
fn file_stem(id: &str) -> String {
    id.replace(['/', '\\'], "_")
}
