use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// One stored note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// Monotonic id: `mem_<n>`.
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// `None` means globally visible; `Some(actor)` scopes the note to one
    /// actor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    /// RFC3339 creation timestamp.
    pub created_at: String,
}

impl Memory {
    pub fn is_global(&self) -> bool {
        self.actor_id.is_none()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}
