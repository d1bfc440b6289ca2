use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use talon_core::types::Message;

/// One conversation's state. Created lazily before first delivery, mutated
/// only by the orchestrator (append) or the summarizer (rewrite). Never
/// shared across conversations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque identifier — in practice a formatted session key.
    pub id: String,
    /// Ordered message history.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Present after the summarizer has compacted older history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Model the session is currently pinned to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_model: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// RFC3339 timestamps.
    pub created_at: String,
    pub updated_at: String,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: id.into(),
            messages: Vec::new(),
            summary: None,
            active_model: None,
            metadata: HashMap::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
}
