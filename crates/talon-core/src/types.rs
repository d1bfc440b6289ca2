use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Conversation role as carried on the LLM wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a session history.
///
/// There is no structured tool-call field: tool calls travel inside assistant
/// content as `[tool_call]{json}[/tool_call]`, tool results inside user
/// content as `[plugin_output]…[/plugin_output]`. The model cannot tell a
/// real tool result apart from an attempted prompt injection, so every tool
/// result is treated as untrusted data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// A structured request for one plugin action, extracted from LLM output
/// or built directly by the scheduler / invoke paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub plugin: String,
    pub action: String,
    #[serde(default)]
    pub args: HashMap<String, String>,
}

/// The outcome of executing a [`ToolCall`]. `call_id` must match the call's
/// id; the guard enforces this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(rename = "call_id")]
    pub call_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            error: None,
        }
    }

    pub fn failure(call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// One declared parameter of a plugin action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Wire-level type hint (e.g. "string"). Informational only.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub param_type: String,
    #[serde(default)]
    pub required: bool,
}

/// One action a plugin exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

/// A plugin's self-description, fetched once at dial time and immutable
/// after registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginCapability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

impl PluginCapability {
    /// Look up an action by name.
    pub fn action(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.iter().find(|a| a.name == name)
    }
}

/// What a channel adapter can do, reported during its capabilities exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelCapabilities {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub threads: bool,
    #[serde(default)]
    pub files: bool,
    #[serde(default)]
    pub reactions: bool,
    #[serde(default)]
    pub edits: bool,
    #[serde(default)]
    pub max_message_length: usize,
}

/// A file carried alongside a channel message. `data` is base64 when present;
/// large attachments may ship only metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub name: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default)]
    pub size: u64,
}

/// A message received from a channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel_id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub thread_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileAttachment>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub timestamp: String,
}

/// A message to deliver through a channel adapter. Omits sender identity and
/// timestamp — the adapter fills those in on its side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel_id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub thread_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileAttachment>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Conversation-scoped session key.
///
/// Format: `chan:{channel}:conv:{conversation}` for unthreaded
/// conversations, with a `:thread:{thread}` suffix when a thread id is
/// present. Two distinct `(channel, conversation, thread)` triples always
/// format to distinct keys; an empty thread yields the 2-part form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub channel_id: String,
    pub conversation_id: String,
    /// Empty when the conversation is not threaded.
    #[serde(default)]
    pub thread_id: String,
}

impl SessionKey {
    pub fn new(
        channel_id: impl Into<String>,
        conversation_id: impl Into<String>,
        thread_id: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            conversation_id: conversation_id.into(),
            thread_id: thread_id.into(),
        }
    }

    pub fn for_message(msg: &InboundMessage) -> Self {
        Self::new(&msg.channel_id, &msg.conversation_id, &msg.thread_id)
    }

    /// Canonical string form, usable as a map key and a session file name stem.
    pub fn format(&self) -> String {
        if self.thread_id.is_empty() {
            format!("chan:{}:conv:{}", self.channel_id, self.conversation_id)
        } else {
            format!(
                "chan:{}:conv:{}:thread:{}",
                self.channel_id, self.conversation_id, self.thread_id
            )
        }
    }

    /// Parse a canonical key string back into its parts.
    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("chan:")
            .ok_or_else(|| CoreError::InvalidKey(format!("missing 'chan:' prefix: {s}")))?;

        let conv_marker = ":conv:";
        let conv_pos = rest
            .find(conv_marker)
            .ok_or_else(|| CoreError::InvalidKey(format!("missing ':conv:' segment: {s}")))?;

        let channel_id = &rest[..conv_pos];
        let after_conv = &rest[conv_pos + conv_marker.len()..];

        // The thread suffix is optional; the conversation id may not itself
        // contain the marker.
        let (conversation_id, thread_id) = match after_conv.rfind(":thread:") {
            Some(pos) => (&after_conv[..pos], &after_conv[pos + ":thread:".len()..]),
            None => (after_conv, ""),
        };

        if channel_id.is_empty() || conversation_id.is_empty() {
            return Err(CoreError::InvalidKey(format!(
                "key components must not be empty: {s}"
            )));
        }

        Ok(Self {
            channel_id: channel_id.to_string(),
            conversation_id: conversation_id.to_string(),
            thread_id: thread_id.to_string(),
        })
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

/// Redact a credential for logging: at most 6 leading characters, then `***`.
pub fn masked_key(key: &str) -> String {
    let shown: String = key.chars().take(6).collect();
    format!("{shown}***")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_two_part_when_no_thread() {
        let key = SessionKey::new("slack", "C042", "");
        assert_eq!(key.format(), "chan:slack:conv:C042");
        assert_eq!(SessionKey::parse(&key.format()).unwrap(), key);
    }

    #[test]
    fn session_key_three_part_roundtrip() {
        let key = SessionKey::new("slack", "C042", "171234.5678");
        let s = key.format();
        assert_eq!(s, "chan:slack:conv:C042:thread:171234.5678");
        assert_eq!(SessionKey::parse(&s).unwrap(), key);
    }

    #[test]
    fn distinct_triples_yield_distinct_keys() {
        let a = SessionKey::new("slack", "C042", "t1");
        let b = SessionKey::new("slack", "C042", "t2");
        let c = SessionKey::new("slack", "C042", "");
        assert_ne!(a.format(), b.format());
        assert_ne!(a.format(), c.format());
        assert_ne!(b.format(), c.format());
    }

    #[test]
    fn parse_rejects_missing_segments() {
        assert!(SessionKey::parse("slack:C042").is_err());
        assert!(SessionKey::parse("chan:slack").is_err());
        assert!(SessionKey::parse("chan::conv:C042").is_err());
    }

    #[test]
    fn masked_key_shows_at_most_six_chars() {
        assert_eq!(masked_key("sk-abcdef123456"), "sk-abc***");
        assert_eq!(masked_key("ab"), "ab***");
        assert_eq!(masked_key(""), "***");
    }

    #[test]
    fn tool_result_wire_shape() {
        let r = ToolResult::failure("call-1", "unknown action");
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains(r#""call_id":"call-1""#));
        assert!(json.contains(r#""error":"unknown action""#));

        let ok = ToolResult::success("call-2", "done");
        let json = serde_json::to_string(&ok).unwrap();
        assert!(!json.contains("error"));
    }
}
