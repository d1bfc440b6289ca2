//! Host ↔ plugin method vocabulary.
//!
//! The stream is strict request/response: the host writes one frame and
//! reads exactly one frame back.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use talon_core::types::{PluginCapability, ToolCall, ToolResult};

pub const METHOD_CAPABILITIES: &str = "capabilities";
pub const METHOD_EXECUTE: &str = "execute";

/// Host → plugin request frame.
/// Wire: `{"method":"capabilities"}` or
/// `{"method":"execute","id":"call-1","plugin":"gitlab","action":"analyze_code","args":{…}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRequest {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<HashMap<String, String>>,
}

impl PluginRequest {
    pub fn capabilities() -> Self {
        Self {
            method: METHOD_CAPABILITIES.to_string(),
            id: None,
            plugin: None,
            action: None,
            args: None,
        }
    }

    pub fn execute(call: &ToolCall) -> Self {
        Self {
            method: METHOD_EXECUTE.to_string(),
            id: Some(call.id.clone()),
            plugin: Some(call.plugin.clone()),
            action: Some(call.action.clone()),
            args: Some(call.args.clone()),
        }
    }
}

/// Plugin → host response frame. `caps` answers `capabilities`; the
/// remaining fields answer `execute`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caps: Option<PluginCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PluginResponse {
    /// Interpret this frame as the result of `call_id`. The plugin's own
    /// call id is kept verbatim when present so the guard can detect a
    /// mismatch.
    pub fn into_tool_result(self, fallback_call_id: &str) -> ToolResult {
        ToolResult {
            call_id: self.call_id.unwrap_or_else(|| fallback_call_id.to_string()),
            content: self.content.unwrap_or_default(),
            error: self.error,
        }
    }
}
