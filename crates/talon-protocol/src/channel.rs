//! Host ↔ channel method vocabulary.
//!
//! Unlike the plugin stream, a started channel connection is not strict
//! request/response: after `start` the channel pushes unsolicited
//! `{msg: …}` frames interleaved with acks. The broker keeps a single
//! reader and demultiplexes.

use serde::{Deserialize, Serialize};

use talon_core::types::{ChannelCapabilities, InboundMessage, OutboundMessage};

pub const METHOD_CAPABILITIES: &str = "capabilities";
pub const METHOD_START: &str = "start";
pub const METHOD_SEND: &str = "send";

/// Host → channel request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRequest {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<OutboundMessage>,
}

impl ChannelRequest {
    pub fn capabilities() -> Self {
        Self { method: METHOD_CAPABILITIES.to_string(), msg: None }
    }

    pub fn start() -> Self {
        Self { method: METHOD_START.to_string(), msg: None }
    }

    pub fn send(msg: OutboundMessage) -> Self {
        Self { method: METHOD_SEND.to_string(), msg: Some(msg) }
    }
}

/// Channel → host frame: an ack (possibly carrying `caps` or `error`) or,
/// after `start`, an inbound message push (`msg` set).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caps: Option<ChannelCapabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<InboundMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChannelResponse {
    /// True when this frame is an inbound message push rather than an ack.
    pub fn is_push(&self) -> bool {
        self.msg.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_request_shape() {
        let json = serde_json::to_string(&ChannelRequest::start()).unwrap();
        assert_eq!(json, r#"{"method":"start"}"#);
    }

    #[test]
    fn send_request_carries_message() {
        let msg = OutboundMessage {
            channel_id: "slack".into(),
            conversation_id: "C042".into(),
            thread_id: String::new(),
            content: "hi".into(),
            files: Vec::new(),
            metadata: Default::default(),
        };
        let json = serde_json::to_string(&ChannelRequest::send(msg)).unwrap();
        assert!(json.contains(r#""method":"send""#));
        assert!(json.contains(r#""conversation_id":"C042""#));
        // sender fields never appear on outbound messages
        assert!(!json.contains("sender_id"));
        assert!(!json.contains("timestamp"));
    }

    #[test]
    fn push_frame_is_distinguished_from_ack() {
        let push: ChannelResponse = serde_json::from_str(
            r#"{"msg":{"channel_id":"slack","conversation_id":"C1","sender_id":"U1","content":"hello"}}"#,
        )
        .unwrap();
        assert!(push.is_push());

        let ack: ChannelResponse = serde_json::from_str(r#"{}"#).unwrap();
        assert!(!ack.is_push());

        let err_ack: ChannelResponse = serde_json::from_str(r#"{"error":"no such conversation"}"#).unwrap();
        assert!(!err_ack.is_push());
        assert_eq!(err_ack.error.as_deref(), Some("no such conversation"));
    }
}
