//! Channel/plugin reference mode detection.
//!
//! References use URI-scheme prefixes. Only `binary` (a bare path) and
//! `grpc` are wired to real dial paths; the remaining schemes are
//! enumerated so config validation can name them, and adding a transport
//! means a new match arm plus a new dial path — not a premature abstract
//! dialer.

/// How a configured reference should be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMode {
    /// Local binary path, launched under the supervisor.
    Binary(String),
    /// Remote dial over TCP: `grpc://host:port`.
    Grpc(String),
    /// Reserved for a future container mode.
    Docker(String),
    /// Reserved for a future HTTP mode.
    Http(String),
    /// Reserved for a future WebSocket mode.
    Ws(String),
}

impl ChannelMode {
    pub fn scheme(&self) -> &'static str {
        match self {
            ChannelMode::Binary(_) => "binary",
            ChannelMode::Grpc(_) => "grpc",
            ChannelMode::Docker(_) => "docker",
            ChannelMode::Http(_) => "http",
            ChannelMode::Ws(_) => "ws",
        }
    }

    /// True when a real dial path exists for this mode.
    pub fn is_implemented(&self) -> bool {
        matches!(self, ChannelMode::Binary(_) | ChannelMode::Grpc(_))
    }
}

/// Classify a configured reference string.
pub fn parse_channel_ref(source: &str) -> ChannelMode {
    if let Some(addr) = source.strip_prefix("grpc://") {
        ChannelMode::Grpc(addr.to_string())
    } else if source.starts_with("docker://") {
        ChannelMode::Docker(source.to_string())
    } else if source.starts_with("http://") || source.starts_with("https://") {
        ChannelMode::Http(source.to_string())
    } else if source.starts_with("ws://") || source.starts_with("wss://") {
        ChannelMode::Ws(source.to_string())
    } else {
        ChannelMode::Binary(source.to_string())
    }
}
