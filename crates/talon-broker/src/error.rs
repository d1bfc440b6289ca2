use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Protocol(#[from] talon_protocol::ProtocolError),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no handshake within {timeout_ms}ms")]
    HandshakeTimeout { timeout_ms: u64 },

    #[error("process exited before handshake ({status})")]
    EarlyExit { status: String },

    #[error("plugin returned empty capabilities")]
    EmptyCapabilities,

    #[error("dial {address} failed: {reason}")]
    Dial { address: String, reason: String },

    #[error("concurrent Send not allowed")]
    ConcurrentSend,

    #[error("send rejected by channel: {0}")]
    SendRejected(String),

    #[error("channel connection closed")]
    ConnectionClosed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("mode not yet implemented: {scheme}")]
    ModeNotImplemented { scheme: String },

    #[error("channel inbox already taken")]
    InboxTaken,

    #[error("channel already started")]
    AlreadyStarted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock file error: {0}")]
    LockFile(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
