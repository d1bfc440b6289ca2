use async_trait::async_trait;

use talon_core::types::Message;

/// Request to an LLM provider. Messages carry the system prompt as a
/// regular system-role message; each provider maps it to its own wire
/// shape.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Non-streaming response. Streaming is deliberately unsupported.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
}

/// Common interface for LLM endpoints. The credential is passed per call —
/// the rotator decides which profile backs each request.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    async fn send(&self, req: &ChatRequest, api_key: &str) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Api { status, .. } => Some(*status),
            ProviderError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// 429 — triggers credential cooldown and rotation.
    pub fn is_rate_limit(&self) -> bool {
        self.status() == Some(429)
    }

    /// 401/403 — the credential itself is bad; cool it down and rotate.
    pub fn is_auth(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }

    /// Worth trying the next fallback model: rate limits, server errors,
    /// and plain transport failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http(e) => !e.is_builder(),
            ProviderError::Api { status, .. } => matches!(status, 429 | 500 | 503),
            _ => false,
        }
    }
}
