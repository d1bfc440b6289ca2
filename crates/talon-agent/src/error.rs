use thiserror::Error;

use crate::failover::ModelRef;
use crate::provider::ProviderError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("LLM provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("no available credential profile for provider {provider}")]
    NoProfiles { provider: String },

    #[error("all models exhausted (attempted: {attempted:?})")]
    AllExhausted { attempted: Vec<ModelRef> },

    #[error("agent loop exceeded {0} iterations")]
    LoopExceeded(usize),

    #[error("no model configured and none resolvable from the catalog")]
    NoModel,

    #[error(transparent)]
    Session(#[from] talon_sessions::SessionError),

    #[error(transparent)]
    Memory(#[from] talon_memory::MemoryError),
}

pub type Result<T> = std::result::Result<T, AgentError>;
