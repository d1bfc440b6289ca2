use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("memory file error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
