use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("not authorized")]
    NotAuthorized,

    #[error("config-defined jobs cannot be modified")]
    ConfigProtected,

    #[error("job not found: {name}")]
    NotFound { name: String },

    #[error("job already exists: {name}")]
    Duplicate { name: String },

    #[error("user {user} already owns {count} dynamic jobs (max {max})")]
    QuotaExceeded { user: String, count: usize, max: usize },

    #[error("invalid interval {0:?}")]
    InvalidInterval(String),

    #[error("invalid action {0:?} (want plugin.action)")]
    InvalidAction(String),

    #[error("scheduler I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("scheduler state file error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
