//! Per-conversation message history: ordered, append-only between summary
//! rewrites, optionally persisted one YAML file per session.

pub mod error;
pub mod store;
pub mod types;

pub use error::{Result, SessionError};
pub use store::SessionStore;
pub use types::Session;
