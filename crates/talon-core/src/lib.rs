//! Shared types, configuration, and errors for the OpenTalon broker core.

pub mod config;
pub mod error;
pub mod types;

pub use error::{CoreError, Result};
