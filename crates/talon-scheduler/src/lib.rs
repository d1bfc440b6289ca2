//! Periodic job engine: config-immutable and dynamic jobs, approver
//! governance, per-user quotas, and YAML persistence of the dynamic set.

pub mod engine;
pub mod error;
pub mod types;

use std::collections::HashMap;

use async_trait::async_trait;

use talon_core::types::ToolResult;

pub use engine::Scheduler;
pub use error::{Result, SchedulerError};
pub use types::{parse_interval, Job, JobSource};

/// Executes one `plugin.action` — the orchestrator's direct path fulfils
/// this for the scheduler.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    async fn run_action(
        &self,
        plugin: &str,
        action: &str,
        args: HashMap<String, String>,
    ) -> ToolResult;
}

/// Delivers scheduler results to a channel conversation.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, channel: &str, text: &str);
}
