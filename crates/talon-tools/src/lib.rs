//! Tool execution plumbing: the registry mapping plugin names to executors,
//! the guard wrapped around every invocation, and the tool-call parser.

pub mod guard;
pub mod parser;
pub mod registry;

use async_trait::async_trait;

use talon_core::types::{ToolCall, ToolResult};

/// The contract a plugin connection fulfils: execute one call, produce one
/// result. Implementations serialize their own transport access.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, call: &ToolCall) -> ToolResult;
}
