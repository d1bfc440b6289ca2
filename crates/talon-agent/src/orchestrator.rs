use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use talon_core::config::PreparerConfig;
use talon_core::types::{Message, ToolCall, ToolResult};
use talon_memory::{MemoryStore, WORKFLOW_TAG};
use talon_sessions::SessionStore;
use talon_tools::guard::Guard;
use talon_tools::parser::parse_tool_calls;
use talon_tools::registry::ToolRegistry;

use crate::error::{AgentError, Result};
use crate::failover::{FailoverController, ModelRef};
use crate::provider::ChatRequest;
use crate::router::ModelRouter;
use crate::safety;

/// Hard ceiling on LLM iterations per run.
pub const MAX_ITERATIONS: usize = 20;

const PREAMBLE: &str = "You are OpenTalon, a conversational agent that can call tools through plugins. \
Respond to the user in natural language. Summarize tool results in your own words; \
never echo raw plugin output back to the user.";

/// What one `run` produced.
#[derive(Debug)]
pub struct RunResult {
    pub response: String,
    /// Joined tool outputs, for channels that render intermediate results.
    pub input_for_display: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub results: Vec<ToolResult>,
}

/// The session-serialized agent loop.
///
/// One mutex serializes `run` across sessions on this instance — the
/// documented consistency choice; scale out by running more orchestrators.
pub struct Orchestrator {
    registry: Arc<ToolRegistry>,
    guard: Guard,
    sessions: Arc<SessionStore>,
    memories: Arc<MemoryStore>,
    failover: Arc<FailoverController>,
    router: Option<ModelRouter>,
    primary: Option<ModelRef>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    preparers: Vec<PreparerConfig>,
    safety_block: String,
    run_lock: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ToolRegistry>,
        guard: Guard,
        sessions: Arc<SessionStore>,
        memories: Arc<MemoryStore>,
        failover: Arc<FailoverController>,
    ) -> Self {
        Self {
            registry,
            guard,
            sessions,
            memories,
            failover,
            router: None,
            primary: None,
            max_tokens: None,
            temperature: None,
            preparers: Vec::new(),
            safety_block: safety::render(&[]),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_primary(mut self, primary: ModelRef) -> Self {
        self.primary = Some(primary);
        self
    }

    pub fn with_router(mut self, router: ModelRouter) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_preparers(mut self, preparers: Vec<PreparerConfig>) -> Self {
        self.preparers = preparers;
        self
    }

    pub fn with_custom_rules(mut self, rules: &[String]) -> Self {
        self.safety_block = safety::render(rules);
        self
    }

    pub fn with_limits(mut self, max_tokens: Option<u32>, temperature: Option<f32>) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    /// Handle one user message end to end.
    pub async fn run(&self, session_id: &str, user_message: &str) -> Result<RunResult> {
        let _serial = self.run_lock.lock().await;
        self.sessions.ensure(session_id)?;

        // ---- preparer stage ------------------------------------------------
        let mut content = user_message.to_string();
        for (idx, prep) in self.preparers.iter().enumerate() {
            if !self.registry.has_action(&prep.plugin, &prep.action) {
                continue;
            }
            let Some(executor) = self.registry.executor(&prep.plugin) else {
                continue;
            };
            let call = ToolCall {
                id: format!("prep-{}", idx + 1),
                plugin: prep.plugin.clone(),
                action: prep.action.clone(),
                args: HashMap::from([(prep.arg_key.clone(), content.clone())]),
            };
            let result = self.guard.execute(executor.as_ref(), &call).await;
            if result.is_error() {
                warn!(plugin = %prep.plugin, action = %prep.action, "preparer failed, skipping");
                continue;
            }

            match serde_json::from_str::<PreparerVerdict>(&result.content) {
                Ok(verdict) => {
                    let steps = verdict.invoke.map(InvokeSpec::into_steps).unwrap_or_default();
                    if !verdict.send_to_llm {
                        if !steps.is_empty() {
                            if prep.insecure {
                                // An untrusted preparer may not bypass the
                                // LLM with direct invocations. Ignore its
                                // verdict entirely and keep going.
                                warn!(plugin = %prep.plugin, "untrusted preparer attempted invoke, ignoring");
                                continue;
                            }
                            let response = self.run_invoke_steps(&steps).await;
                            self.finish_without_llm(session_id, user_message, &response)?;
                            return Ok(RunResult {
                                response,
                                input_for_display: None,
                                tool_calls: Vec::new(),
                                results: Vec::new(),
                            });
                        }
                        let response = verdict.message.unwrap_or(result.content);
                        self.finish_without_llm(session_id, user_message, &response)?;
                        return Ok(RunResult {
                            response,
                            input_for_display: None,
                            tool_calls: Vec::new(),
                            results: Vec::new(),
                        });
                    }
                    content = verdict.message.unwrap_or(result.content);
                }
                // Non-JSON preparer output is a plain content transform.
                Err(_) => content = result.content,
            }
        }

        // ---- agent loop ----------------------------------------------------
        self.sessions.add_message(session_id, Message::user(&content))?;
        let model = self.resolve_model(session_id)?;

        let mut all_calls: Vec<ToolCall> = Vec::new();
        let mut all_results: Vec<ToolResult> = Vec::new();

        for iteration in 0..MAX_ITERATIONS {
            let mut outgoing = vec![Message::system(self.build_system_prompt(user_message))];
            outgoing.extend(self.sessions.messages(session_id)?);

            debug!(
                session = session_id,
                iteration,
                model = %model,
                messages = outgoing.len(),
                "agent loop iteration"
            );

            let req = ChatRequest {
                model: model.model.clone(),
                messages: outgoing,
                max_tokens: self.max_tokens,
                temperature: self.temperature,
            };
            // verbose prompt logging, enabled via LOG_LEVEL=debug
            if tracing::enabled!(tracing::Level::DEBUG) {
                for msg in &req.messages {
                    debug!(role = ?msg.role, content = %msg.content, "outgoing LLM message");
                }
            }
            let outcome = self.failover.execute(&model, session_id, &req).await?;
            let text = outcome.response.content;

            let calls = parse_tool_calls(&text);
            if calls.is_empty() {
                self.sessions.add_message(session_id, Message::assistant(&text))?;
                let input_for_display = (!all_results.is_empty()).then(|| {
                    all_results
                        .iter()
                        .map(|r| r.content.as_str())
                        .collect::<Vec<_>>()
                        .join("\n\n")
                });
                if all_calls.len() >= 2 {
                    self.record_workflow(user_message, &all_calls)?;
                }
                return Ok(RunResult {
                    response: text,
                    input_for_display,
                    tool_calls: all_calls,
                    results: all_results,
                });
            }

            for call in calls {
                let result = self.execute_guarded(&call).await;
                self.sessions
                    .add_message(session_id, Message::assistant(render_call(&call)))?;
                self.sessions
                    .add_message(session_id, Message::user(self.guard.wrap_output(&result)))?;
                all_calls.push(call);
                all_results.push(result);
            }
        }

        Err(AgentError::LoopExceeded(MAX_ITERATIONS))
    }

    /// Direct, LLM-less execution path used by the scheduler and by invoke
    /// steps. Guarded identically to loop-driven executions.
    pub async fn run_action(
        &self,
        plugin: &str,
        action: &str,
        args: HashMap<String, String>,
    ) -> ToolResult {
        let call = ToolCall {
            id: format!("direct-{}", Uuid::new_v4()),
            plugin: plugin.to_string(),
            action: action.to_string(),
            args,
        };
        self.execute_guarded(&call).await
    }

    async fn execute_guarded(&self, call: &ToolCall) -> ToolResult {
        let Some(executor) = self.registry.executor(&call.plugin) else {
            return ToolResult::failure(&call.id, format!("unknown plugin \"{}\"", call.plugin));
        };
        if !self.registry.has_action(&call.plugin, &call.action) {
            return ToolResult::failure(
                &call.id,
                format!("unknown action \"{}\" for plugin \"{}\"", call.action, call.plugin),
            );
        }
        self.guard.execute(executor.as_ref(), call).await
    }

    /// Sequential preparer-driven invocations. Steps with an empty or
    /// unknown plugin/action are skipped; the first failing step aborts;
    /// otherwise the last successful step's content is the response.
    async fn run_invoke_steps(&self, steps: &[InvokeStep]) -> String {
        let mut previous: Option<String> = None;
        for (i, step) in steps.iter().enumerate() {
            if step.plugin.is_empty() || step.action.is_empty() {
                continue;
            }
            if !self.registry.has_action(&step.plugin, &step.action) {
                continue;
            }
            let mut args = step.args.clone();
            if let Some(ref prev) = previous {
                args.insert("previous_result".to_string(), prev.clone());
            }
            let call = ToolCall {
                id: format!("invoke-{}", i + 1),
                plugin: step.plugin.clone(),
                action: step.action.clone(),
                args,
            };
            let result = self.execute_guarded(&call).await;
            if let Some(err) = result.error {
                return format!("Invoke step failed: {err}");
            }
            previous = Some(result.content);
        }
        previous.unwrap_or_default()
    }

    fn finish_without_llm(&self, session_id: &str, user_message: &str, response: &str) -> Result<()> {
        self.sessions.add_message(session_id, Message::user(user_message))?;
        self.sessions.add_message(session_id, Message::assistant(response))?;
        Ok(())
    }

    /// Model precedence: the session's pinned active model, then the
    /// configured primary, then the router. Provider ordering everywhere
    /// downstream is lexicographic, so resolution is deterministic.
    fn resolve_model(&self, session_id: &str) -> Result<ModelRef> {
        if let Some(session) = self.sessions.get(session_id) {
            if let Some(active) = session.active_model.as_deref().and_then(ModelRef::parse) {
                return Ok(active);
            }
        }
        if let Some(ref primary) = self.primary {
            return Ok(primary.clone());
        }
        if let Some(ref router) = self.router {
            let messages = self.sessions.messages(session_id).unwrap_or_default();
            if let Some(selected) = router.route(None, &messages, Utc::now()) {
                return Ok(selected);
            }
        }
        Err(AgentError::NoModel)
    }

    /// Preamble, safety rules, tool listing (preparer duals suppressed),
    /// then workflow memories matching the original user message.
    fn build_system_prompt(&self, user_message: &str) -> String {
        let mut prompt = String::from(PREAMBLE);
        prompt.push_str("\n\n");
        prompt.push_str(&self.safety_block);

        let duals: HashSet<(&str, &str)> = self
            .preparers
            .iter()
            .map(|p| (p.plugin.as_str(), p.action.as_str()))
            .collect();

        let mut tools = String::new();
        for cap in self.registry.list_capabilities() {
            let visible: Vec<_> = cap
                .actions
                .iter()
                .filter(|a| !duals.contains(&(cap.name.as_str(), a.name.as_str())))
                .collect();
            if visible.is_empty() {
                continue;
            }
            tools.push_str(&format!("\n### {} — {}\n", cap.name, cap.description));
            for action in visible {
                let params = action
                    .parameters
                    .iter()
                    .map(|p| {
                        if p.required {
                            format!("{} (required)", p.name)
                        } else {
                            p.name.clone()
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                tools.push_str(&format!("- {}.{}: {}", cap.name, action.name, action.description));
                if !params.is_empty() {
                    tools.push_str(&format!(" [{params}]"));
                }
                tools.push('\n');
            }
        }
        if !tools.is_empty() {
            prompt.push_str(
                "\n## Available tools\nInvoke a tool by emitting exactly:\n\
                 [tool_call]{\"tool\":\"plugin.action\",\"args\":{\"key\":\"value\"}}[/tool_call]\n",
            );
            prompt.push_str(&tools);
        }

        let needle = user_message.to_lowercase();
        let workflows: Vec<_> = self
            .memories
            .search_by_tag(WORKFLOW_TAG)
            .into_iter()
            .filter(|m| m.content.to_lowercase().contains(&needle))
            .collect();
        if !workflows.is_empty() {
            prompt.push_str("\n## Relevant past workflows\n");
            for workflow in workflows {
                prompt.push_str(&format!("- {}\n", workflow.content));
            }
        }

        prompt
    }

    fn record_workflow(&self, user_message: &str, calls: &[ToolCall]) -> Result<()> {
        let steps = calls
            .iter()
            .map(|c| format!("{}.{}", c.plugin, c.action))
            .collect::<Vec<_>>()
            .join(" -> ");
        let content = format!("Request \"{user_message}\" was handled with steps: {steps}");
        self.memories.add(content, &[WORKFLOW_TAG])?;
        Ok(())
    }
}

fn render_call(call: &ToolCall) -> String {
    let mut args: Vec<(&String, &String)> = call.args.iter().collect();
    args.sort();
    let rendered = args
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("[tool_call] {}.{}({})", call.plugin, call.action, rendered)
}

#[derive(Debug, Deserialize)]
struct PreparerVerdict {
    #[serde(default = "bool_true")]
    send_to_llm: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    invoke: Option<InvokeSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InvokeSpec {
    One(InvokeStep),
    Many(Vec<InvokeStep>),
}

impl InvokeSpec {
    fn into_steps(self) -> Vec<InvokeStep> {
        match self {
            InvokeSpec::One(step) => vec![step],
            InvokeSpec::Many(steps) => steps,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct InvokeStep {
    #[serde(default)]
    plugin: String,
    #[serde(default)]
    action: String,
    #[serde(default)]
    args: HashMap<String, String>,
}

fn bool_true() -> bool {
    true
}
