use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use talon_agent::Orchestrator;
use talon_broker::registry::{BoxError, ChannelRegistry, MessageHandler};
use talon_core::config::PreparerConfig;
use talon_core::types::{InboundMessage, OutboundMessage, SessionKey, ToolResult};
use talon_scheduler::{ActionRunner, Notifier};

/// Bridges channel dispatch to the orchestrator.
///
/// Channel-specific content preparers come in through the constructor (one
/// handler per channel), not through any process-wide registry. They
/// transform the inbound content via the direct action path; the
/// orchestrator's own preparer chain then runs as configured.
pub struct AgentMessageHandler {
    orchestrator: Arc<Orchestrator>,
    channels: Arc<ChannelRegistry>,
    preparers: Vec<PreparerConfig>,
}

impl AgentMessageHandler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        channels: Arc<ChannelRegistry>,
        preparers: Vec<PreparerConfig>,
    ) -> Self {
        Self { orchestrator, channels, preparers }
    }

    async fn prepare_content(&self, content: String) -> String {
        let mut current = content;
        for prep in &self.preparers {
            let args = HashMap::from([(prep.arg_key.clone(), current.clone())]);
            let result = self
                .orchestrator
                .run_action(&prep.plugin, &prep.action, args)
                .await;
            if result.error.is_some() {
                debug!(plugin = %prep.plugin, action = %prep.action, "channel preparer failed, keeping content");
                continue;
            }
            current = result.content;
        }
        current
    }
}

#[async_trait]
impl MessageHandler for AgentMessageHandler {
    async fn handle(
        &self,
        key: SessionKey,
        msg: InboundMessage,
    ) -> std::result::Result<(), BoxError> {
        let content = self.prepare_content(msg.content.clone()).await;
        let result = self.orchestrator.run(&key.format(), &content).await?;

        let Some(channel) = self.channels.get(&msg.channel_id) else {
            warn!(channel = %msg.channel_id, "no running channel for reply");
            return Ok(());
        };
        channel
            .send(OutboundMessage {
                channel_id: msg.channel_id,
                conversation_id: msg.conversation_id,
                thread_id: msg.thread_id,
                content: result.response,
                files: Vec::new(),
                metadata: Default::default(),
            })
            .await?;
        Ok(())
    }
}

/// The scheduler's runner: the orchestrator's guarded, LLM-less path.
pub struct OrchestratorRunner {
    orchestrator: Arc<Orchestrator>,
}

impl OrchestratorRunner {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl ActionRunner for OrchestratorRunner {
    async fn run_action(
        &self,
        plugin: &str,
        action: &str,
        args: HashMap<String, String>,
    ) -> ToolResult {
        self.orchestrator.run_action(plugin, action, args).await
    }
}

/// Delivers scheduler notifications through a running channel.
///
/// `notify_channel` is `<channel_id>:<conversation_id>`; a bare channel id
/// sends with an empty conversation and lets the adapter route it.
pub struct ChannelNotifier {
    channels: Arc<ChannelRegistry>,
}

impl ChannelNotifier {
    pub fn new(channels: Arc<ChannelRegistry>) -> Self {
        Self { channels }
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, channel: &str, text: &str) {
        let (channel_id, conversation_id) = match channel.split_once(':') {
            Some((chan, conv)) => (chan, conv),
            None => (channel, ""),
        };
        let Some(client) = self.channels.get(channel_id) else {
            warn!(channel = %channel_id, "notification dropped: channel not running");
            return;
        };
        let outcome = client
            .send(OutboundMessage {
                channel_id: channel_id.to_string(),
                conversation_id: conversation_id.to_string(),
                thread_id: String::new(),
                content: text.to_string(),
                files: Vec::new(),
                metadata: Default::default(),
            })
            .await;
        if let Err(e) = outcome {
            warn!(channel = %channel_id, error = %e, "notification send failed");
        }
    }
}
