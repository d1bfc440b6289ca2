use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use talon_agent::credentials::{CooldownPolicy, Profile, Rotator};
use talon_agent::failover::FailoverController;
use talon_agent::openai::OpenAiProvider;
use talon_agent::provider::LlmProvider;
use talon_agent::router::{CatalogEntry, ModelRouter, TaskKind};
use talon_agent::{anthropic::AnthropicProvider, ModelRef, Orchestrator};
use talon_broker::channel::ChannelClient;
use talon_broker::plugin::PluginClient;
use talon_broker::registry::ChannelRegistry;
use talon_broker::supervisor::{Supervisor, DEFAULT_STOP_GRACE};
use talon_core::config::{ProviderKind, TalonConfig, DEFAULT_HANDSHAKE_TIMEOUT_MS};
use talon_memory::MemoryStore;
use talon_protocol::handshake::parse_plugin_handshake;
use talon_scheduler::Scheduler;
use talon_sessions::SessionStore;
use talon_tools::guard::Guard;
use talon_tools::registry::ToolRegistry;

use crate::handler::{AgentMessageHandler, ChannelNotifier, OrchestratorRunner};

/// Everything the daemon owns, in shutdown order: channels first, then the
/// scheduler, then plugin processes.
pub struct App {
    pub channels: Arc<ChannelRegistry>,
    pub scheduler: Arc<Scheduler>,
    plugins: Vec<Arc<PluginClient>>,
    plugin_supervisors: Vec<Mutex<Supervisor>>,
}

impl App {
    pub async fn build(config: TalonConfig) -> anyhow::Result<Self> {
        let data_dir = Path::new(&config.data_dir);
        let handshake_timeout = Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS);

        let sessions = Arc::new(SessionStore::with_persistence(data_dir.join("sessions"))?);
        let memories = Arc::new(MemoryStore::with_persistence(data_dir.join("memories.yaml"))?);
        let registry = Arc::new(ToolRegistry::new());

        // ---- plugins: launch, handshake, dial, register --------------------
        // A bad plugin logs a warning and does not prevent boot.
        let mut plugins = Vec::new();
        let mut plugin_supervisors = Vec::new();
        for plugin_ref in &config.plugins {
            match launch_plugin(&plugin_ref.binary, handshake_timeout).await {
                Ok((supervisor, client)) => {
                    let client = Arc::new(client);
                    let executor: Arc<dyn talon_tools::Executor> = client.clone();
                    if let Err(e) = registry.register(client.capability().clone(), executor) {
                        warn!(plugin = %plugin_ref.name, error = %e, "plugin registration failed");
                        continue;
                    }
                    plugins.push(client);
                    plugin_supervisors.push(Mutex::new(supervisor));
                }
                Err(e) => warn!(plugin = %plugin_ref.name, error = %e, "plugin load failed"),
            }
        }

        // ---- providers, credentials, failover ------------------------------
        let rotator = Arc::new(Rotator::with_persistence(
            data_dir.join("auth-state.yaml"),
            CooldownPolicy::default(),
        ));
        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        for (id, settings) in &config.providers {
            let provider: Arc<dyn LlmProvider> = match settings.kind {
                ProviderKind::Anthropic => {
                    Arc::new(AnthropicProvider::new(settings.base_url.clone()))
                }
                ProviderKind::Openai => match settings.base_url.clone() {
                    Some(base) => Arc::new(OpenAiProvider::named(id.clone(), base)),
                    None => Arc::new(OpenAiProvider::new(None)),
                },
            };
            providers.insert(id.clone(), provider);

            for profile in &settings.profiles {
                match (&profile.oauth_token, &profile.api_key) {
                    (Some(token), _) => {
                        rotator.add_profile(Profile::oauth(&profile.id, id, token))
                    }
                    (None, Some(key)) => {
                        rotator.add_profile(Profile::api_key(&profile.id, id, key))
                    }
                    (None, None) => {
                        warn!(provider = %id, profile = %profile.id, "profile has no credential, skipping")
                    }
                }
            }
        }

        let fallbacks: Vec<ModelRef> = config
            .agent
            .fallbacks
            .iter()
            .map(|m| ModelRef::new(&m.provider, &m.model))
            .collect();
        let failover = Arc::new(FailoverController::new(
            providers,
            Arc::clone(&rotator),
            fallbacks,
        ));

        // ---- router ---------------------------------------------------------
        let catalog: Vec<CatalogEntry> = config
            .router
            .catalog
            .iter()
            .map(|e| CatalogEntry {
                model: ModelRef::new(&e.provider, &e.model),
                weight: e.weight,
            })
            .collect();
        let pins: HashMap<TaskKind, ModelRef> = config
            .router
            .pins
            .iter()
            .filter_map(|(task, model)| {
                match task.parse::<TaskKind>() {
                    Ok(kind) => Some((kind, ModelRef::new(&model.provider, &model.model))),
                    Err(e) => {
                        warn!(task = %task, error = %e, "ignoring router pin");
                        None
                    }
                }
            })
            .collect();
        let router = ModelRouter::new(catalog, pins, config.router.decay_days);

        // ---- orchestrator ---------------------------------------------------
        let mut orchestrator = Orchestrator::new(
            Arc::clone(&registry),
            Guard::default(),
            Arc::clone(&sessions),
            Arc::clone(&memories),
            failover,
        )
        .with_router(router)
        .with_preparers(config.agent.preparers.clone())
        .with_custom_rules(&config.agent.safety_rules)
        .with_limits(config.agent.max_tokens, config.agent.temperature);
        if let Some(ref primary) = config.agent.model {
            orchestrator = orchestrator.with_primary(ModelRef::new(&primary.provider, &primary.model));
        }
        let orchestrator = Arc::new(orchestrator);

        // ---- channels -------------------------------------------------------
        let channels = Arc::new(ChannelRegistry::new(Arc::clone(&sessions)));
        for channel_ref in &config.channels {
            match ChannelClient::connect(&channel_ref.source, handshake_timeout).await {
                Ok(client) => {
                    let handler = Arc::new(AgentMessageHandler::new(
                        Arc::clone(&orchestrator),
                        Arc::clone(&channels),
                        channel_ref.preparers.clone(),
                    ));
                    if let Err(e) = channels.register(Arc::new(client), handler).await {
                        warn!(channel = %channel_ref.id, error = %e, "channel registration failed");
                    }
                }
                Err(e) => warn!(channel = %channel_ref.id, error = %e, "channel load failed"),
            }
        }
        info!(channels = ?channels.ids(), "channels up");

        // ---- scheduler ------------------------------------------------------
        let scheduler = Arc::new(
            Scheduler::new(Arc::new(OrchestratorRunner::new(Arc::clone(&orchestrator))))
                .with_notifier(Arc::new(ChannelNotifier::new(Arc::clone(&channels))))
                .with_governance(
                    config.scheduler.approvers.clone(),
                    config.scheduler.max_jobs_per_user,
                )
                .with_persistence(data_dir.join("scheduler").join("jobs.yaml")),
        );
        scheduler.load_config_jobs(&config.scheduler.jobs);
        if let Err(e) = scheduler.load_dynamic_jobs() {
            warn!(error = %e, "dynamic job reload failed");
        }

        Ok(Self {
            channels,
            scheduler,
            plugins,
            plugin_supervisors,
        })
    }

    /// Graceful teardown: channels (readers + dispatch), scheduler tickers,
    /// then plugin connections and their subprocesses.
    pub async fn shutdown(&self) {
        self.channels.stop_all().await;
        self.scheduler.stop().await;
        for plugin in &self.plugins {
            plugin.close().await;
        }
        for supervisor in &self.plugin_supervisors {
            let _ = supervisor.lock().await.stop(DEFAULT_STOP_GRACE).await;
        }
        info!("shutdown complete");
    }
}

/// Launch a plugin binary, read its handshake line, and dial the declared
/// socket.
async fn launch_plugin(
    binary: &str,
    handshake_timeout: Duration,
) -> anyhow::Result<(Supervisor, PluginClient)> {
    let mut supervisor = Supervisor::new(binary);
    let line = supervisor.start(handshake_timeout).await?;
    let handshake = parse_plugin_handshake(&line)?;
    let client =
        PluginClient::dial(handshake.network, &handshake.address, handshake_timeout).await?;
    Ok((supervisor, client))
}
