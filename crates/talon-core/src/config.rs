use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Default time allowed for a subprocess handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
/// Default per-tool-call execution timeout (seconds).
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;
/// Default cap applied to tool output before it reaches the LLM.
pub const DEFAULT_TOOL_OUTPUT_BYTES: usize = 64 * 1024;

/// Top-level config (`opentalon.toml` + `TALON_*` env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TalonConfig {
    /// Root for persisted state: sessions/, memories.yaml, scheduler/,
    /// auth-state.yaml, lock files.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub agent: AgentSettings,
    /// Keyed by provider id; map order (lexicographic) is the deterministic
    /// default-model fallback order.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
    #[serde(default)]
    pub router: RouterSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub plugins: Vec<PluginRef>,
    #[serde(default)]
    pub channels: Vec<ChannelRef>,
}

impl Default for TalonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            agent: AgentSettings::default(),
            providers: BTreeMap::new(),
            router: RouterSettings::default(),
            scheduler: SchedulerSettings::default(),
            plugins: Vec::new(),
            channels: Vec::new(),
        }
    }
}

impl TalonConfig {
    /// Load config: explicit path > `TALON_CONFIG` env > `~/.opentalon/opentalon.toml`.
    ///
    /// `${VAR}` references in the file are substituted from the process
    /// environment before parsing; unset variables become empty strings.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("TALON_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        let figment = match std::fs::read_to_string(&path) {
            Ok(raw) => Figment::new().merge(Toml::string(&expand_env(&raw))),
            Err(_) => Figment::new(),
        };

        let config: TalonConfig = figment
            .merge(Env::prefixed("TALON_").split("_"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

/// Agent-loop configuration: model selection, preparers, safety rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Primary model; when absent, the router resolves one from the catalog.
    pub model: Option<ModelRefConfig>,
    /// Ordered fallback cascade after the primary.
    #[serde(default)]
    pub fallbacks: Vec<ModelRefConfig>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Extra safety rules appended to the builtin corpus, marked `[custom]`.
    #[serde(default)]
    pub safety_rules: Vec<String>,
    /// Content preparers run before the agent loop, in order.
    #[serde(default)]
    pub preparers: Vec<PreparerConfig>,
}

/// A `provider/model` pair as written in config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRefConfig {
    pub provider: String,
    pub model: String,
}

/// One content preparer entry. `insecure` marks the preparer's output as
/// untrusted: its invoke steps are ignored and the LLM is always consulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparerConfig {
    pub plugin: String,
    pub action: String,
    #[serde(default = "default_arg_key")]
    pub arg_key: String,
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Openai,
    Anthropic,
}

/// One LLM provider endpoint plus its credential profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    /// Base URL without trailing slash; provider-specific default when absent.
    pub base_url: Option<String>,
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,
}

/// A single credential as written in config. Exactly one of `api_key` /
/// `oauth_token` should be set; `api_key` is runtime-only and never
/// persisted to auth-state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub id: String,
    pub api_key: Option<String>,
    pub oauth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    /// Weighted model catalog; highest weight wins absent pins or affinity.
    #[serde(default)]
    pub catalog: Vec<CatalogEntryConfig>,
    /// Per-task pins: task name → model. Pins beat affinity and the catalog.
    #[serde(default)]
    pub pins: BTreeMap<String, ModelRefConfig>,
    /// Affinity half-life is `decay_days / 2` days.
    #[serde(default = "default_decay_days")]
    pub decay_days: f64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            catalog: Vec::new(),
            pins: BTreeMap::new(),
            decay_days: default_decay_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntryConfig {
    pub provider: String,
    pub model: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

/// Scheduler governance plus the immutable config-sourced jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// When non-empty, job mutations require the caller to be listed here.
    #[serde(default)]
    pub approvers: Vec<String>,
    /// 0 disables the per-user dynamic job quota.
    #[serde(default)]
    pub max_jobs_per_user: usize,
    #[serde(default)]
    pub jobs: Vec<ConfigJob>,
}

/// A job declared in the config file — protected from removal and update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigJob {
    pub name: String,
    /// Duration string: `"30s"`, `"5m"`, `"1h"`.
    pub interval: String,
    /// `plugin.action`
    pub action: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub notify_channel: String,
}

/// A plugin to launch and dial at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRef {
    pub name: String,
    /// Local binary path. Git-ref sources resolve to a path through the lock
    /// file before reaching here.
    pub binary: String,
}

/// A channel adapter reference: a local binary path or a `grpc://` address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRef {
    pub id: String,
    pub source: String,
    /// Channel-specific content preparers, run by the message handler
    /// before the orchestrator sees the content.
    #[serde(default)]
    pub preparers: Vec<PreparerConfig>,
}

fn default_data_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.opentalon")
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.opentalon/opentalon.toml")
}

fn default_arg_key() -> String {
    "text".to_string()
}

fn default_decay_days() -> f64 {
    14.0
}

fn default_weight() -> f64 {
    1.0
}

/// Substitute `${VAR}` references from the process environment.
/// Unset variables expand to the empty string.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                out.push_str(&std::env::var(var).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated reference — keep it literally.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_env_substitutes_known_vars() {
        std::env::set_var("TALON_TEST_TOKEN", "tok-123");
        let out = expand_env("key = \"${TALON_TEST_TOKEN}\"");
        assert_eq!(out, "key = \"tok-123\"");
    }

    #[test]
    fn expand_env_unset_var_becomes_empty() {
        let out = expand_env("a${TALON_DOES_NOT_EXIST_XYZ}b");
        assert_eq!(out, "ab");
    }

    #[test]
    fn expand_env_keeps_unterminated_reference() {
        assert_eq!(expand_env("abc${oops"), "abc${oops");
    }

    #[test]
    fn config_parses_minimal_toml() {
        let raw = r#"
            data_dir = "/tmp/talon"

            [agent]
            model = { provider = "anthropic", model = "claude-sonnet-4-5" }

            [providers.anthropic]
            kind = "anthropic"
            profiles = [{ id = "a1", api_key = "sk-test" }]

            [[scheduler.jobs]]
            name = "digest"
            interval = "1h"
            action = "mail.digest"
        "#;
        let config: TalonConfig = Figment::new()
            .merge(Toml::string(raw))
            .extract()
            .expect("parse failed");
        assert_eq!(config.data_dir, "/tmp/talon");
        assert_eq!(config.agent.model.as_ref().unwrap().provider, "anthropic");
        assert_eq!(config.scheduler.jobs[0].interval, "1h");
        assert_eq!(
            config.providers["anthropic"].profiles[0].api_key.as_deref(),
            Some("sk-test")
        );
    }
}
