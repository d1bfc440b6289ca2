use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::credentials::Rotator;
use crate::error::{AgentError, Result};
use crate::provider::{ChatRequest, ChatResponse, LlmProvider};

/// Credential rotation attempts per model before moving down the cascade.
const MAX_ROTATION_ATTEMPTS: usize = 3;

/// A `provider/model` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl ModelRef {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self { provider: provider.into(), model: model.into() }
    }

    /// Parse `"provider/model"`; the model part may contain slashes.
    pub fn parse(s: &str) -> Option<Self> {
        let (provider, model) = s.split_once('/')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(provider, model))
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// A successful cascade run: the response plus which models were tried.
#[derive(Debug)]
pub struct FailoverOutcome {
    pub response: ChatResponse,
    pub served_by: ModelRef,
    pub attempted: Vec<ModelRef>,
}

/// Primary → fallbacks cascade with per-model credential rotation.
///
/// Per model: up to three rotation attempts; rate-limit (429) and auth
/// (401/403) failures cool the profile down and rotate, other errors are
/// terminal for that model. A retryable last error moves the cascade to the
/// next fallback; a terminal one is returned as-is.
pub struct FailoverController {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    rotator: Arc<Rotator>,
    fallbacks: Vec<ModelRef>,
}

impl FailoverController {
    pub fn new(
        providers: HashMap<String, Arc<dyn LlmProvider>>,
        rotator: Arc<Rotator>,
        fallbacks: Vec<ModelRef>,
    ) -> Self {
        Self { providers, rotator, fallbacks }
    }

    pub fn rotator(&self) -> &Arc<Rotator> {
        &self.rotator
    }

    /// Run `req` against `[primary] + fallbacks` (deduplicated).
    pub async fn execute(
        &self,
        primary: &ModelRef,
        session_id: &str,
        req: &ChatRequest,
    ) -> Result<FailoverOutcome> {
        let mut cascade = vec![primary.clone()];
        for fallback in &self.fallbacks {
            if !cascade.contains(fallback) {
                cascade.push(fallback.clone());
            }
        }

        let mut attempted: Vec<ModelRef> = Vec::new();

        for model in cascade {
            let Some(provider) = self.providers.get(&model.provider) else {
                warn!(model = %model, "no provider configured for model, skipping");
                continue;
            };
            if self.rotator.all_in_cooldown(&model.provider, Utc::now()) {
                info!(model = %model, "all profiles cooling down, skipping model");
                attempted.push(model);
                continue;
            }

            attempted.push(model.clone());
            match self
                .try_with_rotation(provider.as_ref(), &model, session_id, req)
                .await
            {
                Ok(response) => {
                    return Ok(FailoverOutcome {
                        response,
                        served_by: model,
                        attempted,
                    });
                }
                Err(err) => {
                    // Auth failures count as retryable once rotation is
                    // exhausted: another provider may hold good credentials.
                    let retryable = match &err {
                        AgentError::Provider(e) => e.is_retryable() || e.is_auth(),
                        AgentError::NoProfiles { .. } => true,
                        _ => false,
                    };
                    if !retryable {
                        return Err(err);
                    }
                    warn!(model = %model, error = %err, "model failed with retryable error, cascading");
                }
            }
        }

        // Nothing in the cascade produced a response; every failure along
        // the way was retryable (non-retryable errors return early above).
        Err(AgentError::AllExhausted { attempted })
    }

    async fn try_with_rotation(
        &self,
        provider: &dyn LlmProvider,
        model: &ModelRef,
        session_id: &str,
        req: &ChatRequest,
    ) -> Result<ChatResponse> {
        let mut req = req.clone();
        req.model = model.model.clone();

        let mut last_err: Option<AgentError> = None;
        for attempt in 0..MAX_ROTATION_ATTEMPTS {
            let profile = match self.rotator.select(&model.provider, session_id, Utc::now()) {
                Ok(p) => p,
                Err(e) => {
                    // mid-rotation exhaustion of this provider's profiles
                    return Err(last_err.unwrap_or(e));
                }
            };

            match provider.send(&req, &profile.secret).await {
                Ok(response) => {
                    if attempt > 0 {
                        info!(model = %model, attempt, "request succeeded after rotation");
                    }
                    self.rotator.reset(&model.provider, &profile.id);
                    return Ok(response);
                }
                Err(e) if e.is_rate_limit() || e.is_auth() => {
                    warn!(
                        model = %model,
                        profile = %profile.id,
                        status = ?e.status(),
                        "credential failure, rotating"
                    );
                    self.rotator.put_in_cooldown(&model.provider, &profile.id, Utc::now());
                    last_err = Some(AgentError::Provider(e));
                }
                Err(e) => return Err(AgentError::Provider(e)),
            }
        }
        Err(last_err.expect("rotation loop ran at least once"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::credentials::{CooldownPolicy, Profile};
    use crate::provider::ProviderError;
    use talon_core::types::Message;

    struct ScriptedProvider {
        name: String,
        fail_status: Option<u16>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn ok(name: &str) -> Self {
            Self { name: name.into(), fail_status: None, calls: AtomicUsize::new(0) }
        }

        fn failing(name: &str, status: u16) -> Self {
            Self { name: name.into(), fail_status: Some(status), calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send(&self, req: &ChatRequest, _key: &str) -> std::result::Result<ChatResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_status {
                Some(status) => Err(ProviderError::Api { status, message: "scripted".into() }),
                None => Ok(ChatResponse { content: "ok".into(), model: req.model.clone() }),
            }
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "unset".into(),
            messages: vec![Message::user("hello")],
            max_tokens: None,
            temperature: None,
        }
    }

    fn rotator_with(providers: &[&str]) -> Arc<Rotator> {
        let rotator = Rotator::new(CooldownPolicy::default());
        for p in providers {
            rotator.add_profile(Profile::api_key(format!("{p}-key"), *p, "sk-x"));
        }
        Arc::new(rotator)
    }

    #[tokio::test]
    async fn rate_limited_primary_cascades_to_fallback() {
        let primary = Arc::new(ScriptedProvider::failing("ratelimited", 429));
        let fallback = Arc::new(ScriptedProvider::ok("healthy"));
        let rotator = rotator_with(&["ratelimited", "healthy"]);

        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        providers.insert("ratelimited".into(), primary.clone());
        providers.insert("healthy".into(), fallback.clone());

        let controller = FailoverController::new(
            providers,
            Arc::clone(&rotator),
            vec![ModelRef::new("healthy", "backup-model")],
        );

        let outcome = controller
            .execute(&ModelRef::new("ratelimited", "main-model"), "s1", &request())
            .await
            .unwrap();

        assert_eq!(outcome.response.content, "ok");
        assert_eq!(outcome.served_by, ModelRef::new("healthy", "backup-model"));
        assert_eq!(
            outcome.attempted,
            vec![
                ModelRef::new("ratelimited", "main-model"),
                ModelRef::new("healthy", "backup-model"),
            ]
        );
        // the rate-limited provider's profile took the cooldown
        assert!(rotator.error_count("ratelimited", "ratelimited-key") >= 1);
    }

    #[tokio::test]
    async fn terminal_error_stops_the_cascade() {
        let primary = Arc::new(ScriptedProvider::failing("broken", 400));
        let fallback = Arc::new(ScriptedProvider::ok("healthy"));
        let rotator = rotator_with(&["broken", "healthy"]);

        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        providers.insert("broken".into(), primary.clone());
        providers.insert("healthy".into(), fallback.clone());

        let controller = FailoverController::new(
            providers,
            rotator,
            vec![ModelRef::new("healthy", "backup-model")],
        );

        let err = controller
            .execute(&ModelRef::new("broken", "main-model"), "s1", &request())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Provider(ProviderError::Api { status: 400, .. })));
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_cascade_reports_attempted_models() {
        let a = Arc::new(ScriptedProvider::failing("a", 429));
        let b = Arc::new(ScriptedProvider::failing("b", 503));
        let rotator = rotator_with(&["a", "b"]);

        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        providers.insert("a".into(), a);
        providers.insert("b".into(), b);

        let controller =
            FailoverController::new(providers, rotator, vec![ModelRef::new("b", "m-b")]);

        let err = controller
            .execute(&ModelRef::new("a", "m-a"), "s1", &request())
            .await
            .unwrap_err();
        match err {
            AgentError::AllExhausted { attempted } => {
                assert_eq!(attempted, vec![ModelRef::new("a", "m-a"), ModelRef::new("b", "m-b")]);
            }
            other => panic!("expected AllExhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn auth_failures_rotate_across_profiles() {
        let provider = Arc::new(ScriptedProvider::failing("p", 401));
        let rotator = Arc::new(Rotator::new(CooldownPolicy::default()));
        rotator.add_profile(Profile::api_key("k1", "p", "sk-1"));
        rotator.add_profile(Profile::api_key("k2", "p", "sk-2"));
        rotator.add_profile(Profile::api_key("k3", "p", "sk-3"));

        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        providers.insert("p".into(), provider.clone());
        let controller = FailoverController::new(providers, Arc::clone(&rotator), Vec::new());

        let err = controller
            .execute(&ModelRef::new("p", "m"), "s1", &request())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::AllExhausted { .. }));
        // three rotation attempts, one per profile
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(rotator.error_count("p", "k1"), 1);
        assert_eq!(rotator.error_count("p", "k2"), 1);
        assert_eq!(rotator.error_count("p", "k3"), 1);
    }

    #[tokio::test]
    async fn cooled_down_model_is_skipped() {
        let a = Arc::new(ScriptedProvider::ok("a"));
        let b = Arc::new(ScriptedProvider::ok("b"));
        let rotator = rotator_with(&["a", "b"]);
        rotator.put_in_cooldown("a", "a-key", Utc::now());

        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        providers.insert("a".into(), a.clone());
        providers.insert("b".into(), b);

        let controller =
            FailoverController::new(providers, rotator, vec![ModelRef::new("b", "m-b")]);
        let outcome = controller
            .execute(&ModelRef::new("a", "m-a"), "s1", &request())
            .await
            .unwrap();
        assert_eq!(outcome.served_by, ModelRef::new("b", "m-b"));
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn model_ref_parse() {
        let r = ModelRef::parse("anthropic/claude-sonnet-4-5").unwrap();
        assert_eq!(r.provider, "anthropic");
        assert_eq!(r.model, "claude-sonnet-4-5");
        // model part may contain slashes (openrouter-style ids)
        let r = ModelRef::parse("openrouter/meta/llama-3.3").unwrap();
        assert_eq!(r.model, "meta/llama-3.3");
        assert!(ModelRef::parse("nodivider").is_none());
    }
}
