use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use talon_core::types::masked_key;

use crate::error::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    ApiKey,
    Oauth,
}

/// Rolling usage state for one profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_count: u32,
}

/// One credential for a provider.
///
/// `key` exists only at runtime — `#[serde(skip)]` keeps it out of
/// auth-state; OAuth tokens are the one secret that persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub provider_id: String,
    pub kind: ProfileKind,
    #[serde(skip)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_token: Option<String>,
    #[serde(default)]
    pub usage: ProfileUsage,
}

impl Profile {
    pub fn api_key(id: impl Into<String>, provider_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider_id: provider_id.into(),
            kind: ProfileKind::ApiKey,
            key: key.into(),
            oauth_token: None,
            usage: ProfileUsage::default(),
        }
    }

    pub fn oauth(id: impl Into<String>, provider_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider_id: provider_id.into(),
            kind: ProfileKind::Oauth,
            key: String::new(),
            oauth_token: Some(token.into()),
            usage: ProfileUsage::default(),
        }
    }

    /// Available iff neither the cooldown nor the disabled window is open.
    pub fn available(&self, now: DateTime<Utc>) -> bool {
        let cooled = self.usage.cooldown_until.map_or(true, |t| now >= t);
        let enabled = self.usage.disabled_until.map_or(true, |t| now >= t);
        cooled && enabled
    }

    /// The secret that goes on the wire.
    pub fn secret(&self) -> &str {
        match self.kind {
            ProfileKind::Oauth => self.oauth_token.as_deref().unwrap_or(&self.key),
            ProfileKind::ApiKey => &self.key,
        }
    }
}

/// Exponential cooldown policy: geometric growth from `initial` by
/// `multiplier`, saturated at `max`.
#[derive(Debug, Clone)]
pub struct CooldownPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(60),
            max: Duration::from_secs(3600),
            multiplier: 5,
        }
    }
}

impl CooldownPolicy {
    /// Duration for the nth consecutive error (1-based).
    pub fn duration_for(&self, error_count: u32) -> Duration {
        let mut d = self.initial;
        for _ in 1..error_count {
            d = d.saturating_mul(self.multiplier);
            if d >= self.max {
                return self.max;
            }
        }
        d.min(self.max)
    }
}

/// A profile picked for one request.
#[derive(Debug, Clone)]
pub struct SelectedProfile {
    pub id: String,
    pub kind: ProfileKind,
    pub secret: String,
}

/// Per-provider credential selection with session pinning and cooldown
/// tracking.
///
/// Selection order: the session's pinned profile while it stays available;
/// otherwise the available profiles sorted OAuth-first, then oldest
/// `last_used`. Selection pins the session to the returned profile.
pub struct Rotator {
    profiles: RwLock<HashMap<String, Vec<Profile>>>,
    /// (session, provider) → profile id.
    pins: RwLock<HashMap<(String, String), String>>,
    policy: CooldownPolicy,
    persist_path: Option<PathBuf>,
}

impl Rotator {
    pub fn new(policy: CooldownPolicy) -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
            pins: RwLock::new(HashMap::new()),
            policy,
            persist_path: None,
        }
    }

    /// Rotator persisted at `path` (`auth-state.yaml`). Usage stats and
    /// OAuth tokens recorded there are overlaid onto profiles as they are
    /// added; api keys never touch the file.
    pub fn with_persistence(path: impl Into<PathBuf>, policy: CooldownPolicy) -> Self {
        let mut rotator = Self::new(policy);
        rotator.persist_path = Some(path.into());
        rotator
    }

    pub fn add_profile(&self, mut profile: Profile) {
        if let Some(saved) = self.load_saved(&profile.provider_id, &profile.id) {
            profile.usage = saved.usage;
            if profile.oauth_token.is_none() {
                profile.oauth_token = saved.oauth_token;
            }
        }
        debug!(
            provider = %profile.provider_id,
            profile = %profile.id,
            key = %masked_key(profile.secret()),
            "profile added"
        );
        self.profiles
            .write()
            .unwrap()
            .entry(profile.provider_id.clone())
            .or_default()
            .push(profile);
    }

    /// Pick a profile for `(provider, session)` at `now`.
    pub fn select(&self, provider: &str, session: &str, now: DateTime<Utc>) -> Result<SelectedProfile> {
        let pin_key = (session.to_string(), provider.to_string());
        let pinned_id = self.pins.read().unwrap().get(&pin_key).cloned();

        let mut profiles = self.profiles.write().unwrap();
        let list = profiles
            .get_mut(provider)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| AgentError::NoProfiles { provider: provider.to_string() })?;

        // Pinned and still available wins; a stale pin is dropped.
        if let Some(ref id) = pinned_id {
            match list.iter_mut().find(|p| &p.id == id) {
                Some(p) if p.available(now) => {
                    p.usage.last_used = Some(now);
                    let selected = SelectedProfile {
                        id: p.id.clone(),
                        kind: p.kind,
                        secret: p.secret().to_string(),
                    };
                    drop(profiles);
                    self.save();
                    return Ok(selected);
                }
                _ => {
                    self.pins.write().unwrap().remove(&pin_key);
                }
            }
        }

        // OAuth first, then oldest last_used (never-used sorts first).
        let mut candidates: Vec<usize> = (0..list.len())
            .filter(|&i| list[i].available(now))
            .collect();
        candidates.sort_by_key(|&i| {
            let p = &list[i];
            (
                p.kind != ProfileKind::Oauth,
                p.usage.last_used.unwrap_or(DateTime::<Utc>::MIN_UTC),
            )
        });

        let Some(&head) = candidates.first() else {
            return Err(AgentError::NoProfiles { provider: provider.to_string() });
        };
        list[head].usage.last_used = Some(now);
        let selected = SelectedProfile {
            id: list[head].id.clone(),
            kind: list[head].kind,
            secret: list[head].secret().to_string(),
        };
        drop(profiles);

        self.pins.write().unwrap().insert(pin_key, selected.id.clone());
        self.save();
        Ok(selected)
    }

    /// True when the provider has profiles but none is currently available.
    /// A provider with no profiles at all also reports true.
    pub fn all_in_cooldown(&self, provider: &str, now: DateTime<Utc>) -> bool {
        let profiles = self.profiles.read().unwrap();
        match profiles.get(provider) {
            Some(list) => list.iter().all(|p| !p.available(now)),
            None => true,
        }
    }

    /// Record a failure: bump `error_count` and open the cooldown window.
    pub fn put_in_cooldown(&self, provider: &str, profile_id: &str, now: DateTime<Utc>) {
        {
            let mut profiles = self.profiles.write().unwrap();
            if let Some(p) = profiles
                .get_mut(provider)
                .and_then(|l| l.iter_mut().find(|p| p.id == profile_id))
            {
                p.usage.error_count += 1;
                let d = self.policy.duration_for(p.usage.error_count);
                p.usage.cooldown_until =
                    Some(now + chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero()));
                warn!(
                    provider,
                    profile = profile_id,
                    errors = p.usage.error_count,
                    cooldown_secs = d.as_secs(),
                    "profile put in cooldown"
                );
            }
        }
        self.save();
    }

    /// Record a success: clear the error count and both windows.
    pub fn reset(&self, provider: &str, profile_id: &str) {
        {
            let mut profiles = self.profiles.write().unwrap();
            if let Some(p) = profiles
                .get_mut(provider)
                .and_then(|l| l.iter_mut().find(|p| p.id == profile_id))
            {
                p.usage.error_count = 0;
                p.usage.cooldown_until = None;
                p.usage.disabled_until = None;
            }
        }
        self.save();
    }

    pub fn error_count(&self, provider: &str, profile_id: &str) -> u32 {
        self.profiles
            .read()
            .unwrap()
            .get(provider)
            .and_then(|l| l.iter().find(|p| p.id == profile_id))
            .map_or(0, |p| p.usage.error_count)
    }

    fn load_saved(&self, provider: &str, profile_id: &str) -> Option<Profile> {
        let path = self.persist_path.as_ref()?;
        let raw = std::fs::read_to_string(path).ok()?;
        let state: BTreeMap<String, Vec<Profile>> = serde_yaml::from_str(&raw).ok()?;
        state
            .get(provider)?
            .iter()
            .find(|p| p.id == profile_id)
            .cloned()
    }

    /// Write auth-state: per provider, profiles without runtime keys
    /// (`key` is `#[serde(skip)]`), OAuth tokens and usage only.
    fn save(&self) {
        let Some(ref path) = self.persist_path else {
            return;
        };
        let profiles = self.profiles.read().unwrap();
        let state: BTreeMap<String, Vec<Profile>> = profiles
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        drop(profiles);

        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let raw = serde_yaml::to_string(&state)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            let tmp = path.with_extension("yaml.tmp");
            std::fs::write(&tmp, raw)?;
            std::fs::rename(&tmp, path)?;
            Ok(())
        };
        if let Err(e) = write() {
            warn!(path = %path.display(), error = %e, "auth-state write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn cooldown_grows_geometrically_and_saturates() {
        let policy = CooldownPolicy::default();
        assert_eq!(policy.duration_for(1), Duration::from_secs(60));
        assert_eq!(policy.duration_for(2), Duration::from_secs(300));
        assert_eq!(policy.duration_for(3), Duration::from_secs(1500));
        assert_eq!(policy.duration_for(4), Duration::from_secs(3600));
        assert_eq!(policy.duration_for(10), Duration::from_secs(3600));
    }

    #[test]
    fn oauth_precedes_api_key() {
        let rotator = Rotator::new(CooldownPolicy::default());
        rotator.add_profile(Profile::api_key("k1", "anthropic", "sk-1"));
        rotator.add_profile(Profile::oauth("o1", "anthropic", "tok-1"));

        let selected = rotator.select("anthropic", "s1", now()).unwrap();
        assert_eq!(selected.id, "o1");
        assert_eq!(selected.kind, ProfileKind::Oauth);
        assert_eq!(selected.secret, "tok-1");
    }

    #[test]
    fn oldest_last_used_wins_among_same_kind() {
        let rotator = Rotator::new(CooldownPolicy::default());
        let mut old = Profile::api_key("old", "openai", "sk-old");
        old.usage.last_used = Some(now() - chrono::Duration::hours(2));
        let mut fresh = Profile::api_key("fresh", "openai", "sk-fresh");
        fresh.usage.last_used = Some(now() - chrono::Duration::minutes(1));
        rotator.add_profile(fresh);
        rotator.add_profile(old);

        // session pinning would interfere; use distinct sessions
        let selected = rotator.select("openai", "s-a", now()).unwrap();
        assert_eq!(selected.id, "old");
    }

    #[test]
    fn pinned_profile_is_reused_until_unavailable() {
        let rotator = Rotator::new(CooldownPolicy::default());
        rotator.add_profile(Profile::api_key("k1", "openai", "sk-1"));
        rotator.add_profile(Profile::api_key("k2", "openai", "sk-2"));

        let first = rotator.select("openai", "s1", now()).unwrap();
        // second select would otherwise pick the other key (older last_used)
        let second = rotator.select("openai", "s1", now()).unwrap();
        assert_eq!(first.id, second.id);

        // pin drops once the profile cools down
        rotator.put_in_cooldown("openai", &first.id, now());
        let third = rotator.select("openai", "s1", now()).unwrap();
        assert_ne!(third.id, first.id);
    }

    #[test]
    fn selection_respects_availability() {
        let rotator = Rotator::new(CooldownPolicy::default());
        rotator.add_profile(Profile::api_key("k1", "openai", "sk-1"));
        rotator.put_in_cooldown("openai", "k1", now());

        assert!(rotator.all_in_cooldown("openai", now()));
        let err = rotator.select("openai", "s1", now()).unwrap_err();
        assert!(matches!(err, AgentError::NoProfiles { .. }));

        // window expiry restores availability
        assert!(!rotator.all_in_cooldown("openai", now() + chrono::Duration::hours(2)));
    }

    #[test]
    fn reset_clears_error_count_and_windows() {
        let rotator = Rotator::new(CooldownPolicy::default());
        rotator.add_profile(Profile::api_key("k1", "openai", "sk-1"));
        rotator.put_in_cooldown("openai", "k1", now());
        rotator.put_in_cooldown("openai", "k1", now());
        assert_eq!(rotator.error_count("openai", "k1"), 2);

        rotator.reset("openai", "k1");
        assert_eq!(rotator.error_count("openai", "k1"), 0);
        assert!(!rotator.all_in_cooldown("openai", now()));
    }

    #[test]
    fn auth_state_persists_usage_but_never_api_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth-state.yaml");

        {
            let rotator = Rotator::with_persistence(&path, CooldownPolicy::default());
            rotator.add_profile(Profile::api_key("k1", "openai", "sk-secret"));
            rotator.add_profile(Profile::oauth("o1", "anthropic", "oauth-tok"));
            rotator.put_in_cooldown("openai", "k1", now());
        }

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("sk-secret"), "api key leaked to auth-state");
        assert!(raw.contains("oauth-tok"), "oauth token should persist");
        assert!(raw.contains("error_count: 1"));

        // usage overlays onto freshly configured profiles
        let rotator = Rotator::with_persistence(&path, CooldownPolicy::default());
        rotator.add_profile(Profile::api_key("k1", "openai", "sk-secret"));
        assert_eq!(rotator.error_count("openai", "k1"), 1);
    }
}
