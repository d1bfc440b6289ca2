use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::info;

use talon_core::types::PluginCapability;

use crate::Executor;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("plugin already registered: {name}")]
    Duplicate { name: String },
}

struct Registered {
    capability: PluginCapability,
    executor: Arc<dyn Executor>,
}

/// Name → (capability, executor) map shared across the orchestrator, the
/// scheduler, and channel dispatch. Reads take the reader lock; mutation is
/// serialized by the writer lock. Locks are never held across executor
/// calls.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<HashMap<String, Registered>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin under its capability name. Fails on duplicate.
    pub fn register(
        &self,
        capability: PluginCapability,
        executor: Arc<dyn Executor>,
    ) -> Result<(), RegistryError> {
        let name = capability.name.clone();
        let mut inner = self.inner.write().unwrap();
        if inner.contains_key(&name) {
            return Err(RegistryError::Duplicate { name });
        }
        info!(plugin = %name, actions = capability.actions.len(), "plugin registered");
        inner.insert(name, Registered { capability, executor });
        Ok(())
    }

    /// Remove a plugin. Returns false when it was not registered.
    pub fn deregister(&self, name: &str) -> bool {
        let removed = self.inner.write().unwrap().remove(name).is_some();
        if removed {
            info!(plugin = %name, "plugin deregistered");
        }
        removed
    }

    pub fn executor(&self, name: &str) -> Option<Arc<dyn Executor>> {
        self.inner
            .read()
            .unwrap()
            .get(name)
            .map(|r| Arc::clone(&r.executor))
    }

    pub fn capability(&self, name: &str) -> Option<PluginCapability> {
        self.inner
            .read()
            .unwrap()
            .get(name)
            .map(|r| r.capability.clone())
    }

    /// All registered capabilities, sorted by plugin name for deterministic
    /// prompt rendering.
    pub fn list_capabilities(&self) -> Vec<PluginCapability> {
        let mut caps: Vec<PluginCapability> = self
            .inner
            .read()
            .unwrap()
            .values()
            .map(|r| r.capability.clone())
            .collect();
        caps.sort_by(|a, b| a.name.cmp(&b.name));
        caps
    }

    pub fn has_action(&self, plugin: &str, action: &str) -> bool {
        self.inner
            .read()
            .unwrap()
            .get(plugin)
            .is_some_and(|r| r.capability.action(action).is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }
}
