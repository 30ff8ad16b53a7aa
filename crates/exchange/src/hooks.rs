//! Storage engine hooks invoked while applying decisions

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::request::{CacheConfig, NearCacheConfig};

/// Failure reported by a storage engine hook
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    /// Create a hook error from a message
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Storage engine callbacks for resource lifecycle.
///
/// Hooks are awaited inline on the apply path; a slow hook delays the rest
/// of the batch on this member.
#[async_trait]
pub trait ResourceHooks: Debug + Send + Sync + 'static {
    /// Create the storage for a started resource
    async fn on_create(&self, name: &str, config: &CacheConfig) -> Result<(), HookError>;

    /// Release the storage of a stopped resource
    async fn on_destroy(&self, name: &str) -> Result<(), HookError>;

    /// Create a client-side projection on its origin member
    async fn on_attach(&self, name: &str, near: &NearCacheConfig) -> Result<(), HookError> {
        let _ = (name, near);
        Ok(())
    }
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

#[async_trait]
impl ResourceHooks for NoopHooks {
    async fn on_create(&self, _name: &str, _config: &CacheConfig) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_destroy(&self, _name: &str) -> Result<(), HookError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryHooksState {
    live: HashMap<String, CacheConfig>,
    projections: HashSet<String>,
    creates: HashMap<String, usize>,
    destroys: HashMap<String, usize>,
    fail_create: HashSet<String>,
    fail_destroy: HashSet<String>,
    fail_attach: HashSet<String>,
}

/// In-memory hooks that track live resources and can inject failures
#[derive(Debug, Clone, Default)]
pub struct MemoryHooks {
    state: Arc<Mutex<MemoryHooksState>>,
}

impl MemoryHooks {
    /// Creates hooks with no resources.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `on_create` fail for `name`
    pub fn fail_create(&self, name: impl Into<String>) {
        self.state.lock().fail_create.insert(name.into());
    }

    /// Make `on_destroy` fail for `name`
    pub fn fail_destroy(&self, name: impl Into<String>) {
        self.state.lock().fail_destroy.insert(name.into());
    }

    /// Make `on_attach` fail for `name`
    pub fn fail_attach(&self, name: impl Into<String>) {
        self.state.lock().fail_attach.insert(name.into());
    }

    /// Clear all injected failures
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.fail_create.clear();
        state.fail_destroy.clear();
        state.fail_attach.clear();
    }

    /// Whether storage for `name` currently exists
    pub fn is_live(&self, name: &str) -> bool {
        self.state.lock().live.contains_key(name)
    }

    /// Names with live storage, sorted
    pub fn live(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().live.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a projection of `name` exists here
    pub fn has_projection(&self, name: &str) -> bool {
        self.state.lock().projections.contains(name)
    }

    /// How often `on_create` ran for `name`
    pub fn create_count(&self, name: &str) -> usize {
        self.state.lock().creates.get(name).copied().unwrap_or(0)
    }

    /// How often `on_destroy` ran for `name`
    pub fn destroy_count(&self, name: &str) -> usize {
        self.state.lock().destroys.get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ResourceHooks for MemoryHooks {
    async fn on_create(&self, name: &str, config: &CacheConfig) -> Result<(), HookError> {
        let mut state = self.state.lock();
        *state.creates.entry(name.to_string()).or_default() += 1;

        if state.fail_create.contains(name) {
            return Err(HookError::new(format!("injected create failure for {name}")));
        }

        state.live.insert(name.to_string(), config.clone());
        Ok(())
    }

    async fn on_destroy(&self, name: &str) -> Result<(), HookError> {
        let mut state = self.state.lock();
        *state.destroys.entry(name.to_string()).or_default() += 1;

        state.live.remove(name);
        state.projections.remove(name);

        if state.fail_destroy.contains(name) {
            return Err(HookError::new(format!(
                "injected destroy failure for {name}"
            )));
        }
        Ok(())
    }

    async fn on_attach(&self, name: &str, _near: &NearCacheConfig) -> Result<(), HookError> {
        let mut state = self.state.lock();

        if state.fail_attach.contains(name) {
            return Err(HookError::new(format!("injected attach failure for {name}")));
        }

        state.projections.insert(name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_hooks_track_lifecycle() {
        let hooks = MemoryHooks::new();

        hooks.on_create("a", &CacheConfig::new("a")).await.unwrap();
        assert!(hooks.is_live("a"));
        assert_eq!(hooks.create_count("a"), 1);

        hooks.on_destroy("a").await.unwrap();
        assert!(!hooks.is_live("a"));
        assert_eq!(hooks.destroy_count("a"), 1);
    }

    #[tokio::test]
    async fn test_injected_create_failure() {
        let hooks = MemoryHooks::new();
        hooks.fail_create("a");

        assert!(hooks.on_create("a", &CacheConfig::new("a")).await.is_err());
        assert!(!hooks.is_live("a"));

        hooks.heal();
        assert!(hooks.on_create("a", &CacheConfig::new("a")).await.is_ok());
        assert_eq!(hooks.create_count("a"), 2);
    }
}
