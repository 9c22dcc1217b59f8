//! Component capability trait and the registry that owns component handles

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Health report returned by a component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthInfo {
    pub healthy: bool,
    #[serde(default)]
    pub details: Value,
}

impl HealthInfo {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            details: Value::Null,
        }
    }

    pub fn unhealthy(reason: &str) -> Self {
        Self {
            healthy: false,
            details: serde_json::json!({ "reason": reason }),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// A runtime component managed by the control plane.
///
/// Every capability is optional: the defaults report nothing and succeed,
/// so callers fall back to their own behaviour when a method returns `None`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Component: Send + Sync {
    /// Registry name
    fn name(&self) -> String;

    /// Status snapshot for `system.status` queries
    async fn status(&self) -> Option<Value> {
        None
    }

    /// Health report used by the failsafe probe
    async fn health_info(&self) -> Option<HealthInfo> {
        None
    }

    /// Liveness flag, consulted when no health report is available
    fn is_running(&self) -> Option<bool> {
        None
    }

    async fn start(&self) -> Result<(), String> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Name to component mapping shared by the router, the failsafe monitor and
/// the control plane. Cloning yields another handle to the same map.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    components: Arc<DashMap<String, Arc<dyn Component>>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component under its own name, replacing any previous entry
    pub fn register(&self, component: Arc<dyn Component>) {
        let name = component.name();
        if self.components.insert(name.clone(), component).is_some() {
            debug!("Replaced component: {}", name);
        } else {
            info!("Registered component: {}", name);
        }
    }

    /// Register a component under an explicit name
    pub fn register_as(&self, name: &str, component: Arc<dyn Component>) {
        self.components.insert(name.to_string(), component);
        info!("Registered component: {}", name);
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Component>> {
        let removed = self.components.remove(name).map(|(_, c)| c);
        if removed.is_some() {
            info!("Unregistered component: {}", name);
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Component>> {
        self.components.get(name).map(|c| Arc::clone(c.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    /// Registered names, sorted for stable iteration
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.components.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("components", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Component for Named {
        fn name(&self) -> String {
            self.0.to_string()
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = ComponentRegistry::new();
        registry.register(Arc::new(Named("bot")));
        registry.register(Arc::new(Named("engine")));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["bot", "engine"]);

        let bot = registry.get("bot").unwrap();
        assert_eq!(bot.name(), "bot");
        assert!(bot.status().await.is_none());
        assert!(bot.health_info().await.is_none());
        assert!(bot.start().await.is_ok());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let registry = ComponentRegistry::new();
        let handle = registry.clone();
        handle.register(Arc::new(Named("ingester")));

        assert!(registry.contains("ingester"));
        assert!(registry.unregister("ingester").is_some());
        assert!(handle.is_empty());
        assert!(registry.unregister("ingester").is_none());
    }
}
