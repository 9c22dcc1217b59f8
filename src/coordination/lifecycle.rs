//! Component Lifecycle Management
//!
//! Starts registered components in priority order and stops them in reverse,
//! each under its own timeout, tracking per-component state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SwitchboardError};
use crate::platform::ComponentRegistry;

/// Component lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ComponentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ComponentState::Stopped | ComponentState::Failed)
    }
}

impl std::fmt::Display for ComponentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentState::Stopped => write!(f, "stopped"),
            ComponentState::Starting => write!(f, "starting"),
            ComponentState::Running => write!(f, "running"),
            ComponentState::Stopping => write!(f, "stopping"),
            ComponentState::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle events broadcast to listeners
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    StateChanged {
        component: String,
        from: ComponentState,
        to: ComponentState,
    },
    StartupCompleted { duration_ms: u64 },
    ShutdownCompleted { duration_ms: u64 },
}

#[derive(Debug, Clone)]
struct ComponentEntry {
    state: ComponentState,
    priority: u8, // Lower = starts first, stops last
    changed_at: DateTime<Utc>,
    last_error: Option<String>,
}

/// Configuration for lifecycle manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Timeout for one component startup (ms)
    pub startup_timeout_ms: u64,
    /// Timeout for one component shutdown (ms)
    pub shutdown_timeout_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 30_000,
            shutdown_timeout_ms: 30_000,
        }
    }
}

/// Ordered startup and shutdown of registry components
pub struct LifecycleManager {
    entries: Arc<RwLock<HashMap<String, ComponentEntry>>>,
    config: LifecycleConfig,
    event_tx: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleManager {
    pub fn new(config: LifecycleConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            config,
            event_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(LifecycleConfig::default())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.event_tx.subscribe()
    }

    /// Track a component with a startup priority (lower = starts first)
    pub async fn register(&self, name: &str, priority: u8) {
        self.entries.write().await.insert(
            name.to_string(),
            ComponentEntry {
                state: ComponentState::Stopped,
                priority,
                changed_at: Utc::now(),
                last_error: None,
            },
        );
        debug!("Registered component: {} with priority {}", name, priority);
    }

    pub async fn get_state(&self, name: &str) -> Option<ComponentState> {
        self.entries.read().await.get(name).map(|c| c.state)
    }

    pub async fn get_all_states(&self) -> HashMap<String, ComponentState> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.state))
            .collect()
    }

    pub async fn last_error(&self, name: &str) -> Option<String> {
        self.entries
            .read()
            .await
            .get(name)
            .and_then(|c| c.last_error.clone())
    }

    async fn set_state(&self, name: &str, state: ComponentState, error: Option<&str>) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(name) {
            let from = entry.state;
            entry.state = state;
            entry.changed_at = Utc::now();
            if let Some(e) = error {
                entry.last_error = Some(e.to_string());
            }

            let _ = self.event_tx.send(LifecycleEvent::StateChanged {
                component: name.to_string(),
                from,
                to: state,
            });
            info!("Component {} state: {} -> {}", name, from, state);
        }
    }

    /// Ordered startup list (ties broken by name)
    pub async fn get_startup_order(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut ordered: Vec<(&String, &ComponentEntry)> = entries.iter().collect();
        ordered.sort_by(|a, b| a.1.priority.cmp(&b.1.priority).then(a.0.cmp(b.0)));
        ordered.into_iter().map(|(name, _)| name.clone()).collect()
    }

    pub async fn get_shutdown_order(&self) -> Vec<String> {
        let mut order = self.get_startup_order().await;
        order.reverse();
        order
    }

    /// Start every tracked component in order; stops at the first failure
    pub async fn start_all(&self, registry: &ComponentRegistry) -> Result<()> {
        let started = std::time::Instant::now();
        let order = self.get_startup_order().await;
        info!("Starting {} components in order: {:?}", order.len(), order);

        for name in order {
            let Some(component) = registry.get(&name) else {
                warn!("Component {} tracked but not registered, skipping", name);
                continue;
            };
            self.set_state(&name, ComponentState::Starting, None).await;

            let timeout = Duration::from_millis(self.config.startup_timeout_ms);
            let reason = match tokio::time::timeout(timeout, component.start()).await {
                Ok(Ok(())) => {
                    self.set_state(&name, ComponentState::Running, None).await;
                    continue;
                }
                Ok(Err(e)) => format!("Startup failed: {}", e),
                Err(_) => format!("Startup timeout after {}ms", self.config.startup_timeout_ms),
            };

            error!("Component {} failed to start: {}", name, reason);
            self.set_state(&name, ComponentState::Failed, Some(&reason))
                .await;
            return Err(SwitchboardError::InvalidState(format!("{}: {}", name, reason)));
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let _ = self
            .event_tx
            .send(LifecycleEvent::StartupCompleted { duration_ms });
        info!("All components started in {}ms", duration_ms);
        Ok(())
    }

    /// Stop every non-terminal component in reverse order
    pub async fn stop_all(&self, registry: &ComponentRegistry, reason: &str) {
        let started = std::time::Instant::now();
        let order = self.get_shutdown_order().await;
        info!(
            "Stopping {} components in order: {:?} (reason: {})",
            order.len(),
            order,
            reason
        );

        for name in order {
            let state = self.get_state(&name).await.unwrap_or(ComponentState::Stopped);
            if state == ComponentState::Stopped {
                continue;
            }
            let Some(component) = registry.get(&name) else {
                continue;
            };
            self.set_state(&name, ComponentState::Stopping, None).await;

            let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);
            match tokio::time::timeout(timeout, component.stop()).await {
                Ok(Ok(())) => self.set_state(&name, ComponentState::Stopped, None).await,
                Ok(Err(e)) => {
                    warn!("Component {} stop failed: {}", name, e);
                    self.set_state(&name, ComponentState::Stopped, Some(&e)).await;
                }
                Err(_) => {
                    warn!(
                        "Component {} shutdown timeout after {}ms",
                        name, self.config.shutdown_timeout_ms
                    );
                    self.set_state(&name, ComponentState::Stopped, Some("shutdown timeout"))
                        .await;
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let _ = self
            .event_tx
            .send(LifecycleEvent::ShutdownCompleted { duration_ms });
        info!("All components stopped in {}ms", duration_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MockComponent;

    fn mock(name: &'static str, start_ok: bool) -> Arc<MockComponent> {
        let mut component = MockComponent::new();
        component.expect_name().return_const(name.to_string());
        component.expect_start().returning(move || {
            if start_ok {
                Ok(())
            } else {
                Err("refused".to_string())
            }
        });
        component.expect_stop().returning(|| Ok(()));
        Arc::new(component)
    }

    #[test]
    fn test_component_state_display() {
        assert_eq!(ComponentState::Running.to_string(), "running");
        assert!(ComponentState::Failed.is_terminal());
    }

    #[tokio::test]
    async fn test_startup_order() {
        let manager = LifecycleManager::with_defaults();
        manager.register("failsafe", 6).await;
        manager.register("toggles", 1).await;
        manager.register("router", 3).await;

        assert_eq!(
            manager.get_startup_order().await,
            vec!["toggles", "router", "failsafe"]
        );
        assert_eq!(
            manager.get_shutdown_order().await,
            vec!["failsafe", "router", "toggles"]
        );
    }

    #[tokio::test]
    async fn test_start_and_stop_all() {
        let registry = ComponentRegistry::new();
        registry.register(mock("a", true));
        registry.register(mock("b", true));

        let manager = LifecycleManager::with_defaults();
        manager.register("a", 1).await;
        manager.register("b", 2).await;

        manager.start_all(&registry).await.unwrap();
        assert_eq!(manager.get_state("b").await, Some(ComponentState::Running));

        manager.stop_all(&registry, "test").await;
        assert_eq!(manager.get_state("a").await, Some(ComponentState::Stopped));
    }

    #[tokio::test]
    async fn test_start_failure_marks_failed() {
        let registry = ComponentRegistry::new();
        registry.register(mock("good", true));
        registry.register(mock("bad", false));

        let manager = LifecycleManager::with_defaults();
        manager.register("good", 1).await;
        manager.register("bad", 2).await;

        assert!(manager.start_all(&registry).await.is_err());
        assert_eq!(manager.get_state("bad").await, Some(ComponentState::Failed));
        assert!(manager.last_error("bad").await.unwrap().contains("refused"));
    }
}
