//! Control Plane
//!
//! Builds the coordination components from one `AppConfig`, wires them
//! together and runs them as a unit:
//! - components are registered by name and started leaves-first
//! - toggle gates pause the failsafe poll, task scheduling, sync checks and
//!   heartbeats
//! - failed commands, unsynchronized timestamps and heartbeat silence become
//!   failsafe events

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::balancer::LoadBalancer;
use crate::config::AppConfig;
use crate::coordination::toggles::{
    FAILSAFE_ENABLED, HEARTBEAT_ENABLED, LOAD_BALANCING_ENABLED, MONITORING_ENABLED, SYNC_ENABLED,
};
use crate::coordination::heartbeat::HEARTBEAT_COMPONENT;
use crate::coordination::{
    HeartbeatSystem, LifecycleManager, SyncManager, ToggleDispatcher, ToggleGate,
};
use crate::error::{Result, SwitchboardError};
use crate::persistence::BufferSystem;
use crate::platform::{CommandHandler, CommandRouter, CommandStatus, Component, ComponentRegistry};
use crate::supervisor::{FailsafeCondition, FailsafeLevel, FailsafeMonitor};

/// Router target that reaches the toggle dispatcher
pub const TOGGLES_TARGET: &str = "toggles";

pub struct ControlPlane {
    config: AppConfig,
    registry: ComponentRegistry,
    lifecycle: LifecycleManager,
    toggles: Arc<ToggleDispatcher>,
    sync: Arc<SyncManager>,
    router: Arc<CommandRouter>,
    buffer: Arc<BufferSystem>,
    balancer: Arc<LoadBalancer>,
    heartbeat: Arc<HeartbeatSystem>,
    failsafe: Arc<FailsafeMonitor>,
    bridges: Mutex<Vec<JoinHandle<()>>>,
}

impl ControlPlane {
    /// Validate `config`, build every component and wire them together
    pub async fn new(config: AppConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| SwitchboardError::Validation(errors.join("; ")))?;

        let registry = ComponentRegistry::new();

        let toggles = Arc::new(ToggleDispatcher::new());
        toggles.install_system_callbacks().await?;

        let sync = Arc::new(SyncManager::new(config.sync.clone()));
        sync.set_gate(ToggleGate::new(toggles.clone(), &[SYNC_ENABLED]))
            .await;

        let router = Arc::new(CommandRouter::new(config.router.clone(), registry.clone()));
        router
            .register_default_handler(TOGGLES_TARGET, toggles.clone() as Arc<dyn CommandHandler>)
            .await;

        let buffer = Arc::new(BufferSystem::new(config.buffer.clone()));
        buffer.set_command_router(router.clone()).await;

        let balancer = Arc::new(LoadBalancer::new(config.balancer.clone()));
        balancer
            .set_gate(ToggleGate::new(toggles.clone(), &[LOAD_BALANCING_ENABLED]))
            .await;

        let heartbeat = Arc::new(HeartbeatSystem::new(
            config.sync.clone(),
            sync.clone(),
            registry.clone(),
        ));
        heartbeat
            .set_gate(ToggleGate::new(toggles.clone(), &[HEARTBEAT_ENABLED]))
            .await;
        heartbeat.set_buffer(buffer.clone()).await;

        // Not registered itself: it polls the registry
        let failsafe = Arc::new(FailsafeMonitor::new(
            config.failsafe.clone(),
            registry.clone(),
        ));
        failsafe
            .set_gate(ToggleGate::new(
                toggles.clone(),
                &[FAILSAFE_ENABLED, MONITORING_ENABLED],
            ))
            .await;

        let lifecycle = LifecycleManager::new(config.lifecycle.clone());
        let components: [(Arc<dyn Component>, u8); 6] = [
            (toggles.clone() as Arc<dyn Component>, 0),
            (sync.clone() as Arc<dyn Component>, 1),
            (router.clone() as Arc<dyn Component>, 2),
            (buffer.clone() as Arc<dyn Component>, 3),
            (balancer.clone() as Arc<dyn Component>, 4),
            (heartbeat.clone() as Arc<dyn Component>, 5),
        ];
        for (component, priority) in components {
            lifecycle.register(&component.name(), priority).await;
            registry.register(component);
        }

        info!("Control plane assembled with {} components", registry.len());
        Ok(Self {
            config,
            registry,
            lifecycle,
            toggles,
            sync,
            router,
            buffer,
            balancer,
            heartbeat,
            failsafe,
            bridges: Mutex::new(Vec::new()),
        })
    }

    /// Start registered components in order, then the failsafe monitor and
    /// the event bridges
    pub async fn start(&self) -> Result<()> {
        let mut bridges = self.bridges.lock().await;
        if !bridges.is_empty() {
            warn!("Control plane already running");
            return Ok(());
        }

        bridges.push(self.spawn_command_bridge());
        bridges.push(self.spawn_sync_bridge());
        bridges.push(self.spawn_heartbeat_bridge());

        if let Err(e) = self.lifecycle.start_all(&self.registry).await {
            for bridge in bridges.drain(..) {
                bridge.abort();
            }
            self.lifecycle
                .stop_all(&self.registry, "startup failed")
                .await;
            return Err(e);
        }
        self.failsafe.start().await;

        info!("Control plane started");
        Ok(())
    }

    /// Stop in reverse order: failsafe first, then the registered components
    pub async fn stop(&self, reason: &str) {
        info!("Stopping control plane: {}", reason);
        self.failsafe.stop().await;
        self.lifecycle.stop_all(&self.registry, reason).await;

        let bridges: Vec<JoinHandle<()>> = self.bridges.lock().await.drain(..).collect();
        for bridge in bridges {
            bridge.abort();
            let _ = bridge.await;
        }
        info!("Control plane stopped");
    }

    /// The failsafe monitor asked the host to halt
    pub fn should_halt(&self) -> bool {
        self.failsafe.should_halt()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn toggles(&self) -> &Arc<ToggleDispatcher> {
        &self.toggles
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.router
    }

    pub fn buffer(&self) -> &Arc<BufferSystem> {
        &self.buffer
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatSystem> {
        &self.heartbeat
    }

    pub fn failsafe(&self) -> &Arc<FailsafeMonitor> {
        &self.failsafe
    }

    pub async fn get_status(&self) -> Value {
        let mut components = serde_json::Map::new();
        for name in self.registry.names() {
            if let Some(component) = self.registry.get(&name) {
                components.insert(name, component.status().await.unwrap_or(Value::Null));
            }
        }
        let states: std::collections::BTreeMap<String, String> = self
            .lifecycle
            .get_all_states()
            .await
            .into_iter()
            .map(|(name, state)| (name, state.to_string()))
            .collect();

        json!({
            "halt_requested": self.should_halt(),
            "lifecycle": states,
            "components": components,
            "failsafe": serde_json::to_value(self.failsafe.get_status().await).unwrap_or(Value::Null),
        })
    }

    /// Failed and timed-out commands feed the command_failure counters
    fn spawn_command_bridge(&self) -> JoinHandle<()> {
        let mut outcomes = self.router.subscribe();
        let failsafe = self.failsafe.clone();
        tokio::spawn(async move {
            loop {
                match outcomes.recv().await {
                    Ok(outcome) => {
                        if !matches!(outcome.status, CommandStatus::Failed | CommandStatus::Timeout) {
                            continue;
                        }
                        failsafe
                            .trigger_event(
                                FailsafeCondition::CommandFailure,
                                FailsafeLevel::Info,
                                &format!(
                                    "Command {} to {} ended {}",
                                    outcome.command_type, outcome.target, outcome.status
                                ),
                                &outcome.target,
                                json!({
                                    "command_id": outcome.command_id,
                                    "status": outcome.status,
                                    "error": outcome.error,
                                }),
                            )
                            .await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Command bridge lagged, {} outcomes skipped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Command bridge finished");
        })
    }

    /// Unsynchronized validations feed the sync_failure counters
    fn spawn_sync_bridge(&self) -> JoinHandle<()> {
        let mut alerts = self.sync.subscribe();
        let failsafe = self.failsafe.clone();
        tokio::spawn(async move {
            loop {
                match alerts.recv().await {
                    Ok(alert) => {
                        failsafe
                            .trigger_event(
                                FailsafeCondition::SyncFailure,
                                FailsafeLevel::Warning,
                                &alert.message,
                                "sync_manager",
                                json!({ "drift": alert.drift }),
                            )
                            .await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Sync bridge lagged, {} alerts skipped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Sync bridge finished");
        })
    }

    /// Heartbeat silence feeds the heartbeat_failure counters
    fn spawn_heartbeat_bridge(&self) -> JoinHandle<()> {
        let mut alerts = self.heartbeat.subscribe();
        let failsafe = self.failsafe.clone();
        tokio::spawn(async move {
            loop {
                match alerts.recv().await {
                    Ok(alert) => {
                        failsafe
                            .trigger_event(
                                FailsafeCondition::HeartbeatFailure,
                                FailsafeLevel::Warning,
                                &alert.message,
                                HEARTBEAT_COMPONENT,
                                json!({
                                    "silent_secs": alert.silent_secs,
                                    "last_success": alert.last_success,
                                }),
                            )
                            .await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Heartbeat bridge lagged, {} alerts skipped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Heartbeat bridge finished");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::ToggleState;
    use std::time::Duration;

    fn test_config(dir: &tempfile::TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.buffer.snapshot_path = dir
            .path()
            .join("buffer.json")
            .to_string_lossy()
            .into_owned();
        config
    }

    #[tokio::test]
    async fn test_assembly_registers_components() {
        let dir = tempfile::tempdir().unwrap();
        let plane = ControlPlane::new(test_config(&dir)).await.unwrap();
        assert_eq!(
            plane.registry().names(),
            vec![
                "buffer_system",
                "command_router",
                "heartbeat_system",
                "load_balancer",
                "sync_manager",
                "toggle_dispatcher",
            ]
        );
        assert_eq!(
            plane.lifecycle().get_startup_order().await,
            vec![
                "toggle_dispatcher",
                "sync_manager",
                "command_router",
                "buffer_system",
                "load_balancer",
                "heartbeat_system",
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.balancer.strategy = "fastest".to_string();
        assert!(matches!(
            ControlPlane::new(config).await,
            Err(SwitchboardError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_toggle_commands_route_through_router() {
        let dir = tempfile::tempdir().unwrap();
        let plane = ControlPlane::new(test_config(&dir)).await.unwrap();

        let command = plane
            .router()
            .handle_command(
                "toggle_off",
                TOGGLES_TARGET,
                json!({ "toggle_id": LOAD_BALANCING_ENABLED }),
                "test",
            )
            .await
            .unwrap();
        assert_eq!(command.status, CommandStatus::Completed);
        assert_eq!(
            plane.toggles().get_state(LOAD_BALANCING_ENABLED).await,
            Some(ToggleState::Off)
        );
    }

    #[tokio::test]
    async fn test_failed_command_becomes_failsafe_event() {
        let dir = tempfile::tempdir().unwrap();
        let plane = ControlPlane::new(test_config(&dir)).await.unwrap();
        plane.start().await.unwrap();

        let command = plane
            .router()
            .handle_command("launch", "nowhere", Value::Null, "test")
            .await
            .unwrap();
        assert_eq!(command.status, CommandStatus::Failed);

        let mut found = false;
        for _ in 0..100 {
            let events = plane.failsafe().get_event_history(10).await;
            if events
                .iter()
                .any(|e| e.condition == FailsafeCondition::CommandFailure && e.component == "nowhere")
            {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(found);

        plane.stop("test complete").await;
        assert!(!plane.router().is_running());
        assert!(dir.path().join("buffer.json").exists());
    }
}
