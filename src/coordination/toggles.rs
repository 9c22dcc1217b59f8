//! Toggle Dispatcher
//!
//! Named runtime switches with validated transitions and change callbacks.
//! Other components consult toggles (through [`ToggleGate`]) before doing work.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SwitchboardError};
use crate::platform::{Command, CommandHandler, Component, HandlerResult, HealthInfo};

/// Change records kept per toggle
const TOGGLE_HISTORY_LIMIT: usize = 100;

pub const SYSTEM_ACTIVE: &str = "system_active";
pub const HEARTBEAT_ENABLED: &str = "heartbeat_enabled";
pub const SYNC_ENABLED: &str = "sync_enabled";
pub const MONITORING_ENABLED: &str = "monitoring_enabled";
pub const TELEGRAM_ENABLED: &str = "telegram_enabled";
pub const FAILSAFE_ENABLED: &str = "failsafe_enabled";
pub const LOAD_BALANCING_ENABLED: &str = "load_balancing_enabled";
pub const AUDIT_LOGGING_ENABLED: &str = "audit_logging_enabled";

const DEFAULT_TOGGLES: [(&str, &str); 8] = [
    (SYSTEM_ACTIVE, "System Active"),
    (HEARTBEAT_ENABLED, "Heartbeat Enabled"),
    (SYNC_ENABLED, "Sync Enabled"),
    (MONITORING_ENABLED, "Monitoring Enabled"),
    (TELEGRAM_ENABLED, "Telegram Enabled"),
    (FAILSAFE_ENABLED, "Failsafe Enabled"),
    (LOAD_BALANCING_ENABLED, "Load Balancing Enabled"),
    (AUDIT_LOGGING_ENABLED, "Audit Logging Enabled"),
];

/// Toggle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToggleState {
    On,
    Off,
    Transitioning,
    Error,
    Unknown,
}

impl std::fmt::Display for ToggleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToggleState::On => write!(f, "on"),
            ToggleState::Off => write!(f, "off"),
            ToggleState::Transitioning => write!(f, "transitioning"),
            ToggleState::Error => write!(f, "error"),
            ToggleState::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for ToggleState {
    type Err = SwitchboardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "on" => Ok(ToggleState::On),
            "off" => Ok(ToggleState::Off),
            "transitioning" => Ok(ToggleState::Transitioning),
            "error" => Ok(ToggleState::Error),
            "unknown" => Ok(ToggleState::Unknown),
            other => Err(SwitchboardError::Validation(format!(
                "unknown toggle state: {}",
                other
            ))),
        }
    }
}

/// One accepted transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToggleChange {
    pub timestamp: DateTime<Utc>,
    pub from: ToggleState,
    pub to: ToggleState,
    pub source: String,
}

/// Read-only view of a toggle
#[derive(Debug, Clone, Serialize)]
pub struct ToggleInfo {
    pub toggle_id: String,
    pub name: String,
    pub state: ToggleState,
    pub previous_state: Option<ToggleState>,
    pub created_at: DateTime<Utc>,
    pub last_changed: DateTime<Utc>,
    pub change_count: u64,
    pub metadata: Value,
    pub history: Vec<ToggleChange>,
}

/// Result of [`ToggleDispatcher::change_state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Requested state equals the current one; nothing ran
    Unchanged,
    Changed { from: ToggleState, to: ToggleState },
}

impl Transition {
    pub fn changed(&self) -> bool {
        matches!(self, Transition::Changed { .. })
    }
}

/// Gatekeeper consulted before a transition is committed
#[async_trait]
pub trait ToggleValidator: Send + Sync {
    /// `Ok(false)` rejects the transition; an error rejects it too
    async fn validate(
        &self,
        toggle: &ToggleInfo,
        new_state: ToggleState,
    ) -> std::result::Result<bool, String>;
}

/// Observer run after a transition is committed
#[async_trait]
pub trait ToggleCallback: Send + Sync {
    async fn on_change(
        &self,
        toggle: &ToggleInfo,
        change: &ToggleChange,
    ) -> std::result::Result<(), String>;
}

struct ValidatorFn<F>(F);

#[async_trait]
impl<F, Fut> ToggleValidator for ValidatorFn<F>
where
    F: Fn(ToggleInfo, ToggleState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<bool, String>> + Send + 'static,
{
    async fn validate(
        &self,
        toggle: &ToggleInfo,
        new_state: ToggleState,
    ) -> std::result::Result<bool, String> {
        (self.0)(toggle.clone(), new_state).await
    }
}

struct CallbackFn<F>(F);

#[async_trait]
impl<F, Fut> ToggleCallback for CallbackFn<F>
where
    F: Fn(ToggleInfo, ToggleChange) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
{
    async fn on_change(
        &self,
        toggle: &ToggleInfo,
        change: &ToggleChange,
    ) -> std::result::Result<(), String> {
        (self.0)(toggle.clone(), change.clone()).await
    }
}

pub fn validator_fn<F, Fut>(f: F) -> Arc<dyn ToggleValidator>
where
    F: Fn(ToggleInfo, ToggleState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<bool, String>> + Send + 'static,
{
    Arc::new(ValidatorFn(f))
}

pub fn callback_fn<F, Fut>(f: F) -> Arc<dyn ToggleCallback>
where
    F: Fn(ToggleInfo, ToggleChange) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
{
    Arc::new(CallbackFn(f))
}

/// Which callback list a registration goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    /// Every accepted transition
    StateChange,
    /// Transitions into `on`
    On,
    /// Transitions into `off`
    Off,
}

struct Toggle {
    toggle_id: String,
    name: String,
    state: ToggleState,
    previous_state: Option<ToggleState>,
    created_at: DateTime<Utc>,
    last_changed: DateTime<Utc>,
    change_count: u64,
    metadata: Value,
    history: VecDeque<ToggleChange>,
    validators: Vec<Arc<dyn ToggleValidator>>,
    state_callbacks: Vec<Arc<dyn ToggleCallback>>,
    on_callbacks: Vec<Arc<dyn ToggleCallback>>,
    off_callbacks: Vec<Arc<dyn ToggleCallback>>,
}

impl Toggle {
    fn new(toggle_id: &str, name: &str, state: ToggleState, metadata: Value) -> Self {
        let now = Utc::now();
        Self {
            toggle_id: toggle_id.to_string(),
            name: name.to_string(),
            state,
            previous_state: None,
            created_at: now,
            last_changed: now,
            change_count: 0,
            metadata,
            history: VecDeque::new(),
            validators: Vec::new(),
            state_callbacks: Vec::new(),
            on_callbacks: Vec::new(),
            off_callbacks: Vec::new(),
        }
    }

    fn info(&self) -> ToggleInfo {
        ToggleInfo {
            toggle_id: self.toggle_id.clone(),
            name: self.name.clone(),
            state: self.state,
            previous_state: self.previous_state,
            created_at: self.created_at,
            last_changed: self.last_changed,
            change_count: self.change_count,
            metadata: self.metadata.clone(),
            history: self.history.iter().cloned().collect(),
        }
    }

    /// Commit a transition and return the callbacks to run, in firing order
    fn commit(
        &mut self,
        new_state: ToggleState,
        source: &str,
    ) -> (ToggleChange, Vec<Arc<dyn ToggleCallback>>) {
        let change = ToggleChange {
            timestamp: Utc::now(),
            from: self.state,
            to: new_state,
            source: source.to_string(),
        };

        self.previous_state = Some(self.state);
        self.state = new_state;
        self.last_changed = change.timestamp;
        self.change_count += 1;
        self.history.push_back(change.clone());
        while self.history.len() > TOGGLE_HISTORY_LIMIT {
            self.history.pop_front();
        }

        let mut callbacks = self.state_callbacks.clone();
        match new_state {
            ToggleState::On => callbacks.extend(self.on_callbacks.iter().cloned()),
            ToggleState::Off => callbacks.extend(self.off_callbacks.iter().cloned()),
            _ => {}
        }
        (change, callbacks)
    }
}

/// Dispatcher metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToggleMetrics {
    pub commands_processed: u64,
    pub state_changes: u64,
    pub validation_failures: u64,
    pub callback_errors: u64,
}

/// Owns every toggle; all state changes go through [`ToggleDispatcher::change_state`]
pub struct ToggleDispatcher {
    toggles: RwLock<HashMap<String, Toggle>>,
    /// Serializes validate-and-commit so concurrent requests see each other's result
    transition_lock: Mutex<()>,
    metrics: RwLock<ToggleMetrics>,
}

impl Default for ToggleDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ToggleDispatcher {
    /// Create a dispatcher seeded with the default toggles, all `on`
    pub fn new() -> Self {
        let toggles = DEFAULT_TOGGLES
            .iter()
            .map(|(id, name)| {
                (
                    id.to_string(),
                    Toggle::new(id, name, ToggleState::On, json!({ "default": true })),
                )
            })
            .collect();

        Self {
            toggles: RwLock::new(toggles),
            transition_lock: Mutex::new(()),
            metrics: RwLock::new(ToggleMetrics::default()),
        }
    }

    /// Create a toggle; returns the existing one if the id is taken
    pub async fn create_toggle(
        &self,
        toggle_id: &str,
        name: &str,
        initial_state: ToggleState,
        metadata: Value,
    ) -> ToggleInfo {
        let mut toggles = self.toggles.write().await;
        if let Some(existing) = toggles.get(toggle_id) {
            warn!("Toggle {} already exists", toggle_id);
            return existing.info();
        }
        let toggle = Toggle::new(toggle_id, name, initial_state, metadata);
        let info = toggle.info();
        toggles.insert(toggle_id.to_string(), toggle);
        info!("Created toggle {} ({}) in state {}", toggle_id, name, initial_state);
        info
    }

    pub async fn delete_toggle(&self, toggle_id: &str) -> bool {
        let removed = self.toggles.write().await.remove(toggle_id).is_some();
        if removed {
            info!("Deleted toggle {}", toggle_id);
        }
        removed
    }

    pub async fn get_toggle(&self, toggle_id: &str) -> Option<ToggleInfo> {
        self.toggles.read().await.get(toggle_id).map(Toggle::info)
    }

    pub async fn get_state(&self, toggle_id: &str) -> Option<ToggleState> {
        self.toggles.read().await.get(toggle_id).map(|t| t.state)
    }

    /// Unknown toggles are neither on nor off
    pub async fn is_on(&self, toggle_id: &str) -> bool {
        self.get_state(toggle_id).await == Some(ToggleState::On)
    }

    pub async fn is_off(&self, toggle_id: &str) -> bool {
        self.get_state(toggle_id).await == Some(ToggleState::Off)
    }

    /// All toggles sorted by id
    pub async fn list_toggles(&self) -> Vec<ToggleInfo> {
        let mut list: Vec<ToggleInfo> = self.toggles.read().await.values().map(Toggle::info).collect();
        list.sort_by(|a, b| a.toggle_id.cmp(&b.toggle_id));
        list
    }

    pub async fn add_validator(&self, toggle_id: &str, validator: Arc<dyn ToggleValidator>) -> Result<()> {
        let mut toggles = self.toggles.write().await;
        let toggle = toggles
            .get_mut(toggle_id)
            .ok_or_else(|| SwitchboardError::not_found("toggle", toggle_id))?;
        toggle.validators.push(validator);
        Ok(())
    }

    pub async fn add_callback(
        &self,
        toggle_id: &str,
        kind: CallbackKind,
        callback: Arc<dyn ToggleCallback>,
    ) -> Result<()> {
        let mut toggles = self.toggles.write().await;
        let toggle = toggles
            .get_mut(toggle_id)
            .ok_or_else(|| SwitchboardError::not_found("toggle", toggle_id))?;
        match kind {
            CallbackKind::StateChange => toggle.state_callbacks.push(callback),
            CallbackKind::On => toggle.on_callbacks.push(callback),
            CallbackKind::Off => toggle.off_callbacks.push(callback),
        }
        Ok(())
    }

    /// Request a transition.
    ///
    /// Same-state requests succeed with [`Transition::Unchanged`] and run
    /// nothing. Otherwise validators run in registration order; a `false` or
    /// an error rejects the transition with no state change. Accepted
    /// transitions are committed before any callback runs, and callback
    /// failures never undo them.
    pub async fn change_state(
        &self,
        toggle_id: &str,
        new_state: ToggleState,
        source: &str,
    ) -> Result<Transition> {
        let guard = self.transition_lock.lock().await;

        let (snapshot, validators) = {
            let toggles = self.toggles.read().await;
            let toggle = toggles
                .get(toggle_id)
                .ok_or_else(|| SwitchboardError::not_found("toggle", toggle_id))?;
            if toggle.state == new_state {
                debug!("Toggle {} already {}", toggle_id, new_state);
                return Ok(Transition::Unchanged);
            }
            (toggle.info(), toggle.validators.clone())
        };

        for validator in validators {
            let reason = match validator.validate(&snapshot, new_state).await {
                Ok(true) => continue,
                Ok(false) => "rejected by validator".to_string(),
                Err(e) => format!("validator error: {}", e),
            };
            self.metrics.write().await.validation_failures += 1;
            warn!(
                "Toggle {} transition {} -> {} refused: {}",
                toggle_id, snapshot.state, new_state, reason
            );
            return Err(SwitchboardError::Validation(format!(
                "toggle {} cannot change to {}: {}",
                toggle_id, new_state, reason
            )));
        }

        let (info, change, callbacks) = {
            let mut toggles = self.toggles.write().await;
            let toggle = toggles
                .get_mut(toggle_id)
                .ok_or_else(|| SwitchboardError::not_found("toggle", toggle_id))?;
            let (change, callbacks) = toggle.commit(new_state, source);
            (toggle.info(), change, callbacks)
        };
        drop(guard);

        self.metrics.write().await.state_changes += 1;
        info!(
            "Toggle {} changed: {} -> {} (source: {})",
            toggle_id, change.from, change.to, source
        );

        for callback in callbacks {
            if let Err(e) = callback.on_change(&info, &change).await {
                self.metrics.write().await.callback_errors += 1;
                error!("Toggle {} callback failed: {}", toggle_id, e);
            }
        }

        Ok(Transition::Changed {
            from: change.from,
            to: change.to,
        })
    }

    pub async fn toggle_on(&self, toggle_id: &str, source: &str) -> Result<Transition> {
        self.change_state(toggle_id, ToggleState::On, source).await
    }

    pub async fn toggle_off(&self, toggle_id: &str, source: &str) -> Result<Transition> {
        self.change_state(toggle_id, ToggleState::Off, source).await
    }

    /// Log changes to the system-wide toggles
    pub async fn install_system_callbacks(&self) -> Result<()> {
        self.add_callback(
            SYSTEM_ACTIVE,
            CallbackKind::StateChange,
            callback_fn(|_, change: ToggleChange| async move {
                if change.to == ToggleState::Off {
                    warn!("System deactivated by {}", change.source);
                } else {
                    info!("System state now {} (by {})", change.to, change.source);
                }
                Ok(())
            }),
        )
        .await?;
        self.add_callback(
            HEARTBEAT_ENABLED,
            CallbackKind::StateChange,
            callback_fn(|_, change: ToggleChange| async move {
                info!("Heartbeat toggle now {} (by {})", change.to, change.source);
                Ok(())
            }),
        )
        .await
    }

    /// Command surface: `toggle_on`, `toggle_off`, `toggle_state`, `toggle_info`, `list_toggles`
    pub async fn execute_command(&self, command_type: &str, payload: &Value, source: &str) -> Result<Value> {
        self.metrics.write().await.commands_processed += 1;

        let toggle_id = || {
            payload
                .get("toggle_id")
                .and_then(Value::as_str)
                .ok_or_else(|| SwitchboardError::Validation("toggle_id required".to_string()))
        };

        match command_type {
            "toggle_on" | "toggle_off" => {
                let id = toggle_id()?;
                let transition = if command_type == "toggle_on" {
                    self.toggle_on(id, source).await?
                } else {
                    self.toggle_off(id, source).await?
                };
                Ok(json!({
                    "toggle_id": id,
                    "state": self.get_state(id).await,
                    "changed": transition.changed(),
                }))
            }
            "toggle_state" => {
                let id = toggle_id()?;
                let state: ToggleState = payload
                    .get("state")
                    .and_then(Value::as_str)
                    .ok_or_else(|| SwitchboardError::Validation("state required".to_string()))?
                    .parse()?;
                let transition = self.change_state(id, state, source).await?;
                Ok(json!({
                    "toggle_id": id,
                    "state": state,
                    "changed": transition.changed(),
                }))
            }
            "toggle_info" => {
                let id = toggle_id()?;
                let info = self
                    .get_toggle(id)
                    .await
                    .ok_or_else(|| SwitchboardError::not_found("toggle", id))?;
                Ok(serde_json::to_value(info)?)
            }
            "list_toggles" => {
                let toggles = self.list_toggles().await;
                Ok(json!({ "count": toggles.len(), "toggles": toggles }))
            }
            other => Err(SwitchboardError::Validation(format!(
                "unknown toggle command: {}",
                other
            ))),
        }
    }

    pub async fn get_metrics(&self) -> ToggleMetrics {
        self.metrics.read().await.clone()
    }

    /// Counts by state plus the ten most recently changed toggles
    pub async fn get_toggle_summary(&self) -> Value {
        let toggles = self.list_toggles().await;
        let mut distribution: HashMap<String, usize> = HashMap::new();
        for toggle in &toggles {
            *distribution.entry(toggle.state.to_string()).or_default() += 1;
        }

        let mut recent = toggles.clone();
        recent.sort_by(|a, b| b.last_changed.cmp(&a.last_changed));
        let recent: Vec<Value> = recent
            .iter()
            .take(10)
            .map(|t| {
                json!({
                    "toggle_id": t.toggle_id,
                    "name": t.name,
                    "last_changed": t.last_changed,
                    "change_count": t.change_count,
                })
            })
            .collect();

        json!({
            "total_toggles": toggles.len(),
            "states_distribution": distribution,
            "recent_changes": recent,
        })
    }

    pub async fn get_status(&self) -> Value {
        let toggles = self.list_toggles().await;
        let states: HashMap<&str, ToggleState> = toggles
            .iter()
            .map(|t| (t.toggle_id.as_str(), t.state))
            .collect();
        json!({
            "toggle_count": toggles.len(),
            "states": states,
            "metrics": self.get_metrics().await,
        })
    }
}

#[async_trait]
impl CommandHandler for ToggleDispatcher {
    async fn handle(&self, command: &Command) -> HandlerResult {
        self.execute_command(&command.command_type, &command.payload, &command.source)
            .await
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl Component for ToggleDispatcher {
    fn name(&self) -> String {
        "toggle_dispatcher".to_string()
    }

    async fn status(&self) -> Option<Value> {
        Some(self.get_status().await)
    }

    async fn health_info(&self) -> Option<HealthInfo> {
        let errored: Vec<String> = self
            .list_toggles()
            .await
            .into_iter()
            .filter(|t| t.state == ToggleState::Error)
            .map(|t| t.toggle_id)
            .collect();
        Some(if errored.is_empty() {
            HealthInfo::healthy()
        } else {
            HealthInfo::unhealthy("toggles in error state")
                .with_details(json!({ "toggles": errored }))
        })
    }
}

/// Open only while every listed toggle is `on`. Toggles that do not exist
/// are ignored so deleting one never wedges a loop.
#[derive(Clone)]
pub struct ToggleGate {
    dispatcher: Arc<ToggleDispatcher>,
    toggle_ids: Vec<String>,
}

impl ToggleGate {
    pub fn new(dispatcher: Arc<ToggleDispatcher>, toggle_ids: &[&str]) -> Self {
        Self {
            dispatcher,
            toggle_ids: toggle_ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub async fn is_open(&self) -> bool {
        for id in &self.toggle_ids {
            if let Some(state) = self.dispatcher.get_state(id).await {
                if state != ToggleState::On {
                    return false;
                }
            }
        }
        true
    }
}

/// Convenience for optional gates held by loops
pub(crate) async fn gate_open(gate: &Option<ToggleGate>) -> bool {
    match gate {
        Some(gate) => gate.is_open().await,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback(counter: Arc<AtomicUsize>) -> Arc<dyn ToggleCallback> {
        callback_fn(move |_, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_defaults_seeded_on() {
        let dispatcher = ToggleDispatcher::new();
        let toggles = dispatcher.list_toggles().await;
        assert_eq!(toggles.len(), 8);
        assert!(toggles.iter().all(|t| t.state == ToggleState::On));
        assert!(dispatcher.is_on(FAILSAFE_ENABLED).await);
        assert!(!dispatcher.is_on("missing").await);
        assert!(!dispatcher.is_off("missing").await);
    }

    #[tokio::test]
    async fn test_repeat_transition_fires_once() {
        let dispatcher = ToggleDispatcher::new();
        let fired = Arc::new(AtomicUsize::new(0));
        dispatcher
            .add_callback(SYNC_ENABLED, CallbackKind::StateChange, counting_callback(fired.clone()))
            .await
            .unwrap();

        let first = dispatcher.toggle_off(SYNC_ENABLED, "test").await.unwrap();
        let second = dispatcher.toggle_off(SYNC_ENABLED, "test").await.unwrap();

        assert_eq!(first, Transition::Changed { from: ToggleState::On, to: ToggleState::Off });
        assert_eq!(second, Transition::Unchanged);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let info = dispatcher.get_toggle(SYNC_ENABLED).await.unwrap();
        assert_eq!(info.change_count, 1);
        assert_eq!(info.previous_state, Some(ToggleState::On));
        assert_eq!(info.history.len(), 1);
    }

    #[tokio::test]
    async fn test_validator_rejects_without_side_effects() {
        let dispatcher = ToggleDispatcher::new();
        let fired = Arc::new(AtomicUsize::new(0));
        dispatcher
            .add_validator(
                SYSTEM_ACTIVE,
                validator_fn(|_, state| async move { Ok(state != ToggleState::Off) }),
            )
            .await
            .unwrap();
        dispatcher
            .add_callback(SYSTEM_ACTIVE, CallbackKind::Off, counting_callback(fired.clone()))
            .await
            .unwrap();

        let err = dispatcher.toggle_off(SYSTEM_ACTIVE, "test").await.unwrap_err();
        assert!(matches!(err, SwitchboardError::Validation(_)));
        assert!(dispatcher.is_on(SYSTEM_ACTIVE).await);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.get_metrics().await.validation_failures, 1);
        assert_eq!(dispatcher.get_toggle(SYSTEM_ACTIVE).await.unwrap().change_count, 0);
    }

    #[tokio::test]
    async fn test_erroring_validator_rejects() {
        let dispatcher = ToggleDispatcher::new();
        dispatcher
            .add_validator(
                TELEGRAM_ENABLED,
                validator_fn(|_, _| async { Err("bot offline".to_string()) }),
            )
            .await
            .unwrap();

        let err = dispatcher.toggle_off(TELEGRAM_ENABLED, "test").await.unwrap_err();
        assert!(err.to_string().contains("bot offline"));
        assert!(dispatcher.is_on(TELEGRAM_ENABLED).await);
    }

    #[tokio::test]
    async fn test_callback_order_and_failure_keeps_state() {
        let dispatcher = ToggleDispatcher::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let off_order = order.clone();
        dispatcher
            .add_callback(
                MONITORING_ENABLED,
                CallbackKind::Off,
                callback_fn(move |_, _| {
                    let order = off_order.clone();
                    async move {
                        order.lock().unwrap().push("off");
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();
        let state_order = order.clone();
        dispatcher
            .add_callback(
                MONITORING_ENABLED,
                CallbackKind::StateChange,
                callback_fn(move |_, _| {
                    let order = state_order.clone();
                    async move {
                        order.lock().unwrap().push("state");
                        Err("boom".to_string())
                    }
                }),
            )
            .await
            .unwrap();

        let result = dispatcher.toggle_off(MONITORING_ENABLED, "test").await.unwrap();
        assert!(result.changed());
        assert!(dispatcher.is_off(MONITORING_ENABLED).await);
        assert_eq!(*order.lock().unwrap(), vec!["state", "off"]);
        assert_eq!(dispatcher.get_metrics().await.callback_errors, 1);
    }

    #[tokio::test]
    async fn test_unknown_toggle_not_found() {
        let dispatcher = ToggleDispatcher::new();
        let err = dispatcher.toggle_on("ghost", "test").await.unwrap_err();
        assert!(matches!(err, SwitchboardError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_create_and_delete() {
        let dispatcher = ToggleDispatcher::new();
        let info = dispatcher
            .create_toggle("beta", "Beta Feature", ToggleState::Off, Value::Null)
            .await;
        assert_eq!(info.state, ToggleState::Off);

        let again = dispatcher
            .create_toggle("beta", "Other", ToggleState::On, Value::Null)
            .await;
        assert_eq!(again.name, "Beta Feature");

        assert!(dispatcher.delete_toggle("beta").await);
        assert!(!dispatcher.delete_toggle("beta").await);
    }

    #[tokio::test]
    async fn test_command_surface() {
        let dispatcher = ToggleDispatcher::new();

        let off = dispatcher
            .execute_command("toggle_off", &json!({ "toggle_id": HEARTBEAT_ENABLED }), "api")
            .await
            .unwrap();
        assert_eq!(off["state"], json!("off"));
        assert_eq!(off["changed"], json!(true));

        let state = dispatcher
            .execute_command(
                "toggle_state",
                &json!({ "toggle_id": HEARTBEAT_ENABLED, "state": "error" }),
                "api",
            )
            .await
            .unwrap();
        assert_eq!(state["state"], json!("error"));

        let listed = dispatcher
            .execute_command("list_toggles", &Value::Null, "api")
            .await
            .unwrap();
        assert_eq!(listed["count"], json!(8));

        assert!(dispatcher
            .execute_command("toggle_on", &json!({}), "api")
            .await
            .is_err());
        assert!(dispatcher
            .execute_command("explode", &json!({}), "api")
            .await
            .is_err());
        assert_eq!(dispatcher.get_metrics().await.commands_processed, 5);

        let health = dispatcher.health_info().await.unwrap();
        assert!(!health.healthy);
    }

    #[tokio::test]
    async fn test_gate_follows_toggles() {
        let dispatcher = Arc::new(ToggleDispatcher::new());
        let gate = ToggleGate::new(dispatcher.clone(), &[FAILSAFE_ENABLED, "not_there"]);
        assert!(gate.is_open().await);

        dispatcher.toggle_off(FAILSAFE_ENABLED, "test").await.unwrap();
        assert!(!gate.is_open().await);
        assert!(gate_open(&None).await);
    }
}
