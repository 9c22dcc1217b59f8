//! Failsafe Monitor
//!
//! Polls component health, escalates consecutive failures, counts events per
//! (condition, component) in sliding windows and runs the remediation actions
//! that match each event.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::event::{ActionRecord, FailsafeCondition, FailsafeEvent, FailsafeLevel};
use super::playbook::{
    ActionSummary, AlertSink, FailsafeAction, LogEvent, RestartComponent, SendAlert, SystemHalt,
};
use crate::config::window_duration;
use crate::coordination::toggles::{gate_open, ToggleGate};
use crate::error::{Result, SwitchboardError};
use crate::platform::ComponentRegistry;

/// Failsafe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailsafeConfig {
    /// Health poll period (default: 10s)
    pub check_interval_secs: u64,
    /// Sync failures per 10 minutes before a breach (default: 5)
    pub max_sync_failures: usize,
    /// Heartbeat failures per 5 minutes before a breach (default: 3)
    pub max_heartbeat_failures: usize,
    /// Command failures per 15 minutes before a breach (default: 10)
    pub max_command_failures: usize,
    /// Consecutive failed checks that escalate to critical (default: 3)
    pub escalation_threshold: u32,
    /// Events kept in the log (default: 1000)
    pub max_events: usize,
    /// Pause between stop and start in `restart_component` (default: 2s)
    pub restart_delay_ms: u64,
    /// Age after which counted events are forgotten (default: 1h)
    pub counter_retention_secs: u64,
}

impl Default for FailsafeConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 10,
            max_sync_failures: 5,
            max_heartbeat_failures: 3,
            max_command_failures: 10,
            escalation_threshold: 3,
            max_events: 1000,
            restart_delay_ms: 2000,
            counter_retention_secs: 3600,
        }
    }
}

/// Sliding-window rule for one condition
#[derive(Debug, Clone, Serialize)]
pub struct ConditionThreshold {
    pub condition: FailsafeCondition,
    pub threshold: usize,
    pub window_minutes: i64,
    pub level: FailsafeLevel,
}

impl ConditionThreshold {
    pub fn defaults(config: &FailsafeConfig) -> Vec<ConditionThreshold> {
        vec![
            ConditionThreshold {
                condition: FailsafeCondition::SyncFailure,
                threshold: config.max_sync_failures,
                window_minutes: 10,
                level: FailsafeLevel::Critical,
            },
            ConditionThreshold {
                condition: FailsafeCondition::HeartbeatFailure,
                threshold: config.max_heartbeat_failures,
                window_minutes: 5,
                level: FailsafeLevel::Critical,
            },
            ConditionThreshold {
                condition: FailsafeCondition::ComponentFailure,
                threshold: 1,
                window_minutes: 1,
                level: FailsafeLevel::Warning,
            },
            ConditionThreshold {
                condition: FailsafeCondition::CommandFailure,
                threshold: config.max_command_failures,
                window_minutes: 15,
                level: FailsafeLevel::Warning,
            },
        ]
    }

    fn window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.window_minutes)
    }
}

/// Custom probe that overrides a component's own health report
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> std::result::Result<bool, String>;
}

pub struct HealthCheckFn<F>(F);

#[async_trait]
impl<F, Fut> HealthCheck for HealthCheckFn<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<bool, String>> + Send + 'static,
{
    async fn check(&self) -> std::result::Result<bool, String> {
        (self.0)().await
    }
}

pub fn health_check_fn<F, Fut>(f: F) -> Arc<dyn HealthCheck>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<bool, String>> + Send + 'static,
{
    Arc::new(HealthCheckFn(f))
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_check: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailsafeStatus {
    pub running: bool,
    pub halt_requested: bool,
    pub monitored_components: Vec<String>,
    pub health_status: BTreeMap<String, ComponentHealth>,
    pub recent_events: Vec<FailsafeEvent>,
    /// Events per condition over the last hour, among the last 100 events
    pub event_counts: BTreeMap<String, usize>,
    pub actions: Vec<ActionSummary>,
}

type CounterKey = (FailsafeCondition, String);

#[derive(Default)]
struct FailsafeState {
    health: BTreeMap<String, ComponentHealth>,
    events: VecDeque<FailsafeEvent>,
    counters: HashMap<CounterKey, VecDeque<DateTime<Utc>>>,
    /// Last breach per key; suppresses repeats inside the window
    last_breach: HashMap<CounterKey, DateTime<Utc>>,
    action_history: VecDeque<ActionRecord>,
}

struct FailsafeShared {
    config: FailsafeConfig,
    thresholds: Vec<ConditionThreshold>,
    registry: ComponentRegistry,
    /// Registration order is execution order
    actions: RwLock<Vec<FailsafeAction>>,
    health_checks: RwLock<HashMap<String, Arc<dyn HealthCheck>>>,
    state: RwLock<FailsafeState>,
    halt: Arc<AtomicBool>,
    alert_sink: Arc<RwLock<Option<Arc<dyn AlertSink>>>>,
    running: AtomicBool,
    gate: RwLock<Option<ToggleGate>>,
    event_tx: broadcast::Sender<FailsafeEvent>,
}

pub struct FailsafeMonitor {
    shared: Arc<FailsafeShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FailsafeMonitor {
    /// Monitor over `registry`, with the four built-in actions registered
    pub fn new(config: FailsafeConfig, registry: ComponentRegistry) -> Self {
        let halt = Arc::new(AtomicBool::new(false));
        let alert_sink: Arc<RwLock<Option<Arc<dyn AlertSink>>>> = Arc::new(RwLock::new(None));
        let (event_tx, _) = broadcast::channel(256);

        let actions = vec![
            FailsafeAction::new(
                "restart_component",
                "Restart Failed Component",
                vec![FailsafeCondition::ComponentFailure],
                FailsafeLevel::Warning,
                Arc::new(RestartComponent::new(
                    registry.clone(),
                    Duration::from_millis(config.restart_delay_ms),
                )),
            ),
            FailsafeAction::new(
                "system_halt",
                "Emergency System Halt",
                vec![
                    FailsafeCondition::SyncFailure,
                    FailsafeCondition::HeartbeatFailure,
                ],
                FailsafeLevel::Emergency,
                Arc::new(SystemHalt::new(halt.clone())),
            ),
            FailsafeAction::new(
                "send_alert",
                "Send Alert Notification",
                FailsafeCondition::ALL.to_vec(),
                FailsafeLevel::Info,
                Arc::new(SendAlert::new(alert_sink.clone())),
            ),
            FailsafeAction::new(
                "log_event",
                "Log Failsafe Event",
                FailsafeCondition::ALL.to_vec(),
                FailsafeLevel::Info,
                Arc::new(LogEvent),
            ),
        ];

        Self {
            shared: Arc::new(FailsafeShared {
                thresholds: ConditionThreshold::defaults(&config),
                config,
                registry,
                actions: RwLock::new(actions),
                health_checks: RwLock::new(HashMap::new()),
                state: RwLock::new(FailsafeState::default()),
                halt,
                alert_sink,
                running: AtomicBool::new(false),
                gate: RwLock::new(None),
                event_tx,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FailsafeEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.shared.registry
    }

    /// Skip health polling while the gate is closed
    pub async fn set_gate(&self, gate: ToggleGate) {
        *self.shared.gate.write().await = Some(gate);
    }

    pub async fn set_alert_sink(&self, sink: Arc<dyn AlertSink>) {
        *self.shared.alert_sink.write().await = Some(sink);
        info!("Failsafe alert sink configured");
    }

    pub async fn register_health_check(&self, component: &str, check: Arc<dyn HealthCheck>) {
        self.shared
            .health_checks
            .write()
            .await
            .insert(component.to_string(), check);
        info!("Registered health check for component: {}", component);
    }

    /// Register an action; an existing id is replaced in place
    pub async fn register_action(&self, action: FailsafeAction) {
        let mut actions = self.shared.actions.write().await;
        info!(
            "Registered failsafe action: {} ({})",
            action.action_id, action.name
        );
        match actions.iter_mut().find(|a| a.action_id == action.action_id) {
            Some(existing) => *existing = action,
            None => actions.push(action),
        }
    }

    pub async fn enable_action(&self, action_id: &str) -> Result<()> {
        self.set_action_enabled(action_id, true).await
    }

    pub async fn disable_action(&self, action_id: &str) -> Result<()> {
        self.set_action_enabled(action_id, false).await
    }

    async fn set_action_enabled(&self, action_id: &str, enabled: bool) -> Result<()> {
        let mut actions = self.shared.actions.write().await;
        let action = actions
            .iter_mut()
            .find(|a| a.action_id == action_id)
            .ok_or_else(|| SwitchboardError::not_found("failsafe action", action_id))?;
        action.enabled = enabled;
        info!(
            "Failsafe action {} {}",
            action_id,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Record an event, run the matching actions and return the event id
    pub async fn trigger_event(
        &self,
        condition: FailsafeCondition,
        level: FailsafeLevel,
        message: &str,
        component: &str,
        metadata: Value,
    ) -> String {
        self.shared
            .emit(FailsafeEvent::new(condition, level, message, component, metadata), true)
            .await
    }

    /// Probe every monitored component once, emitting escalation events
    pub async fn check_all_components(&self) {
        self.shared.check_all_components().await
    }

    /// Emit breach events for keys over their window threshold; returns
    /// the breach event ids
    pub async fn check_condition_thresholds(&self) -> Vec<String> {
        self.shared.check_condition_thresholds().await
    }

    pub fn should_halt(&self) -> bool {
        self.shared.halt.load(Ordering::SeqCst)
    }

    pub fn reset_halt(&self) {
        self.shared.halt.store(false, Ordering::SeqCst);
        info!("Failsafe halt request cleared");
    }

    pub async fn acknowledge_event(&self, event_id: &str) -> bool {
        let mut state = self.shared.state.write().await;
        match state.events.iter_mut().find(|e| e.event_id == event_id) {
            Some(event) => {
                event.acknowledged = true;
                info!("Failsafe event acknowledged: {}", event_id);
                true
            }
            None => false,
        }
    }

    pub async fn resolve_event(&self, event_id: &str) -> bool {
        let mut state = self.shared.state.write().await;
        match state.events.iter_mut().find(|e| e.event_id == event_id) {
            Some(event) => {
                event.resolved = true;
                info!("Failsafe event resolved: {}", event_id);
                true
            }
            None => false,
        }
    }

    pub async fn get_event(&self, event_id: &str) -> Option<FailsafeEvent> {
        self.shared
            .state
            .read()
            .await
            .events
            .iter()
            .find(|e| e.event_id == event_id)
            .cloned()
    }

    /// Most recent events, oldest first
    pub async fn get_event_history(&self, limit: usize) -> Vec<FailsafeEvent> {
        let state = self.shared.state.read().await;
        let skip = state.events.len().saturating_sub(limit);
        state.events.iter().skip(skip).cloned().collect()
    }

    /// Most recent action executions, oldest first
    pub async fn get_action_history(&self, limit: usize) -> Vec<ActionRecord> {
        let state = self.shared.state.read().await;
        let skip = state.action_history.len().saturating_sub(limit);
        state.action_history.iter().skip(skip).cloned().collect()
    }

    pub async fn get_component_health(&self, component: &str) -> Option<ComponentHealth> {
        self.shared.state.read().await.health.get(component).cloned()
    }

    pub async fn get_status(&self) -> FailsafeStatus {
        let actions = self
            .shared
            .actions
            .read()
            .await
            .iter()
            .map(FailsafeAction::summary)
            .collect();
        let state = self.shared.state.read().await;

        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        let skip = state.events.len().saturating_sub(100);
        let mut event_counts: BTreeMap<String, usize> = FailsafeCondition::ALL
            .iter()
            .map(|c| (c.as_str().to_string(), 0))
            .collect();
        for event in state.events.iter().skip(skip) {
            if event.timestamp > hour_ago {
                *event_counts.entry(event.condition.as_str().to_string()).or_insert(0) += 1;
            }
        }

        let recent_skip = state.events.len().saturating_sub(10);
        FailsafeStatus {
            running: self.is_running(),
            halt_requested: self.should_halt(),
            monitored_components: self.shared.monitored_components().await,
            health_status: state.health.clone(),
            recent_events: state.events.iter().skip(recent_skip).cloned().collect(),
            event_counts,
            actions,
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Start the polling loop; clears any previous halt request
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            warn!("Failsafe monitor already running");
            return;
        }
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.halt.store(false, Ordering::SeqCst);

        let shared = self.shared.clone();
        let period = Duration::from_secs(shared.config.check_interval_secs.max(1));
        *worker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            while shared.running.load(Ordering::SeqCst) {
                interval.tick().await;
                if !gate_open(&*shared.gate.read().await).await {
                    debug!("Failsafe poll skipped: gate closed");
                    continue;
                }
                shared.check_all_components().await;
                shared.check_condition_thresholds().await;
            }
        }));
        info!("Failsafe monitor started");
    }

    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().await.take() {
            handle.abort();
            match handle.await {
                Err(e) if !e.is_cancelled() => error!("Failsafe loop failed: {}", e),
                _ => {}
            }
        }
        info!("Failsafe monitor stopped");
    }
}

impl FailsafeShared {
    /// Registry components plus any name with a custom check
    async fn monitored_components(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.registry.names().into_iter().collect();
        names.extend(self.health_checks.read().await.keys().cloned());
        names.into_iter().collect()
    }

    /// Custom check, else health report, else liveness flag, else healthy
    async fn probe(&self, name: &str) -> bool {
        let check = self.health_checks.read().await.get(name).cloned();
        if let Some(check) = check {
            return match check.check().await {
                Ok(healthy) => healthy,
                Err(e) => {
                    error!("Health check failed for {}: {}", name, e);
                    false
                }
            };
        }

        let Some(component) = self.registry.get(name) else {
            return false;
        };
        if let Some(info) = component.health_info().await {
            return info.healthy;
        }
        component.is_running().unwrap_or(true)
    }

    async fn check_all_components(&self) {
        let threshold = self.config.escalation_threshold.max(1);

        for name in self.monitored_components().await {
            let healthy = self.probe(&name).await;
            let consecutive = {
                let mut state = self.state.write().await;
                let health = state.health.entry(name.clone()).or_insert(ComponentHealth {
                    healthy: true,
                    consecutive_failures: 0,
                    last_check: Utc::now(),
                });
                health.healthy = healthy;
                health.last_check = Utc::now();
                if healthy {
                    health.consecutive_failures = 0;
                } else {
                    health.consecutive_failures += 1;
                }
                health.consecutive_failures
            };

            if healthy {
                continue;
            }
            if consecutive == 1 {
                self.emit(
                    FailsafeEvent::new(
                        FailsafeCondition::ComponentFailure,
                        FailsafeLevel::Warning,
                        format!("Component {} health check failed", name),
                        name.clone(),
                        json!({ "consecutive_failures": consecutive }),
                    ),
                    true,
                )
                .await;
            } else if consecutive == threshold {
                self.emit(
                    FailsafeEvent::new(
                        FailsafeCondition::ComponentFailure,
                        FailsafeLevel::Critical,
                        format!(
                            "Component {} has {} consecutive failures",
                            name, consecutive
                        ),
                        name.clone(),
                        json!({ "consecutive_failures": consecutive }),
                    ),
                    true,
                )
                .await;
            } else {
                debug!(
                    "Component {} still unhealthy ({} consecutive failures)",
                    name, consecutive
                );
            }
        }
    }

    async fn check_condition_thresholds(&self) -> Vec<String> {
        let now = Utc::now();
        let mut breaches = Vec::new();
        {
            let mut state = self.state.write().await;
            let state = &mut *state;
            for rule in &self.thresholds {
                let cutoff = now - rule.window();
                for ((condition, component), stamps) in &state.counters {
                    if *condition != rule.condition {
                        continue;
                    }
                    let recent = stamps.iter().filter(|ts| **ts > cutoff).count();
                    if recent < rule.threshold {
                        continue;
                    }
                    let key = (*condition, component.clone());
                    if state
                        .last_breach
                        .get(&key)
                        .map(|at| *at > cutoff)
                        .unwrap_or(false)
                    {
                        continue;
                    }
                    state.last_breach.insert(key, now);
                    breaches.push((rule.clone(), component.clone(), recent));
                }
            }
        }

        let mut ids = Vec::with_capacity(breaches.len());
        for (rule, component, count) in breaches {
            warn!(
                "Threshold breach: {} {} events for {} in {} minutes",
                count, rule.condition, component, rule.window_minutes
            );
            let event = FailsafeEvent::new(
                rule.condition,
                rule.level,
                format!(
                    "Threshold breach: {} {} events in {} minutes",
                    count, rule.condition, rule.window_minutes
                ),
                component,
                json!({
                    "threshold": rule.threshold,
                    "actual_count": count,
                    "window_minutes": rule.window_minutes,
                }),
            );
            ids.push(self.emit(event, false).await);
        }
        ids
    }

    /// Log the event, run matching actions, attach their records. Breach
    /// events are emitted with `counted = false` so they do not feed the
    /// window counters.
    async fn emit(&self, event: FailsafeEvent, counted: bool) -> String {
        let event_id = event.event_id.clone();
        warn!(
            "Failsafe event triggered: {} [{} {}] {} - {}",
            event_id, event.level, event.condition, event.component, event.message
        );

        {
            let mut state = self.state.write().await;
            if counted {
                let retention_cutoff = event
                    .timestamp
                    .checked_sub_signed(window_duration(self.config.counter_retention_secs))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                let key = (event.condition, event.component.clone());
                let stamps = state.counters.entry(key).or_default();
                stamps.push_back(event.timestamp);
                while stamps.front().map(|ts| *ts <= retention_cutoff).unwrap_or(false) {
                    stamps.pop_front();
                }
                state.counters.retain(|_, stamps| {
                    stamps
                        .back()
                        .map(|ts| *ts > retention_cutoff)
                        .unwrap_or(false)
                });
            }
            state.events.push_back(event.clone());
            while state.events.len() > self.config.max_events {
                state.events.pop_front();
            }
        }

        let records = self.execute_actions(&event).await;

        let stored = {
            let mut state = self.state.write().await;
            state.action_history.extend(records.iter().cloned());
            while state.action_history.len() > self.config.max_events {
                state.action_history.pop_front();
            }
            state
                .events
                .iter_mut()
                .find(|e| e.event_id == event_id)
                .map(|e| {
                    e.actions_taken = records;
                    e.clone()
                })
        };

        let _ = self.event_tx.send(stored.unwrap_or(event));
        event_id
    }

    async fn execute_actions(&self, event: &FailsafeEvent) -> Vec<ActionRecord> {
        let matching: Vec<FailsafeAction> = self
            .actions
            .read()
            .await
            .iter()
            .filter(|a| a.matches(event))
            .cloned()
            .collect();

        let mut records = Vec::with_capacity(matching.len());
        for action in matching {
            info!("Executing failsafe action: {}", action.name);
            let handler = action.handler.clone();
            let job = event.clone();
            // A panicking action surfaces as a JoinError
            let outcome = match tokio::spawn(async move { handler.execute(&job).await }).await {
                Ok(outcome) => outcome,
                Err(e) => Err(format!("action panicked: {}", e)),
            };
            let executed_at = Utc::now();

            let (result, error) = match outcome {
                Ok(result) => {
                    let mut actions = self.actions.write().await;
                    if let Some(stored) = actions.iter_mut().find(|a| a.action_id == action.action_id) {
                        stored.execution_count += 1;
                        stored.last_executed = Some(executed_at);
                    }
                    (Some(result), None)
                }
                Err(e) => {
                    error!("Failsafe action failed: {} - {}", action.name, e);
                    (None, Some(e))
                }
            };

            records.push(ActionRecord {
                event_id: event.event_id.clone(),
                action_id: action.action_id.clone(),
                name: action.name.clone(),
                executed_at,
                result,
                error,
            });
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{HealthInfo, MockComponent};
    use crate::supervisor::playbook::action_fn;
    use std::sync::atomic::AtomicUsize;

    fn unhealthy_component(name: &str) -> Arc<MockComponent> {
        let mut mock = MockComponent::new();
        mock.expect_name().return_const(name.to_string());
        mock.expect_health_info()
            .returning(|| Some(HealthInfo::unhealthy("down")));
        Arc::new(mock)
    }

    fn monitor_with(registry: ComponentRegistry) -> FailsafeMonitor {
        FailsafeMonitor::new(
            FailsafeConfig {
                restart_delay_ms: 1,
                ..Default::default()
            },
            registry,
        )
    }

    #[tokio::test]
    async fn test_escalation_warning_then_critical_once() {
        let registry = ComponentRegistry::new();
        registry.register(unhealthy_component("x"));
        let monitor = monitor_with(registry);
        monitor.disable_action("restart_component").await.unwrap();

        for _ in 0..4 {
            monitor.check_all_components().await;
        }

        let events = monitor.get_event_history(100).await;
        let levels: Vec<FailsafeLevel> = events.iter().map(|e| e.level).collect();
        assert_eq!(levels, vec![FailsafeLevel::Warning, FailsafeLevel::Critical]);
        assert!(events.iter().all(|e| e.component == "x"));

        let health = monitor.get_component_health("x").await.unwrap();
        assert_eq!(health.consecutive_failures, 4);
        assert!(!health.healthy);
    }

    #[tokio::test]
    async fn test_healthy_check_resets_counter() {
        let healthy = Arc::new(AtomicBool::new(false));
        let monitor = monitor_with(ComponentRegistry::new());
        let flag = healthy.clone();
        monitor
            .register_health_check(
                "feed",
                health_check_fn(move || {
                    let flag = flag.clone();
                    async move { Ok(flag.load(Ordering::SeqCst)) }
                }),
            )
            .await;

        monitor.check_all_components().await;
        healthy.store(true, Ordering::SeqCst);
        monitor.check_all_components().await;
        healthy.store(false, Ordering::SeqCst);
        monitor.check_all_components().await;

        let warnings = monitor
            .get_event_history(100)
            .await
            .into_iter()
            .filter(|e| e.level == FailsafeLevel::Warning)
            .count();
        assert_eq!(warnings, 2);
    }

    #[tokio::test]
    async fn test_action_bound_to_sync_ignores_component_failure() {
        let monitor = monitor_with(ComponentRegistry::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        monitor
            .register_action(FailsafeAction::new(
                "sync_only",
                "Sync Only",
                vec![FailsafeCondition::SyncFailure],
                FailsafeLevel::Warning,
                action_fn(move |_e: FailsafeEvent| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                }),
            ))
            .await;

        monitor
            .trigger_event(
                FailsafeCondition::ComponentFailure,
                FailsafeLevel::Warning,
                "engine down",
                "engine",
                Value::Null,
            )
            .await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        monitor
            .trigger_event(
                FailsafeCondition::SyncFailure,
                FailsafeLevel::Warning,
                "clock off",
                "sync_manager",
                Value::Null,
            )
            .await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_action_does_not_stop_others() {
        let monitor = monitor_with(ComponentRegistry::new());
        monitor
            .register_action(FailsafeAction::new(
                "broken",
                "Broken",
                vec![FailsafeCondition::Custom],
                FailsafeLevel::Info,
                action_fn(|_e: FailsafeEvent| async move { Err("exploded".to_string()) }),
            ))
            .await;

        let id = monitor
            .trigger_event(
                FailsafeCondition::Custom,
                FailsafeLevel::Info,
                "custom",
                "system",
                json!({"k": "v"}),
            )
            .await;

        let event = monitor.get_event(&id).await.unwrap();
        let ids: Vec<&str> = event.actions_taken.iter().map(|r| r.action_id.as_str()).collect();
        assert_eq!(ids, vec!["send_alert", "log_event", "broken"]);
        assert_eq!(event.actions_taken[2].error.as_deref(), Some("exploded"));
        assert!(event.actions_taken[1].succeeded());

        let history = monitor.get_action_history(50).await;
        assert_eq!(history.len(), 3);
    }

    #[tokio::test]
    async fn test_emergency_sync_failure_requests_halt() {
        let monitor = monitor_with(ComponentRegistry::new());
        assert!(!monitor.should_halt());
        monitor
            .trigger_event(
                FailsafeCondition::SyncFailure,
                FailsafeLevel::Emergency,
                "clock lost",
                "sync_manager",
                Value::Null,
            )
            .await;
        assert!(monitor.should_halt());
        monitor.reset_halt();
        assert!(!monitor.should_halt());
    }

    #[tokio::test]
    async fn test_threshold_breach_once_per_window() {
        let monitor = FailsafeMonitor::new(
            FailsafeConfig {
                max_command_failures: 3,
                ..Default::default()
            },
            ComponentRegistry::new(),
        );
        for _ in 0..3 {
            monitor
                .trigger_event(
                    FailsafeCondition::CommandFailure,
                    FailsafeLevel::Info,
                    "command failed",
                    "engine",
                    Value::Null,
                )
                .await;
        }

        let breaches = monitor.check_condition_thresholds().await;
        assert_eq!(breaches.len(), 1);
        let breach = monitor.get_event(&breaches[0]).await.unwrap();
        assert_eq!(breach.level, FailsafeLevel::Warning);
        assert_eq!(breach.component, "engine");
        assert_eq!(breach.metadata["actual_count"], json!(3));

        assert!(monitor.check_condition_thresholds().await.is_empty());
    }

    #[tokio::test]
    async fn test_huge_counter_retention_keeps_counting() {
        let monitor = FailsafeMonitor::new(
            FailsafeConfig {
                max_command_failures: 2,
                counter_retention_secs: u64::MAX,
                ..Default::default()
            },
            ComponentRegistry::new(),
        );
        for _ in 0..2 {
            monitor
                .trigger_event(
                    FailsafeCondition::CommandFailure,
                    FailsafeLevel::Info,
                    "command failed",
                    "engine",
                    Value::Null,
                )
                .await;
        }
        assert_eq!(monitor.check_condition_thresholds().await.len(), 1);
    }

    #[tokio::test]
    async fn test_ack_resolve_and_status() {
        let monitor = monitor_with(ComponentRegistry::new());
        let id = monitor
            .trigger_event(
                FailsafeCondition::NetworkFailure,
                FailsafeLevel::Critical,
                "link down",
                "ingester",
                Value::Null,
            )
            .await;

        assert!(monitor.acknowledge_event(&id).await);
        assert!(monitor.resolve_event(&id).await);
        assert!(!monitor.resolve_event("fs_missing").await);
        let event = monitor.get_event(&id).await.unwrap();
        assert!(event.acknowledged && event.resolved);

        let status = monitor.get_status().await;
        assert_eq!(status.event_counts.get("network_failure"), Some(&1));
        assert_eq!(status.actions.len(), 4);
        assert!(matches!(
            monitor.enable_action("nope").await,
            Err(SwitchboardError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_restart_action_on_warning() {
        let mut mock = MockComponent::new();
        mock.expect_name().return_const("engine".to_string());
        mock.expect_health_info()
            .returning(|| Some(HealthInfo::unhealthy("stalled")));
        mock.expect_stop().times(1).returning(|| Ok(()));
        mock.expect_start().times(1).returning(|| Ok(()));

        let registry = ComponentRegistry::new();
        registry.register(Arc::new(mock));
        let monitor = monitor_with(registry);
        monitor.check_all_components().await;

        let history = monitor.get_action_history(10).await;
        assert!(history
            .iter()
            .any(|r| r.action_id == "restart_component" && r.succeeded()));
    }
}
