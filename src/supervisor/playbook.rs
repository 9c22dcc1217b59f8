//! Remediation Playbook
//!
//! Failsafe actions and the four built-ins: restart a component, request a
//! system halt, send an alert, write an audit record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use super::event::{FailsafeCondition, FailsafeEvent, FailsafeLevel};
use crate::platform::ComponentRegistry;

pub type ActionResult = std::result::Result<Value, String>;

/// Remediation step run when a matching event fires
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, event: &FailsafeEvent) -> ActionResult;
}

/// Adapter for async closures taking the event
pub struct ActionFn<F>(F);

#[async_trait]
impl<F, Fut> ActionHandler for ActionFn<F>
where
    F: Fn(FailsafeEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    async fn execute(&self, event: &FailsafeEvent) -> ActionResult {
        (self.0)(event.clone()).await
    }
}

pub fn action_fn<F, Fut>(f: F) -> Arc<dyn ActionHandler>
where
    F: Fn(FailsafeEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    Arc::new(ActionFn(f))
}

/// Outbound notification channel (chat bot, pager, ...)
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_alert(&self, message: &str) -> std::result::Result<(), String>;
}

/// Registered failsafe action
#[derive(Clone)]
pub struct FailsafeAction {
    pub action_id: String,
    pub name: String,
    pub conditions: Vec<FailsafeCondition>,
    pub level: FailsafeLevel,
    pub handler: Arc<dyn ActionHandler>,
    pub enabled: bool,
    pub execution_count: u64,
    pub last_executed: Option<DateTime<Utc>>,
}

impl FailsafeAction {
    pub fn new(
        action_id: impl Into<String>,
        name: impl Into<String>,
        conditions: Vec<FailsafeCondition>,
        level: FailsafeLevel,
        handler: Arc<dyn ActionHandler>,
    ) -> Self {
        Self {
            action_id: action_id.into(),
            name: name.into(),
            conditions,
            level,
            handler,
            enabled: true,
            execution_count: 0,
            last_executed: None,
        }
    }

    /// Condition must be listed; level must be equal unless the action is
    /// an `Info` catch-all
    pub fn matches(&self, event: &FailsafeEvent) -> bool {
        self.enabled
            && self.conditions.contains(&event.condition)
            && (self.level == event.level || self.level == FailsafeLevel::Info)
    }

    pub fn summary(&self) -> ActionSummary {
        ActionSummary {
            action_id: self.action_id.clone(),
            name: self.name.clone(),
            conditions: self.conditions.clone(),
            level: self.level,
            enabled: self.enabled,
            execution_count: self.execution_count,
            last_executed: self.last_executed,
        }
    }
}

impl std::fmt::Debug for FailsafeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailsafeAction")
            .field("action_id", &self.action_id)
            .field("level", &self.level)
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionSummary {
    pub action_id: String,
    pub name: String,
    pub conditions: Vec<FailsafeCondition>,
    pub level: FailsafeLevel,
    pub enabled: bool,
    pub execution_count: u64,
    pub last_executed: Option<DateTime<Utc>>,
}

/// Stop, pause, start the component named by the event
pub struct RestartComponent {
    registry: ComponentRegistry,
    delay: Duration,
}

impl RestartComponent {
    pub fn new(registry: ComponentRegistry, delay: Duration) -> Self {
        Self { registry, delay }
    }
}

#[async_trait]
impl ActionHandler for RestartComponent {
    async fn execute(&self, event: &FailsafeEvent) -> ActionResult {
        let name = &event.component;
        let component = self
            .registry
            .get(name)
            .ok_or_else(|| format!("Component not found: {}", name))?;

        component.stop().await.map_err(|e| {
            error!("Failed to stop component {} for restart: {}", name, e);
            e
        })?;
        tokio::time::sleep(self.delay).await;
        component.start().await.map_err(|e| {
            error!("Failed to restart component {}: {}", name, e);
            e
        })?;

        info!("Component {} restarted", name);
        Ok(json!({ "restarted": name }))
    }
}

/// Raise the halt flag; the host decides how to shut down
pub struct SystemHalt {
    halt: Arc<AtomicBool>,
}

impl SystemHalt {
    pub fn new(halt: Arc<AtomicBool>) -> Self {
        Self { halt }
    }
}

#[async_trait]
impl ActionHandler for SystemHalt {
    async fn execute(&self, event: &FailsafeEvent) -> ActionResult {
        error!("EMERGENCY HALT TRIGGERED: {}", event.message);
        self.halt.store(true, Ordering::SeqCst);
        Ok(json!({ "halt_requested": true }))
    }
}

/// Forward the event to the configured alert sink, if any
pub struct SendAlert {
    sink: Arc<RwLock<Option<Arc<dyn AlertSink>>>>,
}

impl SendAlert {
    pub fn new(sink: Arc<RwLock<Option<Arc<dyn AlertSink>>>>) -> Self {
        Self { sink }
    }
}

pub fn format_alert(event: &FailsafeEvent) -> String {
    format!(
        "Failsafe Alert\nCondition: {}\nLevel: {}\nComponent: {}\nMessage: {}\nTime: {}",
        event.condition,
        event.level,
        event.component,
        event.message,
        event.timestamp.to_rfc3339()
    )
}

#[async_trait]
impl ActionHandler for SendAlert {
    async fn execute(&self, event: &FailsafeEvent) -> ActionResult {
        let sink = self.sink.read().await.clone();
        match sink {
            Some(sink) => {
                sink.send_alert(&format_alert(event)).await.map_err(|e| {
                    warn!("Failed to send alert: {}", e);
                    e
                })?;
                Ok(json!({ "alert_sent": true }))
            }
            None => Ok(json!({ "alert_sent": false })),
        }
    }
}

/// Structured record on the `audit` tracing target
pub struct LogEvent;

#[async_trait]
impl ActionHandler for LogEvent {
    async fn execute(&self, event: &FailsafeEvent) -> ActionResult {
        let record = serde_json::to_string(event).map_err(|e| e.to_string())?;
        info!(
            target: "audit",
            event_id = %event.event_id,
            condition = %event.condition,
            level = %event.level,
            component = %event.component,
            "failsafe {}",
            record
        );
        Ok(json!({ "logged": true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MockComponent;
    use std::sync::Mutex as StdMutex;

    fn event(condition: FailsafeCondition, level: FailsafeLevel, component: &str) -> FailsafeEvent {
        FailsafeEvent::new(condition, level, "test", component, Value::Null)
    }

    #[test]
    fn test_matching_rules() {
        let noop = action_fn(|_e: FailsafeEvent| async move { Ok(Value::Null) });
        let warning = FailsafeAction::new(
            "restart",
            "Restart",
            vec![FailsafeCondition::ComponentFailure],
            FailsafeLevel::Warning,
            noop.clone(),
        );
        let catch_all = FailsafeAction::new(
            "log",
            "Log",
            FailsafeCondition::ALL.to_vec(),
            FailsafeLevel::Info,
            noop,
        );

        let warn_event = event(FailsafeCondition::ComponentFailure, FailsafeLevel::Warning, "x");
        let crit_event = event(FailsafeCondition::ComponentFailure, FailsafeLevel::Critical, "x");
        let sync_event = event(FailsafeCondition::SyncFailure, FailsafeLevel::Warning, "x");

        assert!(warning.matches(&warn_event));
        assert!(!warning.matches(&crit_event));
        assert!(!warning.matches(&sync_event));
        assert!(catch_all.matches(&crit_event));

        let mut disabled = catch_all.clone();
        disabled.enabled = false;
        assert!(!disabled.matches(&warn_event));
    }

    #[tokio::test]
    async fn test_restart_stops_then_starts() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let mut mock = MockComponent::new();
        mock.expect_name().return_const("engine".to_string());
        let stop_calls = calls.clone();
        mock.expect_stop().times(1).returning(move || {
            stop_calls.lock().unwrap().push("stop");
            Ok(())
        });
        let start_calls = calls.clone();
        mock.expect_start().times(1).returning(move || {
            start_calls.lock().unwrap().push("start");
            Ok(())
        });

        let registry = ComponentRegistry::new();
        registry.register(Arc::new(mock));
        let action = RestartComponent::new(registry, Duration::from_millis(1));

        let result = action
            .execute(&event(FailsafeCondition::ComponentFailure, FailsafeLevel::Warning, "engine"))
            .await;
        assert!(result.is_ok());
        assert_eq!(*calls.lock().unwrap(), vec!["stop", "start"]);

        let missing = action
            .execute(&event(FailsafeCondition::ComponentFailure, FailsafeLevel::Warning, "ghost"))
            .await;
        assert!(missing.unwrap_err().contains("not found"));
    }

    struct RecordingSink(StdMutex<Vec<String>>);

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn send_alert(&self, message: &str) -> std::result::Result<(), String> {
            self.0.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_alert_and_halt() {
        let slot: Arc<RwLock<Option<Arc<dyn AlertSink>>>> = Arc::new(RwLock::new(None));
        let alert = SendAlert::new(slot.clone());
        let e = event(FailsafeCondition::SyncFailure, FailsafeLevel::Emergency, "sync");

        assert_eq!(alert.execute(&e).await.unwrap(), json!({"alert_sent": false}));

        let sink = Arc::new(RecordingSink(StdMutex::new(Vec::new())));
        *slot.write().await = Some(sink.clone());
        assert_eq!(alert.execute(&e).await.unwrap(), json!({"alert_sent": true}));
        assert!(sink.0.lock().unwrap()[0].contains("Condition: sync_failure"));

        let flag = Arc::new(AtomicBool::new(false));
        SystemHalt::new(flag.clone()).execute(&e).await.unwrap();
        assert!(flag.load(Ordering::SeqCst));

        assert_eq!(LogEvent.execute(&e).await.unwrap(), json!({"logged": true}));
    }
}
