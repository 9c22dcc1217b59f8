//! Heartbeat System
//!
//! Emits a periodic beat describing the plane, stamps it with the sync
//! manager's corrected clock and validates it, hands it to observers, and
//! raises a silence alert once no beat has succeeded for the configured
//! timeout. Beats produced while the plane is degraded are buffered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::sync::{SyncConfig, SyncManager};
use super::toggles::{gate_open, ToggleGate};
use crate::persistence::BufferSystem;
use crate::platform::{Component, ComponentRegistry, HealthInfo};

pub const HEARTBEAT_COMPONENT: &str = "heartbeat_system";

/// Overall plane state carried by a beat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BeatStatus {
    Active,
    Degraded,
}

/// One heartbeat
#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub status: BeatStatus,
    pub synchronized: bool,
    pub drift: f64,
    pub success_rate: f64,
    pub components: BTreeMap<String, String>,
}

/// Raised when no beat has succeeded within the timeout
#[derive(Debug, Clone)]
pub struct HeartbeatAlert {
    pub silent_secs: i64,
    pub last_success: Option<DateTime<Utc>>,
    pub message: String,
}

/// Receives every beat. Rejecting a beat marks it failed.
#[async_trait]
pub trait HeartbeatObserver: Send + Sync {
    async fn on_beat(&self, beat: &Heartbeat) -> std::result::Result<(), String>;

    async fn on_failure(&self, _beat: &Heartbeat, _reason: &str) {}
}

struct ObserverFn<F>(F);

#[async_trait]
impl<F, Fut> HeartbeatObserver for ObserverFn<F>
where
    F: Fn(Heartbeat) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
{
    async fn on_beat(&self, beat: &Heartbeat) -> std::result::Result<(), String> {
        (self.0)(beat.clone()).await
    }
}

/// Wrap an async closure as a beat observer
pub fn observer_fn<F, Fut>(f: F) -> Arc<dyn HeartbeatObserver>
where
    F: Fn(Heartbeat) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
{
    Arc::new(ObserverFn(f))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HeartbeatMetrics {
    pub total_heartbeats: u64,
    pub successful_heartbeats: u64,
    pub failed_heartbeats: u64,
    pub buffered_heartbeats: u64,
    pub silence_alerts: u64,
    pub avg_response_ms: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

impl HeartbeatMetrics {
    /// Percentage of successful beats; 100 before the first beat
    pub fn success_rate(&self) -> f64 {
        if self.total_heartbeats == 0 {
            return 100.0;
        }
        self.successful_heartbeats as f64 / self.total_heartbeats as f64 * 100.0
    }
}

struct HeartbeatState {
    sequence: u64,
    metrics: HeartbeatMetrics,
    last_beat: Option<Heartbeat>,
    /// Start of the current silence: last success, start, or gate reopening
    silent_since: DateTime<Utc>,
    alerted_at: Option<DateTime<Utc>>,
}

struct HeartbeatShared {
    config: SyncConfig,
    sync: Arc<SyncManager>,
    registry: ComponentRegistry,
    buffer: RwLock<Option<Arc<BufferSystem>>>,
    observers: RwLock<Vec<Arc<dyn HeartbeatObserver>>>,
    state: RwLock<HeartbeatState>,
    running: AtomicBool,
    alert_tx: broadcast::Sender<HeartbeatAlert>,
    gate: RwLock<Option<ToggleGate>>,
}

/// Periodic heartbeat producer
pub struct HeartbeatSystem {
    shared: Arc<HeartbeatShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatSystem {
    pub fn new(config: SyncConfig, sync: Arc<SyncManager>, registry: ComponentRegistry) -> Self {
        let (alert_tx, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(HeartbeatShared {
                config,
                sync,
                registry,
                buffer: RwLock::new(None),
                observers: RwLock::new(Vec::new()),
                state: RwLock::new(HeartbeatState {
                    sequence: 0,
                    metrics: HeartbeatMetrics::default(),
                    last_beat: None,
                    silent_since: Utc::now(),
                    alerted_at: None,
                }),
                running: AtomicBool::new(false),
                alert_tx,
                gate: RwLock::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Silence alerts
    pub fn subscribe(&self) -> broadcast::Receiver<HeartbeatAlert> {
        self.shared.alert_tx.subscribe()
    }

    /// Pause beats while the gate is closed
    pub async fn set_gate(&self, gate: ToggleGate) {
        *self.shared.gate.write().await = Some(gate);
    }

    /// Buffer beats produced while degraded
    pub async fn set_buffer(&self, buffer: Arc<BufferSystem>) {
        *self.shared.buffer.write().await = Some(buffer);
    }

    pub async fn add_observer(&self, observer: Arc<dyn HeartbeatObserver>) {
        self.shared.observers.write().await.push(observer);
    }

    /// Produce one beat now; returns whether it succeeded
    pub async fn send_heartbeat(&self) -> bool {
        self.shared.send_heartbeat().await
    }

    pub async fn get_metrics(&self) -> HeartbeatMetrics {
        self.shared.state.read().await.metrics.clone()
    }

    pub async fn last_heartbeat(&self) -> Option<Heartbeat> {
        self.shared.state.read().await.last_beat.clone()
    }

    pub async fn get_status(&self) -> Value {
        let state = self.shared.state.read().await;
        json!({
            "running": self.is_running(),
            "sequence": state.sequence,
            "success_rate": state.metrics.success_rate(),
            "silent_since": state.silent_since,
            "last_heartbeat": state.last_beat,
            "observers": self.shared.observers.read().await.len(),
            "metrics": state.metrics,
        })
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }
        {
            let mut state = self.shared.state.write().await;
            let now = Utc::now();
            state.silent_since = now;
            state.alerted_at = None;
            state.metrics.started_at = Some(now);
        }
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let period = Duration::from_secs(shared.config.heartbeat_interval_secs.max(1));
        *worker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            while shared.running.load(Ordering::SeqCst) {
                interval.tick().await;
                if !gate_open(&*shared.gate.read().await).await {
                    debug!("Heartbeat skipped: gate closed");
                    let mut state = shared.state.write().await;
                    state.silent_since = Utc::now();
                    state.alerted_at = None;
                    continue;
                }
                shared.send_heartbeat().await;
                shared.check_silence(Utc::now()).await;
            }
        }));
        info!("Heartbeat system started");
    }

    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().await.take() {
            handle.abort();
            match handle.await {
                Err(e) if !e.is_cancelled() => error!("Heartbeat loop failed: {}", e),
                _ => {}
            }
        }
        info!("Heartbeat system stopped");
    }
}

impl HeartbeatShared {
    async fn component_statuses(&self) -> BTreeMap<String, String> {
        let mut statuses = BTreeMap::new();
        for name in self.registry.names() {
            if name == HEARTBEAT_COMPONENT {
                continue;
            }
            let Some(component) = self.registry.get(&name) else {
                continue;
            };
            let status = match component.health_info().await {
                Some(health) if health.healthy => "healthy",
                Some(_) => "unhealthy",
                None => match component.is_running() {
                    Some(true) => "running",
                    Some(false) => "stopped",
                    None => "unknown",
                },
            };
            statuses.insert(name, status.to_string());
        }
        statuses
    }

    async fn send_heartbeat(&self) -> bool {
        let started = Instant::now();
        let timestamp = self.sync.get_corrected_time().await;
        let validation = self.sync.validate_timestamp(timestamp).await;
        let components = self.component_statuses().await;
        let degraded = !validation.synchronized
            || components
                .values()
                .any(|s| s == "unhealthy" || s == "stopped");

        let (sequence, success_rate) = {
            let state = self.state.read().await;
            (state.sequence, state.metrics.success_rate())
        };
        let beat = Heartbeat {
            sequence,
            timestamp,
            status: if degraded {
                BeatStatus::Degraded
            } else {
                BeatStatus::Active
            },
            synchronized: validation.synchronized,
            drift: validation.drift,
            success_rate,
            components,
        };

        let mut failure = if validation.synchronized {
            None
        } else {
            Some(format!(
                "timestamp drift {:.3}s exceeds tolerance {}s",
                validation.drift, validation.tolerance
            ))
        };
        let observers = self.observers.read().await.clone();
        for observer in &observers {
            if let Err(e) = observer.on_beat(&beat).await {
                warn!("Heartbeat {} rejected by observer: {}", sequence, e);
                if failure.is_none() {
                    failure = Some(e);
                }
            }
        }
        if let Some(reason) = &failure {
            for observer in &observers {
                observer.on_failure(&beat, reason).await;
            }
        }

        let buffered = if degraded || failure.is_some() {
            self.buffer_beat(&beat).await
        } else {
            false
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut state = self.state.write().await;
        let state = &mut *state;
        let metrics = &mut state.metrics;
        metrics.total_heartbeats += 1;
        metrics.avg_response_ms = if metrics.total_heartbeats == 1 {
            elapsed_ms
        } else {
            (metrics.avg_response_ms + elapsed_ms) / 2.0
        };
        if buffered {
            metrics.buffered_heartbeats += 1;
        }
        let succeeded = failure.is_none();
        match failure {
            None => {
                metrics.successful_heartbeats += 1;
                metrics.last_success = Some(beat.timestamp);
                state.sequence += 1;
                state.silent_since = Utc::now();
                state.alerted_at = None;
                debug!("Heartbeat {} sent ({:?})", sequence, beat.status);
            }
            Some(reason) => {
                metrics.failed_heartbeats += 1;
                error!("Heartbeat {} failed: {}", sequence, reason);
            }
        }
        state.last_beat = Some(beat);
        succeeded
    }

    async fn buffer_beat(&self, beat: &Heartbeat) -> bool {
        let Some(buffer) = self.buffer.read().await.clone() else {
            return false;
        };
        let data = match serde_json::to_value(beat) {
            Ok(data) => data,
            Err(e) => {
                error!("Heartbeat {} not serializable: {}", beat.sequence, e);
                return false;
            }
        };
        match buffer.add_heartbeat(data).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Heartbeat {} not buffered: {}", beat.sequence, e);
                false
            }
        }
    }

    /// Alert once per timeout span of silence
    async fn check_silence(&self, now: DateTime<Utc>) -> Option<HeartbeatAlert> {
        let timeout = crate::config::window_duration(self.config.heartbeat_timeout_secs);
        let alert = {
            let mut state = self.state.write().await;
            let since = state.alerted_at.unwrap_or(state.silent_since);
            if now - since < timeout {
                return None;
            }
            state.alerted_at = Some(now);
            state.metrics.silence_alerts += 1;
            let silent_secs = (now - state.silent_since).num_seconds();
            HeartbeatAlert {
                silent_secs,
                last_success: state.metrics.last_success,
                message: format!("no successful heartbeat for {}s", silent_secs),
            }
        };
        warn!("Heartbeat silence: {}", alert.message);
        let _ = self.alert_tx.send(alert.clone());
        Some(alert)
    }
}

#[async_trait]
impl Component for HeartbeatSystem {
    fn name(&self) -> String {
        HEARTBEAT_COMPONENT.to_string()
    }

    async fn status(&self) -> Option<Value> {
        Some(self.get_status().await)
    }

    async fn health_info(&self) -> Option<HealthInfo> {
        if !self.is_running() {
            return Some(HealthInfo::unhealthy("heartbeat loop not running"));
        }
        let state = self.shared.state.read().await;
        let silent_secs = (Utc::now() - state.silent_since).num_seconds();
        let limit = self.shared.config.heartbeat_timeout_secs.saturating_mul(2);
        let info = if u64::try_from(silent_secs).unwrap_or(0) < limit {
            HealthInfo::healthy()
        } else {
            HealthInfo::unhealthy("heartbeat silent for twice the timeout")
        };
        Some(info.with_details(json!({
            "silent_secs": silent_secs,
            "success_rate": state.metrics.success_rate(),
            "failed_heartbeats": state.metrics.failed_heartbeats,
        })))
    }

    fn is_running(&self) -> Option<bool> {
        Some(HeartbeatSystem::is_running(self))
    }

    async fn start(&self) -> std::result::Result<(), String> {
        HeartbeatSystem::start(self).await;
        Ok(())
    }

    async fn stop(&self) -> std::result::Result<(), String> {
        HeartbeatSystem::stop(self).await;
        Ok(())
    }
}
