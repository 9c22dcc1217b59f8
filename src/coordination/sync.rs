//! Sync Manager
//!
//! Validates reported timestamps against the local clock, keeps a rolling
//! history of checks, tracks clock drift and fingerprints component state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::toggles::{gate_open, ToggleGate};
use crate::platform::{Component, HealthInfo};

/// Checks considered by [`SyncManager::is_synchronized`]
const RECENT_WINDOW: usize = 5;
/// Checks considered by the drift analysis averages
const ANALYSIS_WINDOW: usize = 20;

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum drift still considered synchronized (default: 5s)
    pub tolerance_secs: f64,
    /// Interval of the periodic drift check and of heartbeats (default: 30s)
    pub heartbeat_interval_secs: u64,
    /// Heartbeat silence before an alert is raised (default: 90s)
    pub heartbeat_timeout_secs: u64,
    /// Validation records kept (default: 100)
    pub history_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tolerance_secs: 5.0,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            history_limit: 100,
        }
    }
}

/// Overall sync state reported with each validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synchronized,
    Unsynchronized,
}

/// One timestamp validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRecord {
    pub timestamp: DateTime<Utc>,
    pub received_timestamp: DateTime<Utc>,
    pub drift: f64,
    pub synchronized: bool,
    pub tolerance: f64,
}

/// Result of [`SyncManager::validate_timestamp`]
#[derive(Debug, Clone, Serialize)]
pub struct SyncValidation {
    pub valid: bool,
    pub synchronized: bool,
    pub drift: f64,
    pub tolerance: f64,
    pub sync_status: SyncStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of one periodic drift check
#[derive(Debug, Clone, Serialize)]
pub struct TimeSyncResult {
    pub timestamp: DateTime<Utc>,
    pub reference_established: bool,
    pub corrected: bool,
    /// Wall clock elapsed minus monotonic elapsed since the reference
    pub drift: f64,
    pub offset: f64,
}

/// State fingerprint comparison
#[derive(Debug, Clone, Serialize)]
pub struct StateConsistency {
    pub component: String,
    pub version: u64,
    pub checksum: String,
    pub previous_checksum: Option<String>,
    pub state_changed: bool,
    pub consistent: bool,
    pub timestamp: DateTime<Utc>,
}

/// Emitted when a validation comes back unsynchronized or unparsable
#[derive(Debug, Clone)]
pub struct SyncAlert {
    pub drift: Option<f64>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftTrend {
    Increasing,
    Decreasing,
    Stable,
    InsufficientData,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftAnalysis {
    pub total_sync_checks: usize,
    pub recent_avg_drift: f64,
    pub recent_max_drift: f64,
    pub sync_failure_rate: f64,
    pub drift_trend: DriftTrend,
    pub recommendation: &'static str,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncMetrics {
    pub sync_checks: u64,
    pub sync_failures: u64,
    pub drift_corrections: u64,
    pub avg_drift: f64,
    pub max_drift: f64,
    pub last_sync_check: Option<DateTime<Utc>>,
}

impl SyncMetrics {
    fn failure_rate(&self) -> f64 {
        self.sync_failures as f64 / self.sync_checks.max(1) as f64 * 100.0
    }
}

struct SyncState {
    history: VecDeque<SyncRecord>,
    metrics: SyncMetrics,
    reference: Option<(DateTime<Utc>, Instant)>,
    time_offset: f64,
    checksums: HashMap<String, (u64, String)>,
}

struct SyncShared {
    config: SyncConfig,
    state: RwLock<SyncState>,
    running: AtomicBool,
    alert_tx: broadcast::Sender<SyncAlert>,
    gate: RwLock<Option<ToggleGate>>,
}

/// Clock and state synchronization checks
pub struct SyncManager {
    shared: Arc<SyncShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncManager {
    pub fn new(config: SyncConfig) -> Self {
        let (alert_tx, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(SyncShared {
                config,
                state: RwLock::new(SyncState {
                    history: VecDeque::new(),
                    metrics: SyncMetrics::default(),
                    reference: None,
                    time_offset: 0.0,
                    checksums: HashMap::new(),
                }),
                running: AtomicBool::new(false),
                alert_tx,
                gate: RwLock::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SyncConfig::default())
    }

    pub fn tolerance(&self) -> f64 {
        self.shared.config.tolerance_secs
    }

    /// Alerts for unsynchronized or unparsable timestamps
    pub fn subscribe(&self) -> broadcast::Receiver<SyncAlert> {
        self.shared.alert_tx.subscribe()
    }

    /// Pause the periodic check while the gate is closed
    pub async fn set_gate(&self, gate: ToggleGate) {
        *self.shared.gate.write().await = Some(gate);
    }

    /// Compare `timestamp` to the local clock and record the result
    pub async fn validate_timestamp(&self, timestamp: DateTime<Utc>) -> SyncValidation {
        self.shared.validate(timestamp, Utc::now()).await
    }

    /// Parse an RFC 3339 timestamp (a trailing `Z` is accepted) and validate it
    pub async fn validate_timestamp_str(&self, timestamp: &str) -> SyncValidation {
        match DateTime::parse_from_rfc3339(timestamp) {
            Ok(parsed) => self.validate_timestamp(parsed.with_timezone(&Utc)).await,
            Err(e) => {
                let message = format!("invalid timestamp '{}': {}", timestamp, e);
                self.shared.state.write().await.metrics.sync_failures += 1;
                error!("Timestamp validation failed: {}", message);
                let _ = self.shared.alert_tx.send(SyncAlert {
                    drift: None,
                    message: message.clone(),
                });
                SyncValidation {
                    valid: false,
                    synchronized: false,
                    drift: 0.0,
                    tolerance: self.tolerance(),
                    sync_status: SyncStatus::Unsynchronized,
                    timestamp: Utc::now(),
                    error: Some(message),
                }
            }
        }
    }

    /// Majority of the last five checks synchronized; false with no history
    pub async fn is_synchronized(&self) -> bool {
        is_synchronized(&self.shared.state.read().await.history)
    }

    /// One drift check against the reference captured on the first run
    pub async fn perform_time_sync(&self) -> TimeSyncResult {
        self.shared.perform_time_sync().await
    }

    /// Local time adjusted by the last recorded offset
    pub async fn get_corrected_time(&self) -> DateTime<Utc> {
        let offset = self.shared.state.read().await.time_offset;
        Utc::now() - chrono::Duration::milliseconds((offset * 1000.0) as i64)
    }

    /// Fingerprint `state` and report whether it changed since the last call
    pub async fn check_state_consistency(&self, component: &str, state: &Value) -> StateConsistency {
        // serde_json maps are key-sorted, so the encoding is canonical
        let checksum = hex::encode(Sha256::digest(state.to_string().as_bytes()));

        let mut guard = self.shared.state.write().await;
        let previous = guard.checksums.get(component).cloned();
        let version = previous.as_ref().map(|(v, _)| *v).unwrap_or(0) + 1;
        guard
            .checksums
            .insert(component.to_string(), (version, checksum.clone()));
        drop(guard);

        let previous_checksum = previous.map(|(_, c)| c);
        let state_changed = previous_checksum
            .as_ref()
            .map(|prev| *prev != checksum)
            .unwrap_or(false);
        if state_changed {
            info!("State change detected for {}", component);
        }

        StateConsistency {
            component: component.to_string(),
            version,
            checksum,
            previous_checksum,
            state_changed,
            consistent: true,
            timestamp: Utc::now(),
        }
    }

    pub async fn get_metrics(&self) -> SyncMetrics {
        self.shared.state.read().await.metrics.clone()
    }

    pub async fn get_history(&self) -> Vec<SyncRecord> {
        self.shared.state.read().await.history.iter().cloned().collect()
    }

    /// `None` until at least one validation has been recorded
    pub async fn get_drift_analysis(&self) -> Option<DriftAnalysis> {
        let state = self.shared.state.read().await;
        if state.history.is_empty() {
            return None;
        }

        let drifts: Vec<f64> = state.history.iter().map(|r| r.drift).collect();
        let recent = &drifts[drifts.len().saturating_sub(ANALYSIS_WINDOW)..];
        let recent_avg = recent.iter().sum::<f64>() / recent.len() as f64;
        let recent_max = recent.iter().cloned().fold(0.0, f64::max);

        Some(DriftAnalysis {
            total_sync_checks: drifts.len(),
            recent_avg_drift: recent_avg,
            recent_max_drift: recent_max,
            sync_failure_rate: state.metrics.failure_rate(),
            drift_trend: drift_trend(&drifts),
            recommendation: recommendation(&state.metrics, self.tolerance()),
        })
    }

    pub async fn get_status(&self) -> Value {
        let state = self.shared.state.read().await;
        json!({
            "running": self.shared.running.load(Ordering::SeqCst),
            "synchronized": is_synchronized(&state.history),
            "tolerance": self.tolerance(),
            "time_offset": state.time_offset,
            "reference_time": state.reference.map(|(wall, _)| wall),
            "history_size": state.history.len(),
            "tracked_components": state.checksums.len(),
            "metrics": state.metrics,
        })
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Start the periodic drift check
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let period = Duration::from_secs(shared.config.heartbeat_interval_secs.max(1));
        *worker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            while shared.running.load(Ordering::SeqCst) {
                interval.tick().await;
                if !gate_open(&*shared.gate.read().await).await {
                    debug!("Sync check skipped: gate closed");
                    continue;
                }
                shared.perform_time_sync().await;
            }
        }));
        info!("Sync manager started");
    }

    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().await.take() {
            handle.abort();
            match handle.await {
                Err(e) if !e.is_cancelled() => error!("Sync loop failed: {}", e),
                _ => {}
            }
        }
        info!("Sync manager stopped");
    }
}

impl SyncShared {
    async fn validate(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> SyncValidation {
        let tolerance = self.config.tolerance_secs;
        let drift = (now - timestamp).num_milliseconds().abs() as f64 / 1000.0;
        let synchronized = drift <= tolerance;

        let mut state = self.state.write().await;
        state.history.push_back(SyncRecord {
            timestamp: now,
            received_timestamp: timestamp,
            drift,
            synchronized,
            tolerance,
        });
        while state.history.len() > self.config.history_limit {
            state.history.pop_front();
        }

        let metrics = &mut state.metrics;
        metrics.sync_checks += 1;
        metrics.avg_drift = if metrics.sync_checks == 1 {
            drift
        } else {
            (metrics.avg_drift + drift) / 2.0
        };
        metrics.max_drift = metrics.max_drift.max(drift);
        metrics.last_sync_check = Some(now);
        if !synchronized {
            metrics.sync_failures += 1;
        }
        let overall = is_synchronized(&state.history);
        drop(state);

        if !synchronized {
            warn!("Timestamp drift {:.3}s exceeds tolerance {}s", drift, tolerance);
            let _ = self.alert_tx.send(SyncAlert {
                drift: Some(drift),
                message: format!("timestamp drift {:.3}s exceeds tolerance {}s", drift, tolerance),
            });
        }

        SyncValidation {
            valid: true,
            synchronized,
            drift,
            tolerance,
            sync_status: if overall {
                SyncStatus::Synchronized
            } else {
                SyncStatus::Unsynchronized
            },
            timestamp: now,
            error: None,
        }
    }

    async fn perform_time_sync(&self) -> TimeSyncResult {
        let now = Utc::now();
        let mono = Instant::now();
        let mut state = self.state.write().await;

        let Some((wall_ref, mono_ref)) = state.reference else {
            state.reference = Some((now, mono));
            debug!("Time sync reference established at {}", now);
            return TimeSyncResult {
                timestamp: now,
                reference_established: true,
                corrected: false,
                drift: 0.0,
                offset: state.time_offset,
            };
        };

        let wall_elapsed = (now - wall_ref).num_milliseconds() as f64 / 1000.0;
        let mono_elapsed = mono.duration_since(mono_ref).as_secs_f64();
        let drift = wall_elapsed - mono_elapsed;

        let corrected = drift.abs() > self.config.tolerance_secs;
        if corrected {
            warn!("Clock drift detected: {:.3}s", drift);
            state.time_offset = drift;
            state.metrics.drift_corrections += 1;
        }

        TimeSyncResult {
            timestamp: now,
            reference_established: false,
            corrected,
            drift,
            offset: state.time_offset,
        }
    }
}

fn is_synchronized(history: &VecDeque<SyncRecord>) -> bool {
    if history.is_empty() {
        return false;
    }
    let recent: Vec<&SyncRecord> = history.iter().rev().take(RECENT_WINDOW).collect();
    let synchronized = recent.iter().filter(|r| r.synchronized).count();
    synchronized * 2 >= recent.len()
}

/// Compares the older and newer halves of the last ten drifts
fn drift_trend(drifts: &[f64]) -> DriftTrend {
    if drifts.len() < 5 {
        return DriftTrend::InsufficientData;
    }
    let recent = &drifts[drifts.len().saturating_sub(10)..];
    let (early, late) = recent.split_at(recent.len() / 2);
    let early_avg = early.iter().sum::<f64>() / early.len() as f64;
    let late_avg = late.iter().sum::<f64>() / late.len() as f64;

    if late_avg > early_avg * 1.2 {
        DriftTrend::Increasing
    } else if late_avg < early_avg * 0.8 {
        DriftTrend::Decreasing
    } else {
        DriftTrend::Stable
    }
}

fn recommendation(metrics: &SyncMetrics, tolerance: f64) -> &'static str {
    let failure_rate = metrics.failure_rate();
    if failure_rate > 50.0 {
        "critical_sync_issues_check_time_source"
    } else if failure_rate > 20.0 {
        "frequent_sync_failures_monitor_closely"
    } else if metrics.max_drift > tolerance * 2.0 {
        "large_drift_detected_investigate_time_source"
    } else {
        "sync_operating_normally"
    }
}

#[async_trait]
impl Component for SyncManager {
    fn name(&self) -> String {
        "sync_manager".to_string()
    }

    async fn status(&self) -> Option<Value> {
        Some(self.get_status().await)
    }

    async fn health_info(&self) -> Option<HealthInfo> {
        let state = self.shared.state.read().await;
        // Cold start is not a failure
        let healthy = state.history.is_empty() || is_synchronized(&state.history);
        let info = if healthy {
            HealthInfo::healthy()
        } else {
            HealthInfo::unhealthy("recent timestamps out of tolerance")
        };
        Some(info.with_details(json!({
            "max_drift": state.metrics.max_drift,
            "sync_failures": state.metrics.sync_failures,
        })))
    }

    fn is_running(&self) -> Option<bool> {
        Some(SyncManager::is_running(self))
    }

    async fn start(&self) -> std::result::Result<(), String> {
        SyncManager::start(self).await;
        Ok(())
    }

    async fn stop(&self) -> std::result::Result<(), String> {
        SyncManager::stop(self).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ten_seconds_behind_is_unsynchronized() {
        let sync = SyncManager::with_defaults();
        let result = sync
            .validate_timestamp(Utc::now() - chrono::Duration::seconds(10))
            .await;

        assert!(result.valid);
        assert!(!result.synchronized);
        assert!((result.drift - 10.0).abs() < 0.5);
        assert_eq!(result.tolerance, 5.0);
        assert_eq!(sync.get_metrics().await.sync_failures, 1);
    }

    #[tokio::test]
    async fn test_future_timestamp_drift_is_absolute() {
        let sync = SyncManager::with_defaults();
        let result = sync
            .validate_timestamp(Utc::now() + chrono::Duration::seconds(3))
            .await;
        assert!(result.synchronized);
        assert!(result.drift > 2.0 && result.drift < 3.5);
    }

    #[tokio::test]
    async fn test_cold_start_is_unsynchronized() {
        let sync = SyncManager::with_defaults();
        assert!(!sync.is_synchronized().await);
        assert!(sync.get_drift_analysis().await.is_none());
    }

    #[tokio::test]
    async fn test_majority_of_last_five() {
        let sync = SyncManager::with_defaults();
        let stale = Utc::now() - chrono::Duration::seconds(60);

        for _ in 0..3 {
            sync.validate_timestamp(Utc::now()).await;
        }
        for _ in 0..2 {
            sync.validate_timestamp(stale).await;
        }
        assert!(sync.is_synchronized().await);

        sync.validate_timestamp(stale).await;
        assert!(!sync.is_synchronized().await);
    }

    #[tokio::test]
    async fn test_history_bounded() {
        let sync = SyncManager::new(SyncConfig {
            history_limit: 3,
            ..Default::default()
        });
        for _ in 0..5 {
            sync.validate_timestamp(Utc::now()).await;
        }
        assert_eq!(sync.get_history().await.len(), 3);
        assert_eq!(sync.get_metrics().await.sync_checks, 5);
    }

    #[tokio::test]
    async fn test_parse_failure_counts() {
        let sync = SyncManager::with_defaults();
        let mut alerts = sync.subscribe();

        let ok = sync
            .validate_timestamp_str(&Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .await;
        assert!(ok.valid);

        let bad = sync.validate_timestamp_str("yesterday-ish").await;
        assert!(!bad.valid);
        assert!(bad.error.is_some());
        assert_eq!(sync.get_metrics().await.sync_failures, 1);
        assert!(alerts.try_recv().unwrap().drift.is_none());
    }

    #[tokio::test]
    async fn test_state_consistency_detects_change() {
        let sync = SyncManager::with_defaults();
        let first = sync
            .check_state_consistency("engine", &json!({ "b": 1, "a": 2 }))
            .await;
        assert_eq!(first.version, 1);
        assert!(!first.state_changed);
        assert!(first.previous_checksum.is_none());

        let same = sync
            .check_state_consistency("engine", &json!({ "a": 2, "b": 1 }))
            .await;
        assert_eq!(same.version, 2);
        assert!(!same.state_changed);
        assert_eq!(same.checksum, first.checksum);

        let changed = sync
            .check_state_consistency("engine", &json!({ "a": 3, "b": 1 }))
            .await;
        assert!(changed.state_changed);
        assert_eq!(changed.previous_checksum, Some(first.checksum));
    }

    #[tokio::test]
    async fn test_time_sync_reference_then_steady() {
        let sync = SyncManager::with_defaults();
        let first = sync.perform_time_sync().await;
        assert!(first.reference_established);

        let second = sync.perform_time_sync().await;
        assert!(!second.reference_established);
        assert!(!second.corrected);
        assert_eq!(sync.get_metrics().await.drift_corrections, 0);

        let corrected = sync.get_corrected_time().await;
        assert!((Utc::now() - corrected).num_seconds().abs() < 1);
    }

    #[test]
    fn test_drift_trend() {
        assert_eq!(drift_trend(&[1.0, 1.0]), DriftTrend::InsufficientData);
        assert_eq!(
            drift_trend(&[1.0, 1.0, 1.0, 1.0, 1.0, 3.0, 3.0, 3.0, 3.0, 3.0]),
            DriftTrend::Increasing
        );
        assert_eq!(
            drift_trend(&[3.0, 3.0, 3.0, 3.0, 3.0, 1.0, 1.0, 1.0, 1.0, 1.0]),
            DriftTrend::Decreasing
        );
        assert_eq!(drift_trend(&[2.0; 7]), DriftTrend::Stable);
    }

    #[tokio::test]
    async fn test_drift_analysis_recommendation() {
        let sync = SyncManager::with_defaults();
        sync.validate_timestamp(Utc::now() - chrono::Duration::seconds(30))
            .await;
        sync.validate_timestamp(Utc::now()).await;

        let analysis = sync.get_drift_analysis().await.unwrap();
        assert_eq!(analysis.total_sync_checks, 2);
        assert_eq!(analysis.sync_failure_rate, 50.0);
        assert_eq!(analysis.recommendation, "frequent_sync_failures_monitor_closely");
        assert_eq!(analysis.drift_trend, DriftTrend::InsufficientData);
    }
}
