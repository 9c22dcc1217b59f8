//! Buffer System
//!
//! Priority-ordered holding area for work that cannot be handled right away.
//! A processing loop drains pending entries through per-type processors, a
//! flush loop snapshots the buffer to disk and a cleanup loop reclaims
//! processed, abandoned and expired entries.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::entry::{processing_order, retention_order, BufferEntry, BufferType};
use super::processor::{CommandReplayProcessor, EntryProcessor, LoggingProcessor, ProcessResult};
use super::snapshot::{load_snapshot, save_snapshot, BufferSnapshot};
use crate::error::{Result, SwitchboardError};
use crate::platform::{CommandRouter, Component, HealthInfo};

/// Configuration for the buffer system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum entries held (default: 1000)
    pub max_size: usize,
    /// Interval between snapshot flushes (default: 60s)
    pub flush_interval_secs: u64,
    /// Interval between cleanup passes (default: 60s)
    pub cleanup_interval_secs: u64,
    /// Processing attempts before an entry is abandoned (default: 3)
    pub max_retries: u32,
    /// Snapshot file (default: data/buffer.json)
    pub snapshot_path: String,
    /// Sleep when nothing is pending (default: 1s)
    pub idle_poll_ms: u64,
    /// Pause between processed entries (default: 100ms)
    pub entry_pause_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            flush_interval_secs: 60,
            cleanup_interval_secs: 60,
            max_retries: 3,
            snapshot_path: "data/buffer.json".to_string(),
            idle_poll_ms: 1000,
            entry_pause_ms: 100,
        }
    }
}

/// Buffer statistics, persisted with each snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferMetrics {
    pub entries_added: u64,
    pub entries_processed: u64,
    pub entries_failed: u64,
    pub entries_expired: u64,
    /// Pending entries dropped to bring a near-full buffer back to 80%
    pub entries_evicted: u64,
    pub buffer_flushes: u64,
    pub file_saves: u64,
    pub file_loads: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferStatus {
    pub running: bool,
    pub processing_enabled: bool,
    pub size: usize,
    pub max_size: usize,
    pub entries_by_type: BTreeMap<String, usize>,
    pub entries_by_status: BTreeMap<String, usize>,
    pub metrics: BufferMetrics,
    pub snapshot_path: String,
}

struct BufferShared {
    config: BufferConfig,
    /// Kept in processing order
    entries: RwLock<Vec<BufferEntry>>,
    metrics: RwLock<BufferMetrics>,
    processors: RwLock<HashMap<BufferType, Arc<dyn EntryProcessor>>>,
    default_processor: Arc<dyn EntryProcessor>,
    running: AtomicBool,
    processing_enabled: AtomicBool,
    wake: Notify,
    /// Serializes snapshot writes; they share one temp file
    save_lock: Mutex<()>,
}

/// Durable, priority-ordered buffer of deferred work
pub struct BufferSystem {
    shared: Arc<BufferShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BufferSystem {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            shared: Arc::new(BufferShared {
                config,
                entries: RwLock::new(Vec::new()),
                metrics: RwLock::new(BufferMetrics::default()),
                processors: RwLock::new(HashMap::new()),
                default_processor: Arc::new(LoggingProcessor),
                running: AtomicBool::new(false),
                processing_enabled: AtomicBool::new(true),
                wake: Notify::new(),
                save_lock: Mutex::new(()),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BufferConfig::default())
    }

    /// Replay command entries through `router`
    pub async fn set_command_router(&self, router: Arc<CommandRouter>) {
        self.register_processor(
            BufferType::Command,
            Arc::new(CommandReplayProcessor::new(router)),
        )
        .await;
    }

    pub async fn register_processor(&self, buffer_type: BufferType, processor: Arc<dyn EntryProcessor>) {
        self.shared
            .processors
            .write()
            .await
            .insert(buffer_type, processor);
        debug!("Registered buffer processor for {}", buffer_type);
    }

    /// Insert an entry in priority order. When the buffer is at capacity an
    /// eviction pass runs first; if it frees nothing the add fails.
    pub async fn add_entry(
        &self,
        buffer_type: BufferType,
        data: Value,
        priority: i32,
        ttl: Option<Duration>,
    ) -> Result<String> {
        let ttl = ttl
            .map(chrono::Duration::from_std)
            .transpose()
            .map_err(|e| SwitchboardError::Validation(format!("invalid ttl: {}", e)))?;
        let entry = BufferEntry::new(buffer_type, data, priority, ttl, self.shared.config.max_retries);
        let entry_id = entry.entry_id.clone();
        let max_size = self.shared.config.max_size;

        {
            let mut entries = self.shared.entries.write().await;
            if entries.len() >= max_size {
                self.shared.evict(&mut entries).await;
                if entries.len() >= max_size {
                    warn!("Buffer full, rejected {} entry", buffer_type);
                    return Err(SwitchboardError::BufferFull { capacity: max_size });
                }
            }
            let index =
                entries.partition_point(|e| processing_order(e, &entry) != CmpOrdering::Greater);
            entries.insert(index, entry);
        }

        self.shared.metrics.write().await.entries_added += 1;
        self.shared.wake.notify_one();
        debug!("Added buffer entry: {} ({})", entry_id, buffer_type);
        Ok(entry_id)
    }

    /// Buffer a command for later delivery (priority 0, expires after 1h)
    pub async fn add_command(
        &self,
        command_type: &str,
        target: &str,
        payload: Value,
        source: &str,
    ) -> Result<String> {
        let data = json!({
            "command_type": command_type,
            "target": target,
            "payload": payload,
            "source": source,
        });
        self.add_entry(BufferType::Command, data, 0, Some(Duration::from_secs(3600)))
            .await
    }

    pub async fn add_sync_data(&self, data: Value) -> Result<String> {
        self.add_entry(BufferType::SyncData, data, 5, None).await
    }

    pub async fn add_heartbeat(&self, data: Value) -> Result<String> {
        self.add_entry(BufferType::Heartbeat, data, 3, Some(Duration::from_secs(300)))
            .await
    }

    pub async fn add_event(&self, data: Value) -> Result<String> {
        self.add_entry(BufferType::Event, data, 2, None).await
    }

    pub async fn add_metric(&self, data: Value) -> Result<String> {
        self.add_entry(BufferType::Metric, data, 1, Some(Duration::from_secs(1800)))
            .await
    }

    /// Process the first pending entry; false when nothing was pending
    pub async fn process_next(&self) -> bool {
        self.shared.process_next().await
    }

    /// Drop processed, abandoned and expired entries; returns how many went
    pub async fn cleanup(&self) -> usize {
        let mut entries = self.shared.entries.write().await;
        self.shared.evict(&mut entries).await
    }

    /// Snapshot to disk, then clean up
    pub async fn flush(&self) -> Result<()> {
        self.shared.flush().await
    }

    pub async fn save_to_file(&self) -> Result<()> {
        self.shared.save_to_file().await
    }

    /// Replace the buffer with the snapshot on disk, skipping expired entries.
    /// Returns the number of entries restored.
    pub async fn load_from_file(&self) -> Result<usize> {
        self.shared.load_from_file().await
    }

    pub fn enable_processing(&self) {
        self.shared.processing_enabled.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
        info!("Buffer processing enabled");
    }

    pub fn disable_processing(&self) {
        self.shared.processing_enabled.store(false, Ordering::SeqCst);
        info!("Buffer processing disabled");
    }

    pub async fn clear_buffer(&self) -> usize {
        let mut entries = self.shared.entries.write().await;
        let count = entries.len();
        entries.clear();
        info!("Cleared {} buffer entries", count);
        count
    }

    pub async fn len(&self) -> usize {
        self.shared.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.shared.entries.read().await.is_empty()
    }

    pub async fn get_entry(&self, entry_id: &str) -> Option<BufferEntry> {
        self.shared
            .entries
            .read()
            .await
            .iter()
            .find(|e| e.entry_id == entry_id)
            .cloned()
    }

    /// Entries in processing order, optionally filtered by type
    pub async fn get_buffer_entries(&self, buffer_type: Option<BufferType>, limit: usize) -> Vec<BufferEntry> {
        self.shared
            .entries
            .read()
            .await
            .iter()
            .filter(|e| buffer_type.map(|t| e.buffer_type == t).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn get_metrics(&self) -> BufferMetrics {
        self.shared.metrics.read().await.clone()
    }

    pub async fn get_status(&self) -> BufferStatus {
        let now = Utc::now();
        let (size, entries_by_type, entries_by_status) = {
            let entries = self.shared.entries.read().await;
            let mut by_type = BTreeMap::new();
            let mut by_status = BTreeMap::new();
            for entry in entries.iter() {
                *by_type.entry(entry.buffer_type.to_string()).or_insert(0) += 1;
                let status = serde_json::to_value(entry.status_at(now))
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default();
                *by_status.entry(status).or_insert(0) += 1;
            }
            (entries.len(), by_type, by_status)
        };

        BufferStatus {
            running: self.is_running(),
            processing_enabled: self.shared.processing_enabled.load(Ordering::SeqCst),
            size,
            max_size: self.shared.config.max_size,
            entries_by_type,
            entries_by_status,
            metrics: self.get_metrics().await,
            snapshot_path: self.shared.config.snapshot_path.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Restore the snapshot and start the processing, flush and cleanup loops
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }

        if let Err(e) = self.shared.load_from_file().await {
            error!("Failed to load buffer snapshot, starting empty: {}", e);
        }
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        workers.push(tokio::spawn(async move {
            let pause = Duration::from_millis(shared.config.entry_pause_ms);
            let idle = Duration::from_millis(shared.config.idle_poll_ms);
            while shared.running.load(Ordering::SeqCst) {
                if shared.process_next().await {
                    tokio::time::sleep(pause).await;
                } else {
                    tokio::select! {
                        _ = shared.wake.notified() => {}
                        _ = tokio::time::sleep(idle) => {}
                    }
                }
            }
        }));

        let shared = self.shared.clone();
        workers.push(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(shared.config.flush_interval_secs.max(1)));
            interval.tick().await;
            while shared.running.load(Ordering::SeqCst) {
                interval.tick().await;
                if let Err(e) = shared.flush().await {
                    error!("Buffer flush failed: {}", e);
                }
            }
        }));

        let shared = self.shared.clone();
        workers.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                shared.config.cleanup_interval_secs.max(1),
            ));
            interval.tick().await;
            while shared.running.load(Ordering::SeqCst) {
                interval.tick().await;
                let mut entries = shared.entries.write().await;
                shared.evict(&mut entries).await;
            }
        }));

        info!("Buffer system started");
    }

    /// Stop all loops and write a final snapshot
    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);

        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            handle.abort();
            match handle.await {
                Err(e) if !e.is_cancelled() => error!("Buffer loop failed: {}", e),
                _ => {}
            }
        }

        if let Err(e) = self.shared.save_to_file().await {
            error!("Failed to save buffer snapshot on stop: {}", e);
        }
        info!("Buffer system stopped");
    }
}

impl BufferShared {
    fn snapshot_path(&self) -> PathBuf {
        PathBuf::from(&self.config.snapshot_path)
    }

    /// Drop finished and expired entries; if still at or above 90% capacity,
    /// keep the highest-priority, newest 80%.
    async fn evict(&self, entries: &mut Vec<BufferEntry>) -> usize {
        let now = Utc::now();
        let before = entries.len();
        let mut expired = 0u64;

        entries.retain(|e| {
            if e.processed || e.failed {
                false
            } else if e.is_expired_at(now) {
                expired += 1;
                false
            } else {
                true
            }
        });

        let max_size = self.config.max_size;
        let mut evicted = 0u64;
        if entries.len() * 10 >= max_size * 9 {
            entries.sort_by(retention_order);
            let keep = max_size * 8 / 10;
            evicted = entries.len().saturating_sub(keep) as u64;
            entries.truncate(keep);
            entries.sort_by(processing_order);
        }

        if expired > 0 || evicted > 0 {
            let mut metrics = self.metrics.write().await;
            metrics.entries_expired += expired;
            metrics.entries_evicted += evicted;
        }
        if evicted > 0 {
            warn!("Buffer near capacity, evicted {} pending entries", evicted);
        }
        let removed = before - entries.len();
        if removed > 0 {
            info!("Cleaned up {} buffer entries", removed);
        }
        removed
    }

    async fn process_next(&self) -> bool {
        if !self.processing_enabled.load(Ordering::SeqCst) {
            return false;
        }

        let entry = {
            let now = Utc::now();
            let entries = self.entries.read().await;
            match entries.iter().find(|e| e.is_pending_at(now)) {
                Some(entry) => entry.clone(),
                None => return false,
            }
        };

        let processor = self.processors.read().await.get(&entry.buffer_type).cloned();
        let result = match processor {
            Some(processor) => {
                let job = entry.clone();
                // A panicking processor surfaces as a JoinError
                match tokio::spawn(async move { processor.process(&job).await }).await {
                    Ok(result) => result,
                    Err(e) => ProcessResult::Retry {
                        error: format!("processor panicked: {}", e),
                    },
                }
            }
            None if entry.buffer_type == BufferType::Command => ProcessResult::Retry {
                error: "no command router configured".to_string(),
            },
            None => self.default_processor.process(&entry).await,
        };

        let mut entries = self.entries.write().await;
        let Some(stored) = entries.iter_mut().find(|e| e.entry_id == entry.entry_id) else {
            // Cleared or evicted while processing
            return true;
        };

        match result {
            ProcessResult::Processed => {
                stored.processed = true;
                stored.error = None;
                drop(entries);
                self.metrics.write().await.entries_processed += 1;
                debug!("Buffer entry processed: {}", entry.entry_id);
            }
            ProcessResult::Retry { error } => {
                stored.retry_count += 1;
                stored.error = Some(error.clone());
                if stored.retry_count >= stored.max_retries {
                    stored.failed = true;
                    let retries = stored.retry_count;
                    drop(entries);
                    self.metrics.write().await.entries_failed += 1;
                    error!(
                        "Buffer entry {} abandoned after {} attempts: {}",
                        entry.entry_id, retries, error
                    );
                } else {
                    warn!(
                        "Buffer entry {} failed (attempt {}), will retry: {}",
                        entry.entry_id, stored.retry_count, error
                    );
                }
            }
            ProcessResult::Abandon { error } => {
                stored.failed = true;
                stored.error = Some(error.clone());
                drop(entries);
                self.metrics.write().await.entries_failed += 1;
                error!("Buffer entry {} abandoned: {}", entry.entry_id, error);
            }
        }
        true
    }

    async fn flush(&self) -> Result<()> {
        self.save_to_file().await?;
        {
            let mut entries = self.entries.write().await;
            self.evict(&mut entries).await;
        }
        self.metrics.write().await.buffer_flushes += 1;
        debug!("Buffer flushed");
        Ok(())
    }

    async fn save_to_file(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let snapshot = BufferSnapshot {
            timestamp: Utc::now(),
            entries: self.entries.read().await.clone(),
            metrics: self.metrics.read().await.clone(),
        };
        save_snapshot(&self.snapshot_path(), &snapshot).await?;
        self.metrics.write().await.file_saves += 1;
        Ok(())
    }

    async fn load_from_file(&self) -> Result<usize> {
        let path = self.snapshot_path();
        let Some(snapshot) = load_snapshot(&path).await? else {
            info!("No buffer snapshot at {}, starting empty", path.display());
            return Ok(0);
        };

        let now = Utc::now();
        let mut restored: Vec<BufferEntry> = snapshot
            .entries
            .into_iter()
            .filter(|e| !e.is_expired_at(now))
            .collect();
        if restored.len() > self.config.max_size {
            restored.sort_by(retention_order);
            restored.truncate(self.config.max_size);
        }
        restored.sort_by(processing_order);
        let count = restored.len();

        *self.entries.write().await = restored;
        {
            let mut metrics = self.metrics.write().await;
            *metrics = snapshot.metrics;
            metrics.file_loads += 1;
        }
        self.wake.notify_one();

        info!("Loaded {} entries from {}", count, path.display());
        Ok(count)
    }
}

#[async_trait]
impl Component for BufferSystem {
    fn name(&self) -> String {
        "buffer_system".to_string()
    }

    async fn status(&self) -> Option<Value> {
        serde_json::to_value(self.get_status().await).ok()
    }

    async fn health_info(&self) -> Option<HealthInfo> {
        let size = self.len().await;
        let max_size = self.shared.config.max_size;
        let info = if size * 10 >= max_size * 9 {
            HealthInfo::unhealthy("buffer nearly full")
        } else {
            HealthInfo::healthy()
        };
        Some(info.with_details(json!({ "size": size, "max_size": max_size })))
    }

    fn is_running(&self) -> Option<bool> {
        Some(BufferSystem::is_running(self))
    }

    async fn start(&self) -> std::result::Result<(), String> {
        BufferSystem::start(self).await;
        Ok(())
    }

    async fn stop(&self) -> std::result::Result<(), String> {
        BufferSystem::stop(self).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn buffer_in(dir: &tempfile::TempDir, max_size: usize) -> BufferSystem {
        BufferSystem::new(BufferConfig {
            max_size,
            snapshot_path: dir.path().join("buffer.json").to_string_lossy().into_owned(),
            ..Default::default()
        })
    }

    struct FailingProcessor(Arc<AtomicUsize>);

    #[async_trait]
    impl EntryProcessor for FailingProcessor {
        async fn process(&self, _entry: &BufferEntry) -> ProcessResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            ProcessResult::Retry {
                error: "downstream unavailable".to_string(),
            }
        }
    }

    #[tokio::test]
    async fn test_entries_kept_in_priority_order() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer_in(&dir, 10);
        buffer.add_metric(json!("m")).await.unwrap();
        buffer.add_sync_data(json!("s")).await.unwrap();
        buffer.add_event(json!("e1")).await.unwrap();
        buffer.add_event(json!("e2")).await.unwrap();

        let data: Vec<Value> = buffer
            .get_buffer_entries(None, 10)
            .await
            .into_iter()
            .map(|e| e.data)
            .collect();
        assert_eq!(data, vec![json!("s"), json!("e1"), json!("e2"), json!("m")]);

        let events = buffer.get_buffer_entries(Some(BufferType::Event), 1).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, json!("e1"));
    }

    #[tokio::test]
    async fn test_full_buffer_rejects_after_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer_in(&dir, 3);
        for i in 0..3 {
            buffer.add_event(json!(i)).await.unwrap();
        }
        // 3 >= 90% of 3, so eviction keeps 80% (2 entries) and the add fits
        buffer.add_event(json!(3)).await.unwrap();
        assert!(buffer.len().await <= 3);
        assert_eq!(buffer.get_metrics().await.entries_evicted, 1);
        assert_eq!(buffer.get_metrics().await.entries_expired, 0);
    }

    #[tokio::test]
    async fn test_concurrent_saves_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(buffer_in(&dir, 3000));
        for i in 0..3000 {
            buffer.add_event(json!({ "n": i })).await.unwrap();
        }

        let saves: Vec<_> = (0..8)
            .map(|_| {
                let buffer = buffer.clone();
                tokio::spawn(async move { buffer.save_to_file().await })
            })
            .collect();
        for result in futures::future::join_all(saves).await {
            assert!(result.unwrap().is_ok());
        }

        assert_eq!(buffer.get_metrics().await.file_saves, 8);
        let restored = buffer_in(&dir, 3000);
        assert_eq!(restored.load_from_file().await.unwrap(), 3000);
    }

    #[tokio::test]
    async fn test_never_exceeds_max_size() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer_in(&dir, 20);
        for i in 0..100 {
            let _ = buffer
                .add_entry(BufferType::Event, json!(i), (i % 7) as i32, None)
                .await;
            assert!(buffer.len().await <= 20);
        }
    }

    #[tokio::test]
    async fn test_buffer_full_error() {
        let dir = tempfile::tempdir().unwrap();
        // Eviction truncates a size-1 buffer to zero
        let buffer = buffer_in(&dir, 1);
        buffer.add_event(json!(1)).await.unwrap();
        buffer.add_event(json!(2)).await.unwrap();
        assert_eq!(buffer.len().await, 1);

        let tiny = BufferSystem::new(BufferConfig {
            max_size: 0,
            snapshot_path: dir.path().join("tiny.json").to_string_lossy().into_owned(),
            ..Default::default()
        });
        let err = tiny.add_event(json!(1)).await.unwrap_err();
        assert!(matches!(err, SwitchboardError::BufferFull { capacity: 0 }));
    }

    #[tokio::test]
    async fn test_retries_then_abandons() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer_in(&dir, 10);
        let attempts = Arc::new(AtomicUsize::new(0));
        buffer
            .register_processor(BufferType::Event, Arc::new(FailingProcessor(attempts.clone())))
            .await;

        let id = buffer.add_event(json!("x")).await.unwrap();
        for _ in 0..5 {
            buffer.process_next().await;
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let entry = buffer.get_entry(&id).await.unwrap();
        assert!(entry.failed);
        assert_eq!(entry.retry_count, 3);
        assert_eq!(buffer.get_metrics().await.entries_failed, 1);

        assert_eq!(buffer.cleanup().await, 1);
        assert!(buffer.is_empty().await);
    }

    #[tokio::test]
    async fn test_default_processor_and_disable() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer_in(&dir, 10);
        let id = buffer.add_heartbeat(json!({"seq": 1})).await.unwrap();

        buffer.disable_processing();
        assert!(!buffer.process_next().await);

        buffer.enable_processing();
        assert!(buffer.process_next().await);
        assert!(buffer.get_entry(&id).await.unwrap().processed);
        assert!(!buffer.process_next().await);

        let status = buffer.get_status().await;
        assert_eq!(status.entries_by_status.get("processed"), Some(&1));
        assert_eq!(status.metrics.entries_processed, 1);
    }

    #[tokio::test]
    async fn test_command_without_router_retries() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer_in(&dir, 10);
        let id = buffer
            .add_command("status", "system", json!({}), "test")
            .await
            .unwrap();
        buffer.process_next().await;

        let entry = buffer.get_entry(&id).await.unwrap();
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.error.as_deref(), Some("no command router configured"));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer_in(&dir, 10);
        buffer.add_metric(json!({"cpu": 0.5})).await.unwrap();
        buffer.add_sync_data(json!({"v": 1})).await.unwrap();
        buffer.add_event(json!({"e": 1})).await.unwrap();
        buffer
            .add_entry(
                BufferType::Event,
                json!("short-lived"),
                9,
                Some(Duration::from_millis(1)),
            )
            .await
            .unwrap();
        let saved: Vec<BufferEntry> = buffer.get_buffer_entries(None, 10).await;

        buffer.save_to_file().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let restored = buffer_in(&dir, 10);
        assert_eq!(restored.load_from_file().await.unwrap(), 3);

        let loaded = restored.get_buffer_entries(None, 10).await;
        let expected: Vec<&BufferEntry> =
            saved.iter().filter(|e| e.data != json!("short-lived")).collect();
        assert_eq!(loaded.len(), expected.len());
        for (got, want) in loaded.iter().zip(expected) {
            assert_eq!(got.entry_id, want.entry_id);
            assert_eq!(got.data, want.data);
            assert_eq!(got.priority, want.priority);
        }

        let metrics = restored.get_metrics().await;
        assert_eq!(metrics.entries_added, 4);
        assert_eq!(metrics.file_loads, 1);
    }

    #[tokio::test]
    async fn test_stop_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer_in(&dir, 10);
        buffer.disable_processing();
        buffer.start().await;
        buffer.add_event(json!("pending")).await.unwrap();
        buffer.stop().await;

        assert!(dir.path().join("buffer.json").exists());
        assert!(!dir.path().join("buffer.json.tmp").exists());

        let restored = buffer_in(&dir, 10);
        assert_eq!(restored.load_from_file().await.unwrap(), 1);
    }
}
