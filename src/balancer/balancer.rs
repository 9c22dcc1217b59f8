//! Load Balancer
//!
//! Distributes typed tasks over registered workers. A scheduling loop pops the
//! highest-priority task, filters workers by task-type affinity and spare
//! capacity, and hands the task to the worker picked by the active strategy.
//! Worker selection and slot reservation happen under one lock, so a worker
//! never runs more than `max_concurrent` tasks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use super::queue::{QueueStats, TaskQueue};
use super::strategy::{Strategy, WorkerLoad};
use super::task::{Task, TaskHandler, TaskPriority, TaskResult};
use crate::config::window_duration;
use crate::coordination::toggles::{gate_open, ToggleGate};
use crate::error::{Result, SwitchboardError};
use crate::platform::{Component, HealthInfo};

/// Wildcard task-type affinity
pub const ANY_TASK_TYPE: &str = "*";

/// Load balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Initial strategy name (default: least_loaded)
    pub strategy: String,
    /// Per-task execution deadline (default: 300s)
    pub task_timeout_ms: u64,
    /// Concurrency for workers registered without an explicit limit (default: 10)
    pub max_concurrent_tasks: usize,
    /// Scheduler sleep while the queue is empty (default: 100ms)
    pub idle_poll_ms: u64,
    /// Scheduler backoff when no worker can take the head task (default: 1s)
    pub no_worker_backoff_ms: u64,
    /// Worker monitor period (default: 30s)
    pub monitor_interval_secs: u64,
    /// Inactivity after which a worker is reported stale (default: 300s)
    pub stale_worker_secs: u64,
    /// Finished tasks kept for queries (default: 1000)
    pub completed_limit: usize,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::LeastLoaded.as_str().to_string(),
            task_timeout_ms: 300_000,
            max_concurrent_tasks: 10,
            idle_poll_ms: 100,
            no_worker_backoff_ms: 1000,
            monitor_interval_secs: 30,
            stale_worker_secs: 300,
            completed_limit: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BalancerMetrics {
    pub tasks_queued: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Rolling average over successful tasks
    pub avg_processing_time_ms: f64,
    pub avg_queue_wait_ms: f64,
    /// Percent of each worker's slots in use, as of the last monitor pass
    pub worker_utilization: BTreeMap<String, f64>,
    /// Active tasks per worker, as of the last monitor pass
    pub load_distribution: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub active_tasks: usize,
    pub max_concurrent: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub task_types: Vec<String>,
    pub available: bool,
    pub utilization: f64,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalancerStatus {
    pub running: bool,
    pub strategy: Strategy,
    pub queue: QueueStats,
    pub active_tasks: usize,
    pub completed_history: usize,
    pub workers: Vec<WorkerStatus>,
    pub metrics: BalancerMetrics,
}

struct Worker {
    worker_id: String,
    handler: Arc<dyn TaskHandler>,
    max_concurrent: usize,
    task_types: Vec<String>,
    active_tasks: HashMap<String, AbortHandle>,
    completed_tasks: u64,
    failed_tasks: u64,
    last_activity: DateTime<Utc>,
    available: bool,
}

impl Worker {
    fn accepts(&self, task_type: &str) -> bool {
        self.task_types
            .iter()
            .any(|t| t == ANY_TASK_TYPE || t == task_type)
    }

    fn has_capacity(&self) -> bool {
        self.active_tasks.len() < self.max_concurrent
    }

    fn load(&self) -> WorkerLoad {
        WorkerLoad {
            active: self.active_tasks.len(),
            max_concurrent: self.max_concurrent,
            completed: self.completed_tasks,
        }
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            worker_id: self.worker_id.clone(),
            active_tasks: self.active_tasks.len(),
            max_concurrent: self.max_concurrent,
            completed_tasks: self.completed_tasks,
            failed_tasks: self.failed_tasks,
            task_types: self.task_types.clone(),
            available: self.available,
            utilization: self.load().utilization() * 100.0,
            last_activity: self.last_activity,
        }
    }
}

struct BalancerState {
    queue: TaskQueue,
    /// Registration order; strategies break ties toward the front
    workers: Vec<Worker>,
    active: HashMap<String, Task>,
    completed: VecDeque<Task>,
    strategy: Strategy,
    metrics: BalancerMetrics,
}

/// Result of one scheduling attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Nothing queued
    Idle,
    Assigned,
    /// Head task put back; no eligible worker
    NoWorker,
}

struct BalancerShared {
    config: BalancerConfig,
    state: Mutex<BalancerState>,
    running: AtomicBool,
    wake: Notify,
    gate: RwLock<Option<ToggleGate>>,
}

pub struct LoadBalancer {
    shared: Arc<BalancerShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl LoadBalancer {
    pub fn new(config: BalancerConfig) -> Self {
        let strategy = config.strategy.parse().unwrap_or_else(|e| {
            warn!("{}, falling back to {}", e, Strategy::default());
            Strategy::default()
        });

        Self {
            shared: Arc::new(BalancerShared {
                config,
                state: Mutex::new(BalancerState {
                    queue: TaskQueue::new(),
                    workers: Vec::new(),
                    active: HashMap::new(),
                    completed: VecDeque::new(),
                    strategy,
                    metrics: BalancerMetrics::default(),
                }),
                running: AtomicBool::new(false),
                wake: Notify::new(),
                gate: RwLock::new(None),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BalancerConfig::default())
    }

    /// Pause scheduling while the gate is closed
    pub async fn set_gate(&self, gate: ToggleGate) {
        *self.shared.gate.write().await = Some(gate);
    }

    /// Register a worker. `max_concurrent` of `None` uses the configured
    /// default; an empty `task_types` accepts every type.
    pub async fn register_worker(
        &self,
        worker_id: &str,
        handler: Arc<dyn TaskHandler>,
        max_concurrent: Option<usize>,
        task_types: Vec<String>,
    ) -> Result<()> {
        let max_concurrent = max_concurrent.unwrap_or(self.shared.config.max_concurrent_tasks);
        if max_concurrent == 0 {
            return Err(SwitchboardError::Validation(format!(
                "worker {} needs max_concurrent > 0",
                worker_id
            )));
        }
        let task_types = if task_types.is_empty() {
            vec![ANY_TASK_TYPE.to_string()]
        } else {
            task_types
        };

        let mut state = self.shared.state.lock().await;
        if state.workers.iter().any(|w| w.worker_id == worker_id) {
            return Err(SwitchboardError::Validation(format!(
                "worker {} already registered",
                worker_id
            )));
        }
        state.workers.push(Worker {
            worker_id: worker_id.to_string(),
            handler,
            max_concurrent,
            task_types,
            active_tasks: HashMap::new(),
            completed_tasks: 0,
            failed_tasks: 0,
            last_activity: Utc::now(),
            available: true,
        });
        state.metrics.worker_utilization.insert(worker_id.to_string(), 0.0);
        state.metrics.load_distribution.insert(worker_id.to_string(), 0);
        drop(state);

        self.shared.wake.notify_one();
        info!(
            "Registered worker: {} (max_concurrent: {})",
            worker_id, max_concurrent
        );
        Ok(())
    }

    /// Remove a worker, failing every task it was running. Returns the
    /// number of tasks failed.
    pub async fn unregister_worker(&self, worker_id: &str) -> Result<usize> {
        let mut state = self.shared.state.lock().await;
        let index = state
            .workers
            .iter()
            .position(|w| w.worker_id == worker_id)
            .ok_or_else(|| SwitchboardError::not_found("worker", worker_id))?;
        let worker = state.workers.remove(index);
        state.metrics.worker_utilization.remove(worker_id);
        state.metrics.load_distribution.remove(worker_id);

        let mut failed = 0;
        for (task_id, abort) in worker.active_tasks {
            abort.abort();
            if let Some(mut task) = state.active.remove(&task_id) {
                task.finish(Err(format!("Worker {} unregistered", worker_id)));
                state.metrics.tasks_failed += 1;
                self.shared.record_completed(&mut state, task);
                failed += 1;
            }
        }

        info!("Unregistered worker: {} ({} tasks failed)", worker_id, failed);
        Ok(failed)
    }

    /// Exclude or re-admit a worker for new assignments
    pub async fn set_worker_available(&self, worker_id: &str, available: bool) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        let worker = state
            .workers
            .iter_mut()
            .find(|w| w.worker_id == worker_id)
            .ok_or_else(|| SwitchboardError::not_found("worker", worker_id))?;
        worker.available = available;
        drop(state);
        if available {
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    /// Enqueue a task; returns its id
    pub async fn submit_task(&self, task_type: &str, payload: Value, priority: TaskPriority) -> String {
        let task = Task::new(task_type, payload, priority);
        let task_id = task.task_id.clone();
        {
            let mut state = self.shared.state.lock().await;
            state.queue.push(task);
            state.metrics.tasks_queued += 1;
        }
        self.shared.wake.notify_one();
        info!(
            "Submitted task: {} ({}, priority: {})",
            task_id, task_type, priority
        );
        task_id
    }

    pub async fn set_strategy(&self, name: &str) -> Result<()> {
        let strategy: Strategy = name.parse()?;
        self.shared.state.lock().await.strategy = strategy;
        info!("Load balancing strategy set to: {}", strategy);
        Ok(())
    }

    pub async fn strategy(&self) -> Strategy {
        self.shared.state.lock().await.strategy
    }

    /// Run one scheduling attempt outside the loop
    pub async fn schedule_once(&self) -> ScheduleOutcome {
        self.shared.schedule_once().await
    }

    /// Queued, active or finished task by id
    pub async fn get_task_info(&self, task_id: &str) -> Option<Task> {
        let state = self.shared.state.lock().await;
        if let Some(task) = state.active.get(task_id) {
            return Some(task.clone());
        }
        if let Some(task) = state.queue.get(task_id) {
            return Some(task.clone());
        }
        state
            .completed
            .iter()
            .rev()
            .find(|t| t.task_id == task_id)
            .cloned()
    }

    /// Refresh utilisation figures; returns ids of stale workers
    pub async fn check_workers(&self) -> Vec<String> {
        self.shared.check_workers().await
    }

    pub async fn get_metrics(&self) -> BalancerMetrics {
        self.shared.state.lock().await.metrics.clone()
    }

    pub async fn get_status(&self) -> BalancerStatus {
        let state = self.shared.state.lock().await;
        BalancerStatus {
            running: self.is_running(),
            strategy: state.strategy,
            queue: state.queue.stats(),
            active_tasks: state.active.len(),
            completed_history: state.completed.len(),
            workers: state.workers.iter().map(Worker::status).collect(),
            metrics: state.metrics.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Start the scheduling and worker monitor loops
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            warn!("Load balancer already running");
            return;
        }
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        workers.push(tokio::spawn(async move {
            let idle = Duration::from_millis(shared.config.idle_poll_ms);
            let backoff = Duration::from_millis(shared.config.no_worker_backoff_ms);
            while shared.running.load(Ordering::SeqCst) {
                if !gate_open(&*shared.gate.read().await).await {
                    tokio::time::sleep(idle).await;
                    continue;
                }
                match shared.schedule_once().await {
                    ScheduleOutcome::Assigned => tokio::task::yield_now().await,
                    ScheduleOutcome::Idle => {
                        tokio::select! {
                            _ = shared.wake.notified() => {}
                            _ = tokio::time::sleep(idle) => {}
                        }
                    }
                    ScheduleOutcome::NoWorker => tokio::time::sleep(backoff).await,
                }
            }
        }));

        let shared = self.shared.clone();
        workers.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                shared.config.monitor_interval_secs.max(1),
            ));
            while shared.running.load(Ordering::SeqCst) {
                interval.tick().await;
                shared.check_workers().await;
            }
        }));

        info!("Load balancer started");
    }

    /// Stop both loops. In-flight tasks keep running to completion.
    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);

        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            handle.abort();
            match handle.await {
                Err(e) if !e.is_cancelled() => error!("Load balancer loop failed: {}", e),
                _ => {}
            }
        }
        info!("Load balancer stopped");
    }
}

impl BalancerShared {
    async fn schedule_once(self: &Arc<Self>) -> ScheduleOutcome {
        let mut state = self.state.lock().await;
        let Some(mut task) = state.queue.pop() else {
            return ScheduleOutcome::Idle;
        };

        let eligible: Vec<usize> = state
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.available && w.accepts(&task.task_type) && w.has_capacity())
            .map(|(i, _)| i)
            .collect();
        let loads: Vec<WorkerLoad> = eligible.iter().map(|&i| state.workers[i].load()).collect();

        let Some(pick) = state.strategy.select(&loads, task.priority) else {
            debug!("No worker available for task {} ({})", task.task_id, task.task_type);
            state.queue.requeue(task);
            return ScheduleOutcome::NoWorker;
        };

        let worker = &mut state.workers[eligible[pick]];
        task.assign(&worker.worker_id);
        worker.last_activity = Utc::now();

        let task_id = task.task_id.clone();
        let handler = worker.handler.clone();
        let task_type = task.task_type.clone();
        let payload = task.payload.clone();
        let timeout = Duration::from_millis(self.config.task_timeout_ms);
        let shared = self.clone();

        // Completion needs the state lock, so it cannot run before the slot
        // below is recorded
        let execution = tokio::spawn({
            let task_id = task_id.clone();
            async move {
                let call = AssertUnwindSafe(handler.handle(&task_type, &payload)).catch_unwind();
                let outcome: TaskResult = match tokio::time::timeout(timeout, call).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err("Task handler panicked".to_string()),
                    Err(_) => Err("Task execution timeout".to_string()),
                };
                shared.complete_task(&task_id, outcome).await;
            }
        });

        worker
            .active_tasks
            .insert(task_id.clone(), execution.abort_handle());
        info!("Assigned task {} to worker {}", task_id, worker.worker_id);
        state.active.insert(task_id, task);
        ScheduleOutcome::Assigned
    }

    async fn complete_task(&self, task_id: &str, outcome: TaskResult) {
        let mut state = self.state.lock().await;
        // Already failed by unregister
        let Some(mut task) = state.active.remove(task_id) else {
            return;
        };
        let succeeded = outcome.is_ok();
        task.finish(outcome);

        if let Some(worker_id) = task.worker_id.as_deref() {
            if let Some(worker) = state.workers.iter_mut().find(|w| w.worker_id == worker_id) {
                worker.active_tasks.remove(task_id);
                worker.last_activity = Utc::now();
                if succeeded {
                    worker.completed_tasks += 1;
                } else {
                    worker.failed_tasks += 1;
                }
            }
        }

        let metrics = &mut state.metrics;
        if succeeded {
            metrics.tasks_completed += 1;
            let first = metrics.tasks_completed == 1;
            if let Some(ms) = task.processing_time_ms() {
                metrics.avg_processing_time_ms = rolling(metrics.avg_processing_time_ms, ms, first);
            }
            if let Some(ms) = task.queue_wait_ms() {
                metrics.avg_queue_wait_ms = rolling(metrics.avg_queue_wait_ms, ms, first);
            }
            info!("Task {} completed successfully", task_id);
        } else {
            metrics.tasks_failed += 1;
            error!(
                "Task {} failed: {}",
                task_id,
                task.error.as_deref().unwrap_or("unknown error")
            );
        }

        self.record_completed(&mut state, task);
        drop(state);
        self.wake.notify_one();
    }

    fn record_completed(&self, state: &mut BalancerState, task: Task) {
        state.completed.push_back(task);
        while state.completed.len() > self.config.completed_limit {
            state.completed.pop_front();
        }
    }

    async fn check_workers(&self) -> Vec<String> {
        let now = Utc::now();
        let stale_after = window_duration(self.config.stale_worker_secs);
        let mut state = self.state.lock().await;
        let state = &mut *state;
        let mut stale = Vec::new();

        for worker in &state.workers {
            let load = worker.load();
            state
                .metrics
                .worker_utilization
                .insert(worker.worker_id.clone(), load.utilization() * 100.0);
            state
                .metrics
                .load_distribution
                .insert(worker.worker_id.clone(), load.active);

            let idle = now - worker.last_activity;
            if idle > stale_after {
                warn!(
                    "Worker {} inactive for {}s",
                    worker.worker_id,
                    idle.num_seconds()
                );
                stale.push(worker.worker_id.clone());
            }
        }
        stale
    }
}

fn rolling(avg: f64, sample: f64, first: bool) -> f64 {
    if first {
        sample
    } else {
        (avg + sample) / 2.0
    }
}

#[async_trait]
impl Component for LoadBalancer {
    fn name(&self) -> String {
        "load_balancer".to_string()
    }

    async fn status(&self) -> Option<Value> {
        serde_json::to_value(self.get_status().await).ok()
    }

    async fn health_info(&self) -> Option<HealthInfo> {
        let status = self.get_status().await;
        let info = if status.running {
            HealthInfo::healthy()
        } else {
            HealthInfo::unhealthy("load balancer not running")
        };
        Some(info.with_details(json!({
            "workers": status.workers.len(),
            "queue_size": status.queue.current_size,
            "active_tasks": status.active_tasks,
        })))
    }

    fn is_running(&self) -> Option<bool> {
        Some(LoadBalancer::is_running(self))
    }

    async fn start(&self) -> std::result::Result<(), String> {
        LoadBalancer::start(self).await;
        Ok(())
    }

    async fn stop(&self) -> std::result::Result<(), String> {
        LoadBalancer::stop(self).await;
        Ok(())
    }
}
