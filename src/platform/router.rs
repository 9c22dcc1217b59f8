//! Command Router
//!
//! Accepts commands, resolves a handler (exact `target.type` key, routing rule
//! prefix, then per-target default), executes under a deadline and keeps a
//! bounded history of finished commands.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use super::command::{Command, CommandHandler, CommandStatus, HandlerResult};
use super::traits::{Component, ComponentRegistry, HealthInfo};
use crate::error::{Result, SwitchboardError};

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Bounded queue capacity (default: 100)
    pub max_queue: usize,
    /// Per-command execution deadline (default: 60s)
    pub command_timeout_ms: u64,
    /// Finished commands kept for queries (default: 1000)
    pub history_limit: usize,
    /// Maximum explicit resubmissions of one command (default: 3)
    pub retry_attempts: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_queue: 100,
            command_timeout_ms: 60_000,
            history_limit: 1000,
            retry_attempts: 3,
        }
    }
}

/// Routing metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterMetrics {
    pub commands_processed: u64,
    pub commands_failed: u64,
    pub commands_timeout: u64,
    pub commands_cancelled: u64,
    /// Rolling average over successful commands
    pub avg_processing_time_ms: f64,
}

/// Read-only router snapshot
#[derive(Debug, Clone, Serialize)]
pub struct RouterStatus {
    pub running: bool,
    pub queue_size: usize,
    pub active_commands: usize,
    pub history_size: usize,
    pub registered_handlers: Vec<String>,
    pub default_handlers: Vec<String>,
    pub routing_rules: usize,
    pub metrics: RouterMetrics,
}

/// Terminal command outcome, broadcast to subscribers
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub command_id: String,
    pub command_type: String,
    pub target: String,
    pub status: CommandStatus,
    pub error: Option<String>,
}

struct RouterShared {
    config: RouterConfig,
    registry: ComponentRegistry,
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    default_handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    /// (command_type prefix, target), evaluated in insertion order
    routing_rules: RwLock<Vec<(String, String)>>,
    active: RwLock<HashMap<String, Command>>,
    history: RwLock<VecDeque<Command>>,
    metrics: RwLock<RouterMetrics>,
    queue_tx: mpsc::Sender<String>,
    queue_rx: Mutex<mpsc::Receiver<String>>,
    running: AtomicBool,
    /// Set for the duration of `stop()`; executions started meanwhile abort themselves
    stopping: AtomicBool,
    /// Handler executions in flight, keyed by command id
    executions: Mutex<HashMap<String, AbortHandle>>,
    event_tx: broadcast::Sender<CommandOutcome>,
}

struct RouterWorker {
    handle: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

/// Command router with a single background processing loop
pub struct CommandRouter {
    shared: Arc<RouterShared>,
    worker: Mutex<Option<RouterWorker>>,
}

impl CommandRouter {
    pub fn new(config: RouterConfig, registry: ComponentRegistry) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.max_queue.max(1));
        let (event_tx, _) = broadcast::channel(256);

        let mut handlers: HashMap<String, Arc<dyn CommandHandler>> = HashMap::new();
        handlers.insert(
            "system.status".to_string(),
            Arc::new(SystemStatusHandler {
                registry: registry.clone(),
            }),
        );
        handlers.insert(
            "system.health".to_string(),
            Arc::new(SystemHealthHandler {
                registry: registry.clone(),
            }),
        );

        Self {
            shared: Arc::new(RouterShared {
                config,
                registry,
                handlers: RwLock::new(handlers),
                default_handlers: RwLock::new(HashMap::new()),
                routing_rules: RwLock::new(Vec::new()),
                active: RwLock::new(HashMap::new()),
                history: RwLock::new(VecDeque::new()),
                metrics: RwLock::new(RouterMetrics::default()),
                queue_tx,
                queue_rx: Mutex::new(queue_rx),
                running: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                executions: Mutex::new(HashMap::new()),
                event_tx,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Subscribe to terminal command outcomes
    pub fn subscribe(&self) -> broadcast::Receiver<CommandOutcome> {
        self.shared.event_tx.subscribe()
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.shared.registry
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Start the processing loop
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let (shutdown, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut rx = shared.queue_rx.lock().await;
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    next = rx.recv() => match next {
                        Some(command_id) => {
                            shared.execute(&command_id).await;
                        }
                        None => break,
                    },
                }
            }
            debug!("Command router loop finished");
        });
        *worker = Some(RouterWorker { handle, shutdown });
        info!("Command router started");
    }

    /// Stop the loop and cancel every command that has not finished.
    /// Running handlers are aborted; the loop exits between commands.
    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.stopping.store(true, Ordering::SeqCst);

        let worker = self.worker.lock().await.take();
        for (_, execution) in self.shared.executions.lock().await.drain() {
            execution.abort();
        }

        if let Some(worker) = worker {
            let _ = worker.shutdown.send(());
            if let Err(e) = worker.handle.await {
                error!("Command router loop failed: {}", e);
            }
        }

        // Drop queued ids; their commands are cancelled below
        {
            let mut rx = self.shared.queue_rx.lock().await;
            while rx.try_recv().is_ok() {}
        }

        let ids: Vec<String> = self.shared.active.read().await.keys().cloned().collect();
        for id in ids {
            self.shared
                .finish(
                    &id,
                    CommandStatus::Cancelled,
                    None,
                    Some("System shutdown".to_string()),
                )
                .await;
        }

        self.shared.stopping.store(false, Ordering::SeqCst);
        info!("Command router stopped");
    }

    /// Register a handler for `target.command_type`
    pub async fn register_handler(
        &self,
        target: &str,
        command_type: &str,
        handler: Arc<dyn CommandHandler>,
    ) {
        let key = format!("{}.{}", target, command_type);
        self.shared.handlers.write().await.insert(key.clone(), handler);
        info!("Registered command handler: {}", key);
    }

    pub async fn unregister_handler(&self, target: &str, command_type: &str) -> bool {
        let key = format!("{}.{}", target, command_type);
        self.shared.handlers.write().await.remove(&key).is_some()
    }

    /// Register the fallback handler for a target
    pub async fn register_default_handler(&self, target: &str, handler: Arc<dyn CommandHandler>) {
        self.shared
            .default_handlers
            .write()
            .await
            .insert(target.to_string(), handler);
        info!("Registered default handler for target: {}", target);
    }

    /// Route command types starting with `prefix` to `target`
    pub async fn add_routing_rule(&self, prefix: &str, target: &str) {
        self.shared
            .routing_rules
            .write()
            .await
            .push((prefix.to_string(), target.to_string()));
        debug!("Added routing rule: {}* -> {}", prefix, target);
    }

    /// Enqueue a command for the background loop
    pub async fn queue_command(
        &self,
        command_type: &str,
        target: &str,
        payload: Value,
        source: &str,
    ) -> Result<String> {
        self.enqueue(Command::new(command_type, target, payload, source))
            .await
    }

    /// Execute a command immediately, bypassing the queue
    pub async fn handle_command(
        &self,
        command_type: &str,
        target: &str,
        payload: Value,
        source: &str,
    ) -> Result<Command> {
        let command = Command::new(command_type, target, payload, source);
        let id = command.command_id.clone();
        self.shared.active.write().await.insert(id.clone(), command);

        self.shared.execute(&id).await.ok_or_else(|| {
            SwitchboardError::InvalidState(format!("command {} was cancelled before execution", id))
        })
    }

    /// Queue a fresh copy of a finished command with its retry count bumped
    pub async fn resubmit_command(&self, command_id: &str) -> Result<String> {
        let previous = self
            .shared
            .find_in_history(command_id)
            .await
            .ok_or_else(|| SwitchboardError::not_found("command", command_id))?;

        if previous.status == CommandStatus::Completed {
            return Err(SwitchboardError::Validation(format!(
                "command {} already completed",
                command_id
            )));
        }
        if previous.retry_count >= self.shared.config.retry_attempts {
            return Err(SwitchboardError::Validation(format!(
                "command {} exhausted {} retry attempts",
                command_id, self.shared.config.retry_attempts
            )));
        }

        let mut retry = Command::new(
            &previous.command_type,
            &previous.target,
            previous.payload.clone(),
            &previous.source,
        );
        retry.retry_count = previous.retry_count + 1;
        self.enqueue(retry).await
    }

    async fn enqueue(&self, command: Command) -> Result<String> {
        let id = command.command_id.clone();
        let (command_type, target) = (command.command_type.clone(), command.target.clone());
        self.shared.active.write().await.insert(id.clone(), command);

        if self.shared.queue_tx.try_send(id.clone()).is_err() {
            self.shared.active.write().await.remove(&id);
            warn!(
                "Command queue full, rejected {} -> {}",
                command_type, target
            );
            return Err(SwitchboardError::QueueFull {
                capacity: self.shared.config.max_queue,
            });
        }

        debug!("Queued command {}: {} -> {}", id, command_type, target);
        Ok(id)
    }

    /// Look up a command, active first then history
    pub async fn get_command_info(&self, command_id: &str) -> Option<Command> {
        if let Some(cmd) = self.shared.active.read().await.get(command_id) {
            return Some(cmd.clone());
        }
        self.shared.find_in_history(command_id).await
    }

    /// Most recent finished commands, oldest first
    pub async fn get_recent_commands(&self, limit: usize) -> Vec<Command> {
        let history = self.shared.history.read().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub async fn get_metrics(&self) -> RouterMetrics {
        self.shared.metrics.read().await.clone()
    }

    pub async fn get_status(&self) -> RouterStatus {
        let mut registered_handlers: Vec<String> =
            self.shared.handlers.read().await.keys().cloned().collect();
        registered_handlers.sort();
        let mut default_handlers: Vec<String> =
            self.shared.default_handlers.read().await.keys().cloned().collect();
        default_handlers.sort();

        RouterStatus {
            running: self.is_running(),
            queue_size: self
                .shared
                .config
                .max_queue
                .max(1)
                .saturating_sub(self.shared.queue_tx.capacity()),
            active_commands: self.shared.active.read().await.len(),
            history_size: self.shared.history.read().await.len(),
            registered_handlers,
            default_handlers,
            routing_rules: self.shared.routing_rules.read().await.len(),
            metrics: self.get_metrics().await,
        }
    }
}

impl RouterShared {
    async fn resolve_handler(&self, command: &Command) -> Option<Arc<dyn CommandHandler>> {
        if let Some(handler) = self.handlers.read().await.get(&command.handler_key()) {
            return Some(handler.clone());
        }

        let rule_target = self
            .routing_rules
            .read()
            .await
            .iter()
            .find(|(prefix, _)| command.command_type.starts_with(prefix.as_str()))
            .map(|(_, target)| target.clone());
        if let Some(target) = rule_target {
            let key = format!("{}.{}", target, command.command_type);
            if let Some(handler) = self.handlers.read().await.get(&key) {
                return Some(handler.clone());
            }
        }

        self.default_handlers
            .read()
            .await
            .get(&command.target)
            .cloned()
    }

    /// Run one command to a terminal status. Returns the finished record, or
    /// `None` when the command is no longer active (e.g. cancelled by stop).
    async fn execute(&self, command_id: &str) -> Option<Command> {
        let command = {
            let mut active = self.active.write().await;
            let command = active.get_mut(command_id)?;
            command.mark_processing();
            command.clone()
        };

        let Some(handler) = self.resolve_handler(&command).await else {
            let error = format!(
                "No handler found for {} -> {}",
                command.command_type, command.target
            );
            warn!("{}", error);
            return self
                .finish(command_id, CommandStatus::Failed, None, Some(error))
                .await;
        };

        let deadline = Duration::from_millis(self.config.command_timeout_ms);
        // A panicking handler surfaces as a JoinError
        let execution = tokio::spawn(async move {
            tokio::time::timeout(deadline, handler.handle(&command)).await
        });
        {
            let mut executions = self.executions.lock().await;
            if self.stopping.load(Ordering::SeqCst) {
                execution.abort();
            } else {
                executions.insert(command_id.to_string(), execution.abort_handle());
            }
        }

        let outcome = execution.await;
        self.executions.lock().await.remove(command_id);

        match outcome {
            Ok(Ok(Ok(result))) => {
                self.finish(command_id, CommandStatus::Completed, Some(result), None)
                    .await
            }
            Ok(Ok(Err(e))) => {
                self.finish(command_id, CommandStatus::Failed, None, Some(e))
                    .await
            }
            Ok(Err(_)) => {
                warn!("Command {} timed out after {:?}", command_id, deadline);
                self.finish(
                    command_id,
                    CommandStatus::Timeout,
                    None,
                    Some("Command execution timeout".to_string()),
                )
                .await
            }
            Err(e) if e.is_cancelled() => {
                self.finish(
                    command_id,
                    CommandStatus::Cancelled,
                    None,
                    Some("System shutdown".to_string()),
                )
                .await
            }
            Err(e) => {
                self.finish(
                    command_id,
                    CommandStatus::Failed,
                    None,
                    Some(format!("Handler panicked: {}", e)),
                )
                .await
            }
        }
    }

    async fn finish(
        &self,
        command_id: &str,
        status: CommandStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Option<Command> {
        let command = {
            let mut active = self.active.write().await;
            let mut command = active.remove(command_id)?;
            if !command.finish(status, result, error) {
                return None;
            }
            command
        };

        {
            let mut metrics = self.metrics.write().await;
            match status {
                CommandStatus::Completed => {
                    metrics.commands_processed += 1;
                    let elapsed = command.processing_time_ms().unwrap_or(0) as f64;
                    metrics.avg_processing_time_ms = if metrics.commands_processed == 1 {
                        elapsed
                    } else {
                        (metrics.avg_processing_time_ms + elapsed) / 2.0
                    };
                }
                CommandStatus::Failed => metrics.commands_failed += 1,
                CommandStatus::Timeout => metrics.commands_timeout += 1,
                CommandStatus::Cancelled => metrics.commands_cancelled += 1,
                CommandStatus::Pending | CommandStatus::Processing => {}
            }
        }

        {
            let mut history = self.history.write().await;
            history.push_back(command.clone());
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }

        match status {
            CommandStatus::Completed => debug!(
                "Command {} completed: {} -> {}",
                command.command_id, command.command_type, command.target
            ),
            _ => info!(
                "Command {} {}: {} -> {} ({})",
                command.command_id,
                status,
                command.command_type,
                command.target,
                command.error.as_deref().unwrap_or("")
            ),
        }

        let _ = self.event_tx.send(CommandOutcome {
            command_id: command.command_id.clone(),
            command_type: command.command_type.clone(),
            target: command.target.clone(),
            status,
            error: command.error.clone(),
        });

        Some(command)
    }

    async fn find_in_history(&self, command_id: &str) -> Option<Command> {
        self.history
            .read()
            .await
            .iter()
            .rev()
            .find(|c| c.command_id == command_id)
            .cloned()
    }
}

/// Resolves the component a system query is about: payload `component`, else the target
fn queried_component(command: &Command) -> &str {
    command
        .payload
        .get("component")
        .and_then(Value::as_str)
        .unwrap_or(&command.target)
}

struct SystemStatusHandler {
    registry: ComponentRegistry,
}

#[async_trait]
impl CommandHandler for SystemStatusHandler {
    async fn handle(&self, command: &Command) -> HandlerResult {
        let name = queried_component(command);
        match self.registry.get(name) {
            Some(component) => Ok(component
                .status()
                .await
                .unwrap_or_else(|| json!({ "status": "active" }))),
            None if name == command.target => Ok(json!({ "status": "active" })),
            None => Err(format!("Component not found: {}", name)),
        }
    }
}

struct SystemHealthHandler {
    registry: ComponentRegistry,
}

#[async_trait]
impl CommandHandler for SystemHealthHandler {
    async fn handle(&self, command: &Command) -> HandlerResult {
        let name = queried_component(command);
        match self.registry.get(name) {
            Some(component) => {
                let health = component
                    .health_info()
                    .await
                    .unwrap_or_else(HealthInfo::healthy);
                serde_json::to_value(health).map_err(|e| e.to_string())
            }
            None if name == command.target => Ok(json!({ "healthy": true })),
            None => Err(format!("Component not found: {}", name)),
        }
    }
}

#[async_trait]
impl Component for CommandRouter {
    fn name(&self) -> String {
        "command_router".to_string()
    }

    async fn status(&self) -> Option<Value> {
        serde_json::to_value(self.get_status().await).ok()
    }

    async fn health_info(&self) -> Option<HealthInfo> {
        let status = self.get_status().await;
        // A full queue is backpressure, reported but not a fault
        let info = if status.running {
            HealthInfo::healthy()
        } else {
            HealthInfo::unhealthy("processing loop not running")
        };
        Some(info.with_details(json!({
            "queue_size": status.queue_size,
            "active_commands": status.active_commands,
            "saturated": status.queue_size >= self.shared.config.max_queue,
        })))
    }

    fn is_running(&self) -> Option<bool> {
        Some(CommandRouter::is_running(self))
    }

    async fn start(&self) -> std::result::Result<(), String> {
        CommandRouter::start(self).await;
        Ok(())
    }

    async fn stop(&self) -> std::result::Result<(), String> {
        CommandRouter::stop(self).await;
        Ok(())
    }
}
