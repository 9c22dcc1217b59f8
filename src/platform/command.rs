//! Commands routed to components and the handler interface that executes them

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Outcome of a handler invocation; the error string is recorded on the command
pub type HandlerResult = std::result::Result<Value, String>;

/// Command lifecycle: pending -> processing -> {completed | failed | timeout | cancelled}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed
                | CommandStatus::Failed
                | CommandStatus::Timeout
                | CommandStatus::Cancelled
        )
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandStatus::Pending => write!(f, "pending"),
            CommandStatus::Processing => write!(f, "processing"),
            CommandStatus::Completed => write!(f, "completed"),
            CommandStatus::Failed => write!(f, "failed"),
            CommandStatus::Timeout => write!(f, "timeout"),
            CommandStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A typed request addressed to a target component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command_id: String,
    pub command_type: String,
    pub target: String,
    pub payload: Value,
    pub source: String,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl Command {
    pub fn new(command_type: &str, target: &str, payload: Value, source: &str) -> Self {
        Self {
            command_id: uuid::Uuid::new_v4().to_string(),
            command_type: command_type.to_string(),
            target: target.to_string(),
            payload,
            source: source.to_string(),
            status: CommandStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
        }
    }

    /// Exact handler key, `target.command_type`
    pub fn handler_key(&self) -> String {
        format!("{}.{}", self.target, self.command_type)
    }

    pub(crate) fn mark_processing(&mut self) {
        self.status = CommandStatus::Processing;
        self.started_at = Some(Utc::now());
    }

    /// Move to a terminal status. Returns false (and changes nothing) when the
    /// command already finished, so `completed_at` is written exactly once.
    pub(crate) fn finish(
        &mut self,
        status: CommandStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.result = result;
        self.error = error;
        self.completed_at = Some(Utc::now());
        true
    }

    /// Wall time between start and completion, if both are known
    pub fn processing_time_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Single handler interface chosen at registration time
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &Command) -> HandlerResult;
}

/// Adapter for closures that take the whole command
pub struct CommandFn<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for CommandFn<F>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, command: &Command) -> HandlerResult {
        (self.0)(command.clone()).await
    }
}

/// Adapter for closures that take `(command_type, payload)`
pub struct TypedPayloadFn<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for TypedPayloadFn<F>
where
    F: Fn(String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, command: &Command) -> HandlerResult {
        (self.0)(command.command_type.clone(), command.payload.clone()).await
    }
}

/// Adapter for closures that only need the payload
pub struct PayloadFn<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for PayloadFn<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, command: &Command) -> HandlerResult {
        (self.0)(command.payload.clone()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(CommandFn(f))
}

pub fn typed_handler_fn<F, Fut>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(TypedPayloadFn(f))
}

pub fn payload_handler_fn<F, Fut>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(PayloadFn(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_finish_sets_completed_at_once() {
        let mut cmd = Command::new("status", "system", json!({}), "test");
        cmd.mark_processing();
        assert!(cmd.finish(CommandStatus::Completed, Some(json!(1)), None));
        let first = cmd.completed_at;

        assert!(!cmd.finish(CommandStatus::Cancelled, None, Some("late".into())));
        assert_eq!(cmd.status, CommandStatus::Completed);
        assert_eq!(cmd.completed_at, first);
        assert!(cmd.error.is_none());
    }

    #[test]
    fn test_finish_rejects_non_terminal() {
        let mut cmd = Command::new("status", "system", json!({}), "test");
        assert!(!cmd.finish(CommandStatus::Processing, None, None));
        assert!(cmd.completed_at.is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Command::new("x", "y", Value::Null, "test");
        let b = Command::new("x", "y", Value::Null, "test");
        assert_ne!(a.command_id, b.command_id);
        assert_eq!(a.handler_key(), "y.x");
    }

    #[tokio::test]
    async fn test_adapters_see_expected_arguments() {
        let cmd = Command::new("ping", "bot", json!({"n": 2}), "test");

        let full = handler_fn(|c: Command| async move { Ok(json!(c.target)) });
        assert_eq!(full.handle(&cmd).await.unwrap(), json!("bot"));

        let typed = typed_handler_fn(|t: String, p: Value| async move {
            Ok(json!({ "type": t, "n": p["n"] }))
        });
        assert_eq!(
            typed.handle(&cmd).await.unwrap(),
            json!({"type": "ping", "n": 2})
        );

        let payload_only = payload_handler_fn(|p: Value| async move {
            p["n"].as_i64().map(|n| json!(n * 10)).ok_or("missing n".to_string())
        });
        assert_eq!(payload_only.handle(&cmd).await.unwrap(), json!(20));
    }
}
