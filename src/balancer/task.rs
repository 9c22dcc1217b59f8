//! Tasks and task handlers

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::SwitchboardError;

pub type TaskResult = std::result::Result<Value, String>;

/// Task priority; higher variants are scheduled first
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }

    pub fn is_urgent(&self) -> bool {
        *self >= TaskPriority::High
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = SwitchboardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            other => Err(SwitchboardError::Validation(format!(
                "unknown task priority: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Active,
    Completed,
    Failed,
}

/// A typed unit of work distributed to one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub task_type: String,
    pub payload: Value,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: Value, priority: TaskPriority) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            payload,
            priority,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            assigned_at: None,
            completed_at: None,
            worker_id: None,
            result: None,
            error: None,
            retry_count: 0,
        }
    }

    pub(crate) fn assign(&mut self, worker_id: &str) {
        self.status = TaskStatus::Active;
        self.assigned_at = Some(Utc::now());
        self.worker_id = Some(worker_id.to_string());
    }

    /// Record the outcome. Returns false if the task already finished.
    pub(crate) fn finish(&mut self, outcome: TaskResult) -> bool {
        if self.completed_at.is_some() {
            return false;
        }
        self.completed_at = Some(Utc::now());
        match outcome {
            Ok(result) => {
                self.status = TaskStatus::Completed;
                self.result = Some(result);
            }
            Err(error) => {
                self.status = TaskStatus::Failed;
                self.error = Some(error);
            }
        }
        true
    }

    pub fn processing_time_ms(&self) -> Option<f64> {
        match (self.assigned_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_microseconds()? as f64 / 1000.0),
            _ => None,
        }
    }

    pub fn queue_wait_ms(&self) -> Option<f64> {
        let assigned = self.assigned_at?;
        Some((assigned - self.created_at).num_microseconds()? as f64 / 1000.0)
    }
}

/// Executes tasks on behalf of one worker
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task_type: &str, payload: &Value) -> TaskResult;
}

/// Adapter for async closures taking `(task_type, payload)`
pub struct TaskFn<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for TaskFn<F>
where
    F: Fn(String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    async fn handle(&self, task_type: &str, payload: &Value) -> TaskResult {
        (self.0)(task_type.to_string(), payload.clone()).await
    }
}

pub fn task_handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    Arc::new(TaskFn(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_order() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::Normal > TaskPriority::Low);
        assert!(TaskPriority::High.is_urgent());
        assert!(!TaskPriority::Normal.is_urgent());
        assert_eq!("CRITICAL".parse::<TaskPriority>().unwrap(), TaskPriority::Critical);
        assert!("urgent".parse::<TaskPriority>().is_err());
    }

    #[test]
    fn test_finish_once() {
        let mut task = Task::new("ingest", json!({}), TaskPriority::Normal);
        task.assign("w1");
        assert!(task.finish(Err("boom".into())));
        assert!(!task.finish(Ok(json!(1))));
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.result.is_none());
        assert!(task.processing_time_ms().is_some());
    }

    #[tokio::test]
    async fn test_handler_adapter() {
        let handler = task_handler_fn(|t: String, p: Value| async move {
            Ok(json!({ "type": t, "echo": p }))
        });
        let out = handler.handle("ingest", &json!(5)).await.unwrap();
        assert_eq!(out, json!({"type": "ingest", "echo": 5}));
    }
}
