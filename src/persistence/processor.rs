//! Entry processors
//!
//! Each buffer type is drained by one processor. Command entries are replayed
//! into the command router; other types default to a logging pass-through.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use super::entry::BufferEntry;
use crate::platform::CommandRouter;

/// Result of processing one entry
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessResult {
    /// Done; the entry is marked processed
    Processed,
    /// Failed; counts against the entry's retry budget
    Retry { error: String },
    /// Failed permanently; the entry is abandoned immediately
    Abandon { error: String },
}

#[async_trait]
pub trait EntryProcessor: Send + Sync {
    async fn process(&self, entry: &BufferEntry) -> ProcessResult;
}

/// Default processor: logs the payload and accepts it
pub struct LoggingProcessor;

#[async_trait]
impl EntryProcessor for LoggingProcessor {
    async fn process(&self, entry: &BufferEntry) -> ProcessResult {
        info!(
            "Processing {} entry {}: {}",
            entry.buffer_type, entry.entry_id, entry.data
        );
        ProcessResult::Processed
    }
}

/// Replays buffered commands through the router queue
pub struct CommandReplayProcessor {
    router: Arc<CommandRouter>,
}

impl CommandReplayProcessor {
    pub fn new(router: Arc<CommandRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl EntryProcessor for CommandReplayProcessor {
    async fn process(&self, entry: &BufferEntry) -> ProcessResult {
        let data = &entry.data;
        let (Some(command_type), Some(target)) = (
            data.get("command_type").and_then(Value::as_str),
            data.get("target").and_then(Value::as_str),
        ) else {
            return ProcessResult::Abandon {
                error: "command entry missing command_type or target".to_string(),
            };
        };
        let payload = data.get("payload").cloned().unwrap_or(Value::Null);
        let source = data
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or("buffer_system");

        match self
            .router
            .queue_command(command_type, target, payload, source)
            .await
        {
            Ok(command_id) => {
                debug!("Command queued from buffer: {}", command_id);
                ProcessResult::Processed
            }
            Err(e) => ProcessResult::Retry {
                error: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::entry::BufferType;
    use crate::platform::{ComponentRegistry, RouterConfig};
    use serde_json::json;

    #[tokio::test]
    async fn test_command_replay_queues() {
        let router = Arc::new(CommandRouter::new(
            RouterConfig::default(),
            ComponentRegistry::new(),
        ));
        let processor = CommandReplayProcessor::new(router.clone());

        let entry = BufferEntry::new(
            BufferType::Command,
            json!({ "command_type": "status", "target": "system", "payload": {} }),
            0,
            None,
            3,
        );
        assert_eq!(processor.process(&entry).await, ProcessResult::Processed);
        assert_eq!(router.get_status().await.active_commands, 1);
    }

    #[tokio::test]
    async fn test_malformed_command_abandoned() {
        let router = Arc::new(CommandRouter::new(
            RouterConfig::default(),
            ComponentRegistry::new(),
        ));
        let processor = CommandReplayProcessor::new(router);
        let entry = BufferEntry::new(BufferType::Command, json!({}), 0, None, 3);
        assert!(matches!(
            processor.process(&entry).await,
            ProcessResult::Abandon { .. }
        ));
    }

    #[tokio::test]
    async fn test_full_router_means_retry() {
        let router = Arc::new(CommandRouter::new(
            RouterConfig {
                max_queue: 1,
                ..Default::default()
            },
            ComponentRegistry::new(),
        ));
        router
            .queue_command("noop", "bot", Value::Null, "test")
            .await
            .unwrap();

        let processor = CommandReplayProcessor::new(router);
        let entry = BufferEntry::new(
            BufferType::Command,
            json!({ "command_type": "noop", "target": "bot" }),
            0,
            None,
            3,
        );
        assert!(matches!(
            processor.process(&entry).await,
            ProcessResult::Retry { .. }
        ));
    }
}
