//! Buffer entries and their ordering

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Kind of deferred work held by the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferType {
    Command,
    SyncData,
    Heartbeat,
    Event,
    Metric,
}

impl BufferType {
    pub const ALL: [BufferType; 5] = [
        BufferType::Command,
        BufferType::SyncData,
        BufferType::Heartbeat,
        BufferType::Event,
        BufferType::Metric,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BufferType::Command => "command",
            BufferType::SyncData => "sync_data",
            BufferType::Heartbeat => "heartbeat",
            BufferType::Event => "event",
            BufferType::Metric => "metric",
        }
    }
}

impl std::fmt::Display for BufferType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Derived status used by status queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Processed,
    Failed,
    Expired,
}

/// A prioritized, optionally time-limited unit of deferred work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferEntry {
    pub entry_id: String,
    pub buffer_type: BufferType,
    pub data: Value,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub processed: bool,
    /// Retries exhausted or rejected outright; never picked again
    #[serde(default)]
    pub failed: bool,
    pub error: Option<String>,
}

impl BufferEntry {
    pub fn new(
        buffer_type: BufferType,
        data: Value,
        priority: i32,
        ttl: Option<chrono::Duration>,
        max_retries: u32,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            entry_id: uuid::Uuid::new_v4().to_string(),
            buffer_type,
            data,
            priority,
            created_at,
            expires_at: ttl.map(|ttl| created_at + ttl),
            retry_count: 0,
            max_retries,
            processed: false,
            failed: false,
            error: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now > at).unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Still eligible for processing
    pub fn is_pending_at(&self, now: DateTime<Utc>) -> bool {
        !self.processed && !self.failed && !self.is_expired_at(now)
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> EntryStatus {
        if self.processed {
            EntryStatus::Processed
        } else if self.failed {
            EntryStatus::Failed
        } else if self.is_expired_at(now) {
            EntryStatus::Expired
        } else {
            EntryStatus::Pending
        }
    }
}

/// Processing order: priority descending, then oldest first
pub fn processing_order(a: &BufferEntry, b: &BufferEntry) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
}

/// Retention order used by eviction: priority descending, then newest first
pub fn retention_order(a: &BufferEntry, b: &BufferEntry) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| b.created_at.cmp(&a.created_at))
}
