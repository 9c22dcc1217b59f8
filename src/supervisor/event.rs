//! Failsafe events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::error::SwitchboardError;

/// Kind of condition a failsafe event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailsafeCondition {
    SyncFailure,
    HeartbeatFailure,
    ComponentFailure,
    ResourceExhaustion,
    CommandFailure,
    NetworkFailure,
    Custom,
}

impl FailsafeCondition {
    pub const ALL: [FailsafeCondition; 7] = [
        FailsafeCondition::SyncFailure,
        FailsafeCondition::HeartbeatFailure,
        FailsafeCondition::ComponentFailure,
        FailsafeCondition::ResourceExhaustion,
        FailsafeCondition::CommandFailure,
        FailsafeCondition::NetworkFailure,
        FailsafeCondition::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailsafeCondition::SyncFailure => "sync_failure",
            FailsafeCondition::HeartbeatFailure => "heartbeat_failure",
            FailsafeCondition::ComponentFailure => "component_failure",
            FailsafeCondition::ResourceExhaustion => "resource_exhaustion",
            FailsafeCondition::CommandFailure => "command_failure",
            FailsafeCondition::NetworkFailure => "network_failure",
            FailsafeCondition::Custom => "custom",
        }
    }
}

impl std::fmt::Display for FailsafeCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FailsafeCondition {
    type Err = SwitchboardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailsafeCondition::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| SwitchboardError::Validation(format!("unknown condition: {}", s)))
    }
}

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailsafeLevel {
    /// Actions at this level run for every matching condition
    Info,
    Warning,
    Critical,
    Emergency,
}

impl FailsafeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailsafeLevel::Info => "info",
            FailsafeLevel::Warning => "warning",
            FailsafeLevel::Critical => "critical",
            FailsafeLevel::Emergency => "emergency",
        }
    }
}

impl std::fmt::Display for FailsafeLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One action execution, recorded on the event and in the action history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub event_id: String,
    pub action_id: String,
    pub name: String,
    pub executed_at: DateTime<Utc>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl ActionRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailsafeEvent {
    pub event_id: String,
    pub condition: FailsafeCondition,
    pub level: FailsafeLevel,
    pub message: String,
    pub component: String,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    pub resolved: bool,
    pub actions_taken: Vec<ActionRecord>,
}

impl FailsafeEvent {
    pub fn new(
        condition: FailsafeCondition,
        level: FailsafeLevel,
        message: impl Into<String>,
        component: impl Into<String>,
        metadata: Value,
    ) -> Self {
        Self {
            event_id: format!("fs_{}", uuid::Uuid::new_v4().simple()),
            condition,
            level,
            message: message.into(),
            component: component.into(),
            metadata,
            timestamp: Utc::now(),
            acknowledged: false,
            resolved: false,
            actions_taken: Vec::new(),
        }
    }
}
