//! Supervisor Layer
//!
//! - Failsafe monitor polling component health
//! - Sliding-window condition thresholds
//! - Remediation playbook (restart, halt, alert, audit log)

pub mod event;
pub mod failsafe;
pub mod playbook;

pub use event::{ActionRecord, FailsafeCondition, FailsafeEvent, FailsafeLevel};
pub use failsafe::{
    health_check_fn, ComponentHealth, ConditionThreshold, FailsafeConfig, FailsafeMonitor,
    FailsafeStatus, HealthCheck,
};
pub use playbook::{
    action_fn, format_alert, ActionHandler, ActionResult, ActionSummary, AlertSink,
    FailsafeAction,
};
