//! Coordination Layer
//!
//! - Feature toggles consulted by the other components
//! - Clock and state synchronization checks
//! - Periodic heartbeat with silence detection
//! - Lifecycle management for ordered component startup/shutdown

pub mod heartbeat;
pub mod lifecycle;
pub mod sync;
pub mod toggles;

pub use heartbeat::{
    observer_fn, BeatStatus, Heartbeat, HeartbeatAlert, HeartbeatMetrics, HeartbeatObserver,
    HeartbeatSystem,
};
pub use lifecycle::{ComponentState, LifecycleConfig, LifecycleEvent, LifecycleManager};
pub use sync::{
    DriftAnalysis, DriftTrend, StateConsistency, SyncAlert, SyncConfig, SyncManager, SyncMetrics,
    SyncRecord, SyncStatus, SyncValidation, TimeSyncResult,
};
pub use toggles::{
    callback_fn, validator_fn, CallbackKind, ToggleCallback, ToggleChange, ToggleDispatcher,
    ToggleGate, ToggleInfo, ToggleMetrics, ToggleState, ToggleValidator, Transition,
};
