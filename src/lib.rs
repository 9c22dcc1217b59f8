pub mod balancer;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod error;
pub mod persistence;
pub mod platform;
pub mod supervisor;

pub use balancer::{BalancerConfig, LoadBalancer, Strategy, TaskPriority};
pub use config::AppConfig;
pub use coordination::{
    ComponentState, HeartbeatSystem, LifecycleEvent, LifecycleManager, SyncConfig, SyncManager,
    ToggleDispatcher, ToggleState,
};
pub use coordinator::ControlPlane;
pub use error::{Result, SwitchboardError};
pub use persistence::{BufferConfig, BufferEntry, BufferSystem, BufferType};
pub use platform::{Command, CommandRouter, CommandStatus, Component, ComponentRegistry};
pub use supervisor::{
    FailsafeCondition, FailsafeConfig, FailsafeEvent, FailsafeLevel, FailsafeMonitor,
};
