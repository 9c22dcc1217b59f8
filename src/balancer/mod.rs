//! Load Balancer - typed task distribution over a worker pool

#[allow(clippy::module_inception)]
mod balancer;
mod queue;
mod strategy;
mod task;

pub use balancer::{
    BalancerConfig, BalancerMetrics, BalancerStatus, LoadBalancer, ScheduleOutcome, WorkerStatus,
    ANY_TASK_TYPE,
};
pub use queue::{QueueStats, TaskQueue};
pub use strategy::{Strategy, WorkerLoad};
pub use task::{task_handler_fn, Task, TaskHandler, TaskPriority, TaskResult, TaskStatus};
