//! Platform - component registry and command routing
//!
//! Components register once under a name; commands addressed to them are
//! queued, routed to a handler and executed under a deadline.

mod command;
mod router;
mod traits;

pub use command::{
    handler_fn, payload_handler_fn, typed_handler_fn, Command, CommandHandler, CommandStatus,
    HandlerResult,
};
pub use router::{CommandOutcome, CommandRouter, RouterConfig, RouterMetrics, RouterStatus};
pub use traits::{Component, ComponentRegistry, HealthInfo};

#[cfg(test)]
pub use traits::MockComponent;
