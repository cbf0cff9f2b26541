//! Task workers
//!
//! Claims dispatched tasks from the bus, runs the handler registered for the
//! task type and reports the outcome on the completion queue.

mod debug;
mod executor;
mod registry;
mod time;

pub use debug::{DebugLogHandler, FailHandler};
pub use executor::{spawn_workers, WorkerConfig, WorkerExecutor};
pub use registry::HandlerRegistry;
pub use time::DelayHandler;

use std::sync::Arc;

/// Register all built-in handlers with a registry
pub fn register_all(registry: &mut HandlerRegistry, config: &WorkerConfig) {
    registry.register(Arc::new(DebugLogHandler));
    registry.register(Arc::new(FailHandler));
    registry.register(Arc::new(DelayHandler::new(config.task_delay)));
}
