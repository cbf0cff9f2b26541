// crates/wfcore/src/events/mod.rs

mod base;
#[cfg(feature = "iggy")]
mod iggy_bus;
mod queue;

pub use base::{EventBus, WorkflowEvent};
#[cfg(feature = "iggy")]
pub use iggy_bus::{IggyBus, IggyBusConfig};
pub use queue::{Delivery, MemoryBus, MessageBus, Subscription, TASK_COMPLETION_QUEUE, TASK_QUEUE};
