//! Core abstractions for the workflow engine
//!
//! Task and workflow types, the message bus and task store seams, and the
//! error types every other crate builds on.

mod error;
pub mod events;
mod handler;
mod message;
mod retry;
mod store;
mod task;
mod workflow;

pub use error::{BusError, DispatchError, FlowError, NotificationError, StoreError, TaskError, WorkflowError};
pub use events::*;
pub use handler::{TaskContext, TaskHandler};
pub use message::CompletionNotification;
pub use retry::RetryPolicy;
pub use store::{MemoryTaskStore, TaskRecordStore, MAX_FIELD_LEN};
pub use task::{now_millis, Task, TaskId, TaskStatus};
pub use workflow::{
    ExecutionMode, Progress, TaskSubmission, Workflow, WorkflowId, WorkflowState,
    WorkflowSubmission,
};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, FlowError>;
