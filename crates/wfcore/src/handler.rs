use crate::{Task, TaskError};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Work performed by a worker for one task type
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Task type this handler serves (e.g. "debug.log", "time.delay")
    fn task_type(&self) -> &str;

    /// Short human-readable description
    fn description(&self) -> &str {
        ""
    }

    /// Run the task. `Ok` reports COMPLETED, `Err` reports FAILED.
    async fn execute(&self, ctx: TaskContext) -> Result<(), TaskError>;
}

/// Execution context handed to a handler
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Task record as claimed from the dispatch queue
    pub task: Task,

    /// Whether this claim is a redelivery of an earlier dispatch
    pub redelivered: bool,

    /// Fires when the worker is shutting down
    pub cancellation: CancellationToken,
}

impl TaskContext {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            redelivered: false,
            cancellation: CancellationToken::new(),
        }
    }
}
