use async_trait::async_trait;
use std::time::Duration;
use wfcore::{TaskContext, TaskError, TaskHandler};

/// Simulates a long-running task by sleeping
pub struct DelayHandler {
    delay: Duration,
}

impl DelayHandler {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl TaskHandler for DelayHandler {
    fn task_type(&self) -> &str {
        "time.delay"
    }

    fn description(&self) -> &str {
        "Sleeps for the configured task delay"
    }

    async fn execute(&self, ctx: TaskContext) -> Result<(), TaskError> {
        tracing::info!("Delaying task {} for {}ms", ctx.task.id, self.delay.as_millis());

        tokio::select! {
            _ = ctx.cancellation.cancelled() => Err(TaskError::Cancelled),
            _ = tokio::time::sleep(self.delay) => Ok(()),
        }
    }
}
