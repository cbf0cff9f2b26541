use async_trait::async_trait;
use wfcore::{TaskContext, TaskError, TaskHandler};

/// Logs the task it was given and succeeds
pub struct DebugLogHandler;

#[async_trait]
impl TaskHandler for DebugLogHandler {
    fn task_type(&self) -> &str {
        "debug.log"
    }

    fn description(&self) -> &str {
        "Logs the task record and completes"
    }

    async fn execute(&self, ctx: TaskContext) -> Result<(), TaskError> {
        tracing::info!(
            "DEBUG: task {} of workflow {}{}",
            ctx.task.id,
            ctx.task.workflow_id,
            if ctx.redelivered { " (redelivered)" } else { "" }
        );
        Ok(())
    }
}

/// Always fails; useful for exercising failure paths
pub struct FailHandler;

#[async_trait]
impl TaskHandler for FailHandler {
    fn task_type(&self) -> &str {
        "debug.fail"
    }

    fn description(&self) -> &str {
        "Fails every task it receives"
    }

    async fn execute(&self, ctx: TaskContext) -> Result<(), TaskError> {
        Err(TaskError::ExecutionFailed(format!(
            "task {} failed on purpose",
            ctx.task.id
        )))
    }
}
