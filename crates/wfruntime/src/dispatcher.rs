use crate::RuntimeConfig;
use chrono::Utc;
use std::sync::Arc;
use wfcore::{
    BusError, DispatchError, EventBus, MessageBus, RetryPolicy, TaskId, TaskRecordStore,
    TaskStatus, Workflow, WorkflowEvent,
};

/// Turns "this task may run now" into a stored record plus a published message
///
/// Every method takes the workflow by `&mut`, which callers obtain from the
/// registry's per-workflow lock.
pub struct Dispatcher {
    store: Arc<dyn TaskRecordStore>,
    bus: Arc<dyn MessageBus>,
    events: Arc<EventBus>,
    queue: String,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskRecordStore>,
        bus: Arc<dyn MessageBus>,
        events: Arc<EventBus>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            store,
            bus,
            events,
            queue: config.dispatch_queue.clone(),
            retry: config.retry.clone(),
        }
    }

    /// Start the first task (sequential) or every task (parallel)
    pub async fn start_initial(&self, workflow: &mut Workflow) -> Result<Vec<TaskId>, DispatchError> {
        tracing::info!(
            "Starting workflow {} ({:?}, {} tasks)",
            workflow.id,
            workflow.execution_mode,
            workflow.tasks.len()
        );
        self.start_eligible(workflow).await
    }

    /// Start the successor of a completed task. Parallel workflows and the
    /// last task of a sequential one have no successor.
    pub async fn start_next(
        &self,
        workflow: &mut Workflow,
        completed_index: usize,
    ) -> Result<Option<TaskId>, DispatchError> {
        if workflow.is_terminal() {
            return Ok(None);
        }
        let Some(next) = workflow.next_index(completed_index) else {
            return Ok(None);
        };
        if workflow.tasks[next].status != TaskStatus::Pending {
            tracing::debug!(
                "Task {} of workflow {} already started",
                workflow.tasks[next].id,
                workflow.id
            );
            return Ok(None);
        }
        self.start_task(workflow, next).await.map(Some)
    }

    /// Start every task that is eligible but was never dispatched
    pub async fn resume(&self, workflow: &mut Workflow) -> Result<Vec<TaskId>, DispatchError> {
        tracing::info!("Resuming workflow {}", workflow.id);
        self.start_eligible(workflow).await
    }

    async fn start_eligible(&self, workflow: &mut Workflow) -> Result<Vec<TaskId>, DispatchError> {
        let mut started = Vec::new();
        let mut first_error = None;

        // A parallel sibling failing to start does not stop the others
        for index in workflow.eligible_indices() {
            match self.start_task(workflow, index).await {
                Ok(task_id) => started.push(task_id),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(started),
        }
    }

    async fn start_task(&self, workflow: &mut Workflow, index: usize) -> Result<TaskId, DispatchError> {
        let mut record = workflow.tasks[index].clone();
        record.status = TaskStatus::Pending;
        let task_id = record.id.clone();

        let stored = self
            .retry
            .run("persist task", || self.store.upsert(&record))
            .await
            .map_err(|source| {
                tracing::error!("Failed to persist task {} of workflow {}: {}", task_id, workflow.id, source);
                DispatchError::Persistence {
                    task_id: task_id.clone(),
                    source,
                }
            });
        let stored = match stored {
            Ok(stored) => stored,
            Err(e) => return Err(self.failed(workflow, e)),
        };

        let task = &mut workflow.tasks[index];
        task.created_at = stored.created_at;
        task.updated_at = stored.updated_at;

        let published = match serde_json::to_vec(&stored) {
            Ok(payload) => {
                self.retry
                    .run("publish task", || self.bus.publish(&self.queue, payload.clone()))
                    .await
            }
            Err(e) => Err(BusError::PublishFailed {
                queue: self.queue.clone(),
                reason: e.to_string(),
            }),
        };
        if let Err(source) = published {
            tracing::error!("Failed to publish task {} of workflow {}: {}", task_id, workflow.id, source);
            let e = DispatchError::Publish {
                task_id: task_id.clone(),
                source,
            };
            return Err(self.failed(workflow, e));
        }

        // Only a confirmed publish moves the task out of PENDING
        workflow.mark_started(index);
        tracing::info!(
            "Dispatched task {} ({}) of workflow {}",
            task_id,
            stored.task_type,
            workflow.id
        );
        self.events.emit(WorkflowEvent::TaskDispatched {
            workflow_id: workflow.id.clone(),
            task_id: task_id.clone(),
            task_type: stored.task_type,
            timestamp: Utc::now(),
        });
        Ok(task_id)
    }

    fn failed(&self, workflow: &Workflow, error: DispatchError) -> DispatchError {
        self.events.emit(WorkflowEvent::DispatchFailed {
            workflow_id: workflow.id.clone(),
            task_id: error.task_id().to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        });
        error
    }
}
