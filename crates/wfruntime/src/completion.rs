use crate::dispatcher::Dispatcher;
use crate::registry::{AdvanceResult, NoOpReason, WorkflowRegistry};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wfcore::{
    BusError, CompletionNotification, Delivery, DispatchError, EventBus, Subscription, TaskId,
    TaskStatus, WorkflowEvent, WorkflowId, WorkflowState,
};

/// Pause after a failed receive before polling the bus again
const RECEIVE_BACKOFF: Duration = Duration::from_millis(500);

/// What a completion notification did to its workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Duplicate, late, or unknown notification
    Ignored { task_id: TaskId, reason: NoOpReason },
    /// Task failed; the workflow is FAILED
    Failed { workflow_id: WorkflowId, task_id: TaskId },
    /// Task completed and its successor was dispatched
    Dispatched {
        workflow_id: WorkflowId,
        task_id: TaskId,
        next_task_id: TaskId,
    },
    /// Task completed with nothing new to start (parallel siblings still
    /// running, or the workflow had already failed)
    Completed { workflow_id: WorkflowId, task_id: TaskId },
    /// Last outstanding task completed
    Succeeded { workflow_id: WorkflowId, task_id: TaskId },
}

/// Sole consumer of completion notifications and the only driver of
/// workflow progress after the initial dispatch
pub struct CompletionHandler {
    registry: Arc<WorkflowRegistry>,
    dispatcher: Arc<Dispatcher>,
    events: Arc<EventBus>,
}

impl CompletionHandler {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        dispatcher: Arc<Dispatcher>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            events,
        }
    }

    /// Apply one notification. An `Err` means the successor could not be
    /// dispatched; the notification must be redelivered, not acknowledged.
    pub async fn handle(&self, notification: &CompletionNotification) -> Result<Transition, DispatchError> {
        let mut advanced = match self
            .registry
            .advance_on_completion(&notification.task_id, notification.success)
            .await
        {
            AdvanceResult::NoOp { task_id, reason } => {
                tracing::warn!("Ignoring completion of task {}: {}", task_id, reason);
                return Ok(Transition::Ignored { task_id, reason });
            }
            AdvanceResult::Advanced(advanced) => advanced,
        };

        let workflow_id = advanced.workflow_id().to_string();
        let task_id = advanced.task_id().to_string();

        // Task ownership in the registry decides; the sender's claim is advisory
        if let Some(claimed) = notification.workflow_id.as_deref() {
            if claimed != workflow_id {
                tracing::warn!(
                    "Completion of task {} names workflow {} but the task belongs to {}",
                    task_id,
                    claimed,
                    workflow_id
                );
            }
        }

        if advanced.status == TaskStatus::Failed {
            tracing::warn!(
                "Task {} of workflow {} failed (reported {})",
                task_id,
                workflow_id,
                notification.status
            );
            self.events.emit(WorkflowEvent::TaskFailed {
                workflow_id: workflow_id.clone(),
                task_id: task_id.clone(),
                timestamp: Utc::now(),
            });
            // Only the failure that flipped the workflow reports it
            if matches!(&advanced.workflow.state, WorkflowState::Failed { failed_task } if *failed_task == task_id)
            {
                tracing::error!("Workflow {} failed at task {}", workflow_id, task_id);
                self.events.emit(WorkflowEvent::WorkflowFailed {
                    workflow_id: workflow_id.clone(),
                    failed_task: task_id.clone(),
                    timestamp: Utc::now(),
                });
            }
            return Ok(Transition::Failed {
                workflow_id,
                task_id,
            });
        }

        if !advanced.replayed {
            tracing::info!("Task {} of workflow {} completed successfully", task_id, workflow_id);
            self.events.emit(WorkflowEvent::TaskCompleted {
                workflow_id: workflow_id.clone(),
                task_id: task_id.clone(),
                timestamp: Utc::now(),
            });
        }

        if advanced.workflow.state == WorkflowState::Succeeded {
            tracing::info!("Workflow {} succeeded", workflow_id);
            self.events.emit(WorkflowEvent::WorkflowSucceeded {
                workflow_id: workflow_id.clone(),
                timestamp: Utc::now(),
            });
            return Ok(Transition::Succeeded {
                workflow_id,
                task_id,
            });
        }

        let index = advanced.index;
        match self.dispatcher.start_next(&mut advanced.workflow, index).await? {
            Some(next_task_id) => Ok(Transition::Dispatched {
                workflow_id,
                task_id,
                next_task_id,
            }),
            None => Ok(Transition::Completed {
                workflow_id,
                task_id,
            }),
        }
    }

    /// Consume the completion queue until `shutdown` fires or the bus closes
    ///
    /// Each delivery is acknowledged only after its transition (including any
    /// follow-up dispatch) went through; otherwise it is handed back to the
    /// bus and the idempotent registry absorbs the redelivery.
    pub async fn run(&self, mut subscription: Box<dyn Subscription>, shutdown: CancellationToken) {
        tracing::info!("Waiting for completion notifications");
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Completion handler shutting down");
                    break;
                }
                next = subscription.next() => next,
            };

            match next {
                Ok(Some(delivery)) => self.process(subscription.as_mut(), &delivery).await,
                Ok(None) => {
                    tracing::info!("Completion queue closed");
                    break;
                }
                Err(e) => {
                    tracing::error!("Failed to receive completion: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                    }
                }
            }
        }
    }

    async fn process(&self, subscription: &mut dyn Subscription, delivery: &Delivery) {
        tracing::debug!(
            "Received completion {} ({} bytes{})",
            delivery.tag,
            delivery.payload.len(),
            if delivery.redelivered { ", redelivered" } else { "" }
        );

        let settled = match CompletionNotification::parse(&delivery.payload) {
            Err(e) => {
                // Redelivery cannot repair a malformed message
                tracing::error!("Dropping completion {}: {}", delivery.tag, e);
                subscription.ack(delivery).await
            }
            Ok(notification) => match self.handle(&notification).await {
                Ok(transition) => {
                    tracing::debug!("Completion {} applied: {:?}", delivery.tag, transition);
                    subscription.ack(delivery).await
                }
                Err(e) => {
                    tracing::error!(
                        "Completion of task {} not applied, requesting redelivery: {}",
                        notification.task_id,
                        e
                    );
                    subscription.nack(delivery).await
                }
            },
        };

        if let Err(e) = settled {
            log_settle_error(delivery, &e);
        }
    }
}

fn log_settle_error(delivery: &Delivery, error: &BusError) {
    tracing::error!(
        "Failed to settle completion {} on {}: {}",
        delivery.tag,
        delivery.queue,
        error
    );
}
