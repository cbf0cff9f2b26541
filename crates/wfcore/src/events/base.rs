use crate::{ExecutionMode, TaskId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted while the engine drives workflows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkflowEvent {
    WorkflowRegistered {
        workflow_id: WorkflowId,
        name: String,
        execution_mode: ExecutionMode,
        task_count: usize,
        timestamp: DateTime<Utc>,
    },
    TaskDispatched {
        workflow_id: WorkflowId,
        task_id: TaskId,
        task_type: String,
        timestamp: DateTime<Utc>,
    },
    DispatchFailed {
        workflow_id: WorkflowId,
        task_id: TaskId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        workflow_id: WorkflowId,
        task_id: TaskId,
        timestamp: DateTime<Utc>,
    },
    TaskFailed {
        workflow_id: WorkflowId,
        task_id: TaskId,
        timestamp: DateTime<Utc>,
    },
    WorkflowSucceeded {
        workflow_id: WorkflowId,
        timestamp: DateTime<Utc>,
    },
    WorkflowFailed {
        workflow_id: WorkflowId,
        failed_task: TaskId,
        timestamp: DateTime<Utc>,
    },
}

impl WorkflowEvent {
    pub fn workflow_id(&self) -> &str {
        match self {
            Self::WorkflowRegistered { workflow_id, .. }
            | Self::TaskDispatched { workflow_id, .. }
            | Self::DispatchFailed { workflow_id, .. }
            | Self::TaskCompleted { workflow_id, .. }
            | Self::TaskFailed { workflow_id, .. }
            | Self::WorkflowSucceeded { workflow_id, .. }
            | Self::WorkflowFailed { workflow_id, .. } => workflow_id,
        }
    }

    /// Whether this event ends the workflow
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowSucceeded { .. } | Self::WorkflowFailed { .. }
        )
    }
}

/// In-process broadcast of engine events
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Emit to current subscribers; events with no listener are dropped
    pub fn emit(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
