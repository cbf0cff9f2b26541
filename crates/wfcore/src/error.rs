use crate::TaskStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Message bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Task store error: {0}")]
    Store(#[from] StoreError),

    #[error("Notification error: {0}")]
    Notification(#[from] NotificationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("Workflow already registered: {0}")]
    Duplicate(String),

    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task id already in use: {0}")]
    DuplicateTask(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),
}

/// Failure to start a task; the task stays un-started
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Failed to persist task {task_id}: {source}")]
    Persistence {
        task_id: String,
        #[source]
        source: StoreError,
    },

    #[error("Failed to publish task {task_id}: {source}")]
    Publish {
        task_id: String,
        #[source]
        source: BusError,
    },
}

impl DispatchError {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Persistence { task_id, .. } | Self::Publish { task_id, .. } => task_id,
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum BusError {
    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),

    #[error("Failed to publish to '{queue}': {reason}")]
    PublishFailed { queue: String, reason: String },

    #[error("Failed to receive from '{queue}': {reason}")]
    ReceiveFailed { queue: String, reason: String },

    #[error("Failed to acknowledge delivery {delivery_tag}: {reason}")]
    AckFailed { delivery_tag: u64, reason: String },

    #[error("Subscription closed")]
    Closed,
}

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Task record not found: {0}")]
    NotFound(String),

    #[error("Field '{field}' exceeds {max} characters")]
    FieldTooLong { field: &'static str, max: usize },

    #[error("Task {id} cannot move from {from} to {to}")]
    StatusRegression {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotificationError {
    #[error("Malformed notification: {0}")]
    Malformed(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

/// Outcome of a task handler that did not succeed
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error("No handler registered for task type: {0}")]
    UnknownType(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Cancelled")]
    Cancelled,
}
