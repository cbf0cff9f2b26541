use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type TaskId = String;

/// Lifecycle status of a single task
///
/// Transitions only move forward: `Pending -> InProgress -> {Completed | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` respects the forward-only order
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::InProgress) => true,
            (Self::InProgress, Self::Completed | Self::Failed) => true,
            _ => false,
        }
    }

    /// Position in the lifecycle; both terminal statuses share the last rank
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task reference as held by a workflow, persisted in the task store and
/// carried on both queues
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    pub workflow_id: String,
    pub status: TaskStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    /// Admit a new task with a fresh id
    pub fn new(task_type: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), task_type, workflow_id)
    }

    pub fn with_id(
        id: impl Into<String>,
        task_type: impl Into<String>,
        workflow_id: impl Into<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            task_type: task_type.into(),
            workflow_id: workflow_id.into(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next` if the transition is legal, bumping `updated_at`
    pub fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = now_millis();
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
