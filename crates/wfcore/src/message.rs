use crate::task::{Task, TaskId};
use crate::NotificationError;
use serde_json::Value as Json;

/// A worker's report that a task reached a terminal outcome
///
/// The payload on the completion queue is the full task record; only the id
/// and the status are needed to advance a workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionNotification {
    pub task_id: TaskId,
    pub workflow_id: Option<String>,
    pub success: bool,
    /// Raw status string as sent by the worker
    pub status: String,
}

impl CompletionNotification {
    pub fn success(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            workflow_id: None,
            success: true,
            status: "COMPLETED".to_string(),
        }
    }

    pub fn failure(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            workflow_id: None,
            success: false,
            status: "FAILED".to_string(),
        }
    }

    /// Parse a completion-queue payload. `COMPLETED` in any case means
    /// success; every other status is a failure.
    pub fn parse(payload: &[u8]) -> Result<Self, NotificationError> {
        let json: Json = serde_json::from_slice(payload)
            .map_err(|e| NotificationError::Malformed(e.to_string()))?;
        let object = json
            .as_object()
            .ok_or_else(|| NotificationError::Malformed("expected a JSON object".to_string()))?;

        let task_id = object
            .get("id")
            .and_then(Json::as_str)
            .filter(|id| !id.is_empty())
            .ok_or(NotificationError::MissingField("id"))?;
        let status = object
            .get("status")
            .and_then(Json::as_str)
            .ok_or(NotificationError::MissingField("status"))?;
        let workflow_id = object
            .get("workflowId")
            .and_then(Json::as_str)
            .map(str::to_string);

        Ok(Self {
            task_id: task_id.to_string(),
            workflow_id,
            success: status.eq_ignore_ascii_case("COMPLETED"),
            status: status.to_string(),
        })
    }

    /// Payload a worker publishes for a finished task record
    pub fn encode(task: &Task) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(task)
    }
}
