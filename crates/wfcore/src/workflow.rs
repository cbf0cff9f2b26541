use crate::task::{now_millis, Task, TaskId, TaskStatus};
use crate::WorkflowError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

pub type WorkflowId = String;

/// Whether tasks depend on their predecessor or all start together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

/// Progress cursor of a running workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Progress {
    /// Index of the task currently in flight, or the next one to start
    Sequential { index: usize },
    /// Tasks not yet in a terminal status
    Parallel { outstanding: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Created,
    Running { progress: Progress },
    Succeeded,
    #[serde(rename_all = "camelCase")]
    Failed { failed_task: TaskId },
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

/// A registered workflow and the current status of each of its tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub execution_mode: ExecutionMode,
    pub tasks: Vec<Task>,
    pub state: WorkflowState,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Workflow {
    /// Position of a task in this workflow's sequence
    pub fn position(&self, task_id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == task_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Successor of a completed task, if the mode has one
    pub fn next_index(&self, completed_index: usize) -> Option<usize> {
        match self.execution_mode {
            ExecutionMode::Sequential if completed_index + 1 < self.tasks.len() => {
                Some(completed_index + 1)
            }
            _ => None,
        }
    }

    /// Indices of tasks that may start now but have not been started
    pub fn eligible_indices(&self) -> Vec<usize> {
        if self.is_terminal() {
            return Vec::new();
        }
        match self.execution_mode {
            ExecutionMode::Sequential => self
                .tasks
                .iter()
                .position(|t| t.status != TaskStatus::Completed)
                .filter(|&i| self.tasks[i].status == TaskStatus::Pending)
                .into_iter()
                .collect(),
            ExecutionMode::Parallel => self
                .tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.status == TaskStatus::Pending)
                .map(|(i, _)| i)
                .collect(),
        }
    }

    /// Mark a task dispatched. Returns false if it was not pending.
    pub fn mark_started(&mut self, index: usize) -> bool {
        let moved = self
            .tasks
            .get_mut(index)
            .map(|t| t.transition(TaskStatus::InProgress))
            .unwrap_or(false);
        if moved {
            self.refresh_state();
        }
        moved
    }

    /// Record a terminal outcome for an in-flight task
    pub fn record_outcome(&mut self, index: usize, success: bool) -> bool {
        let next = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        let moved = self
            .tasks
            .get_mut(index)
            .map(|t| t.transition(next))
            .unwrap_or(false);
        if moved {
            self.refresh_state();
        }
        moved
    }

    fn refresh_state(&mut self) {
        self.updated_at = now_millis();

        // Failure is sticky: the first failed task decides the outcome
        if matches!(self.state, WorkflowState::Failed { .. }) {
            return;
        }
        if let Some(failed) = self.tasks.iter().find(|t| t.status == TaskStatus::Failed) {
            self.state = WorkflowState::Failed {
                failed_task: failed.id.clone(),
            };
            return;
        }
        if self.tasks.iter().all(|t| t.status == TaskStatus::Completed) {
            self.state = WorkflowState::Succeeded;
            return;
        }
        if self.tasks.iter().all(|t| t.status == TaskStatus::Pending) {
            self.state = WorkflowState::Created;
            return;
        }

        let progress = match self.execution_mode {
            ExecutionMode::Sequential => {
                let index = self
                    .tasks
                    .iter()
                    .position(|t| t.status != TaskStatus::Completed)
                    .unwrap_or(self.tasks.len());
                Progress::Sequential { index }
            }
            ExecutionMode::Parallel => Progress::Parallel {
                outstanding: self.tasks.iter().filter(|t| !t.is_terminal()).count(),
            },
        };
        self.state = WorkflowState::Running { progress };
    }
}

/// Inbound request to create a workflow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSubmission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<WorkflowId>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<TaskSubmission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<ExecutionMode>,
    /// Older clients send a boolean instead of `executionMode`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    #[serde(rename = "type")]
    pub task_type: String,
}

impl WorkflowSubmission {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_task(mut self, task_type: impl Into<String>) -> Self {
        self.tasks.push(TaskSubmission {
            id: None,
            task_type: task_type.into(),
        });
        self
    }

    pub fn with_task_id(mut self, id: impl Into<String>, task_type: impl Into<String>) -> Self {
        self.tasks.push(TaskSubmission {
            id: Some(id.into()),
            task_type: task_type.into(),
        });
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = Some(mode);
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        match (self.execution_mode, self.parallel) {
            (Some(mode), _) => mode,
            (None, Some(true)) => ExecutionMode::Parallel,
            _ => ExecutionMode::Sequential,
        }
    }

    /// Validate the request and admit it as a workflow, assigning any
    /// missing workflow or task ids
    pub fn into_workflow(self) -> Result<Workflow, WorkflowError> {
        let mode = self.mode();
        if self.name.trim().is_empty() {
            return Err(WorkflowError::Invalid("name must not be empty".to_string()));
        }
        if self.tasks.is_empty() {
            return Err(WorkflowError::Invalid(
                "workflow must contain at least one task".to_string(),
            ));
        }

        let id = match self.id {
            Some(id) if id.trim().is_empty() => {
                return Err(WorkflowError::Invalid("id must not be empty".to_string()))
            }
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };

        let mut seen = HashSet::new();
        let mut tasks = Vec::with_capacity(self.tasks.len());
        for submitted in self.tasks {
            if submitted.task_type.trim().is_empty() {
                return Err(WorkflowError::Invalid(
                    "task type must not be empty".to_string(),
                ));
            }
            let task = match submitted.id {
                Some(task_id) if !task_id.is_empty() => {
                    Task::with_id(task_id, submitted.task_type, id.clone())
                }
                _ => Task::new(submitted.task_type, id.clone()),
            };
            if !seen.insert(task.id.clone()) {
                return Err(WorkflowError::DuplicateTask(task.id));
            }
            tasks.push(task);
        }

        let now = now_millis();
        Ok(Workflow {
            id,
            name: self.name,
            execution_mode: mode,
            tasks,
            state: WorkflowState::Created,
            created_at: now,
            updated_at: now,
        })
    }
}
