use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use wfcore::{ExecutionMode, TaskId, TaskStatus, Workflow, WorkflowError, WorkflowId};

/// Exclusive access to one registered workflow
///
/// Holding a guard serializes everything touching that workflow id while
/// leaving every other workflow free to progress.
pub type WorkflowGuard = OwnedMutexGuard<Workflow>;

type Slot = Arc<Mutex<Workflow>>;

#[derive(Default)]
struct Index {
    workflows: HashMap<WorkflowId, Slot>,
    owners: HashMap<TaskId, WorkflowId>,
    order: Vec<WorkflowId>,
}

/// Why a completion notification changed nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    /// No registered workflow owns the task id
    UnknownTask,
    /// The task already reached this terminal status
    AlreadyTerminal(TaskStatus),
    /// The task was never dispatched, so it cannot have finished
    NotDispatched,
}

impl fmt::Display for NoOpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownTask => f.write_str("unknown task"),
            Self::AlreadyTerminal(status) => write!(f, "already {}", status),
            Self::NotDispatched => f.write_str("task was never dispatched"),
        }
    }
}

/// A completion that was applied to its workflow
///
/// The workflow stays locked until this value is dropped, so the follow-up
/// dispatch runs inside the same critical section.
pub struct Advanced {
    pub workflow: WorkflowGuard,
    pub index: usize,
    pub status: TaskStatus,
    /// Redelivered success for a task whose successor never got dispatched
    pub replayed: bool,
}

impl Advanced {
    pub fn workflow_id(&self) -> &str {
        &self.workflow.id
    }

    pub fn task_id(&self) -> &str {
        &self.workflow.tasks[self.index].id
    }

    pub fn mode(&self) -> ExecutionMode {
        self.workflow.execution_mode
    }

    pub fn workflow_is_terminal(&self) -> bool {
        self.workflow.is_terminal()
    }
}

pub enum AdvanceResult {
    NoOp { task_id: TaskId, reason: NoOpReason },
    Advanced(Advanced),
}

/// In-memory owner of every registered workflow
///
/// The id index sits behind a short-lived `RwLock` that is never held across
/// I/O; each workflow has its own async mutex.
#[derive(Default)]
pub struct WorkflowRegistry {
    index: RwLock<Index>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new workflow and return it already locked, so nothing can
    /// observe or advance it before the caller has dispatched its first tasks
    pub async fn register(&self, workflow: Workflow) -> Result<WorkflowGuard, WorkflowError> {
        let workflow_id = workflow.id.clone();
        let task_ids: Vec<TaskId> = workflow.tasks.iter().map(|t| t.id.clone()).collect();
        let slot: Slot = Arc::new(Mutex::new(workflow));
        let guard = slot.clone().lock_owned().await;

        let mut index = self.index.write().await;
        if index.workflows.contains_key(&workflow_id) {
            return Err(WorkflowError::Duplicate(workflow_id));
        }
        if let Some(taken) = task_ids.iter().find(|id| index.owners.contains_key(*id)) {
            return Err(WorkflowError::DuplicateTask(taken.clone()));
        }

        for task_id in task_ids {
            index.owners.insert(task_id, workflow_id.clone());
        }
        index.workflows.insert(workflow_id.clone(), slot);
        index.order.push(workflow_id.clone());

        tracing::info!("Registered workflow {}", workflow_id);
        Ok(guard)
    }

    fn slot(index: &Index, workflow_id: &str) -> Option<Slot> {
        index.workflows.get(workflow_id).cloned()
    }

    /// Lock one workflow for exclusive access
    pub async fn lock(&self, workflow_id: &str) -> Result<WorkflowGuard, WorkflowError> {
        let slot = Self::slot(&*self.index.read().await, workflow_id)
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;
        Ok(slot.lock_owned().await)
    }

    /// Current snapshot of a workflow
    pub async fn lookup(&self, workflow_id: &str) -> Result<Workflow, WorkflowError> {
        let guard = self.lock(workflow_id).await?;
        Ok(guard.clone())
    }

    /// Snapshots of every workflow in registration order
    pub async fn list(&self) -> Vec<Workflow> {
        let slots: Vec<Slot> = {
            let index = self.index.read().await;
            index
                .order
                .iter()
                .filter_map(|id| Self::slot(&index, id))
                .collect()
        };

        let mut workflows = Vec::with_capacity(slots.len());
        for slot in slots {
            workflows.push(slot.lock().await.clone());
        }
        workflows
    }

    /// Workflow owning a task id
    pub async fn owner(&self, task_id: &str) -> Option<WorkflowId> {
        self.index.read().await.owners.get(task_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.workflows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Apply a task's terminal outcome to its workflow
    ///
    /// Unknown, undispatched and already-terminal tasks produce `NoOp`. The
    /// one exception is a repeated success for a sequential task whose
    /// successor is still pending: that is handed back as a replay so the
    /// caller can retry the dispatch that failed the first time round.
    pub async fn advance_on_completion(&self, task_id: &str, success: bool) -> AdvanceResult {
        let no_op = |reason| AdvanceResult::NoOp {
            task_id: task_id.to_string(),
            reason,
        };

        let slot = {
            let index = self.index.read().await;
            match index
                .owners
                .get(task_id)
                .and_then(|workflow_id| Self::slot(&index, workflow_id))
            {
                Some(slot) => slot,
                None => return no_op(NoOpReason::UnknownTask),
            }
        };

        let mut workflow = slot.lock_owned().await;
        let Some(index) = workflow.position(task_id) else {
            return no_op(NoOpReason::UnknownTask);
        };

        let current = workflow.tasks[index].status;
        match current {
            TaskStatus::Pending => no_op(NoOpReason::NotDispatched),
            TaskStatus::InProgress => {
                workflow.record_outcome(index, success);
                let status = workflow.tasks[index].status;
                tracing::debug!(
                    "Task {} of workflow {} is now {}",
                    task_id,
                    workflow.id,
                    status
                );
                AdvanceResult::Advanced(Advanced {
                    workflow,
                    index,
                    status,
                    replayed: false,
                })
            }
            TaskStatus::Completed if success && successor_pending(&workflow, index) => {
                tracing::info!(
                    "Replaying completion of task {}: successor of workflow {} was never dispatched",
                    task_id,
                    workflow.id
                );
                AdvanceResult::Advanced(Advanced {
                    workflow,
                    index,
                    status: TaskStatus::Completed,
                    replayed: true,
                })
            }
            status => no_op(NoOpReason::AlreadyTerminal(status)),
        }
    }
}

fn successor_pending(workflow: &Workflow, index: usize) -> bool {
    !workflow.is_terminal()
        && workflow
            .next_index(index)
            .map(|next| workflow.tasks[next].status == TaskStatus::Pending)
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wfcore::{WorkflowState, WorkflowSubmission};

    fn workflow(id: &str, types: &[&str]) -> Workflow {
        types
            .iter()
            .fold(WorkflowSubmission::new(id).with_id(id), |s, t| s.with_task(*t))
            .into_workflow()
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_workflow_ids_are_rejected() {
        let registry = WorkflowRegistry::new();
        drop(registry.register(workflow("w1", &["a"])).await.unwrap());

        let err = registry.register(workflow("w1", &["b"])).await.unwrap_err();
        assert_eq!(err, WorkflowError::Duplicate("w1".to_string()));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn task_ids_cannot_be_shared_between_workflows() {
        let registry = WorkflowRegistry::new();
        let first = WorkflowSubmission::new("one")
            .with_task_id("t1", "a")
            .into_workflow()
            .unwrap();
        let second = WorkflowSubmission::new("two")
            .with_task_id("t1", "a")
            .into_workflow()
            .unwrap();

        drop(registry.register(first).await.unwrap());
        let err = registry.register(second).await.unwrap_err();
        assert_eq!(err, WorkflowError::DuplicateTask("t1".to_string()));
    }

    #[tokio::test]
    async fn lookup_of_unknown_workflow_fails() {
        let registry = WorkflowRegistry::new();
        assert_eq!(
            registry.lookup("nope").await.unwrap_err(),
            WorkflowError::NotFound("nope".to_string())
        );
    }

    #[tokio::test]
    async fn completion_of_pending_task_is_ignored() {
        let registry = WorkflowRegistry::new();
        let wf = workflow("w1", &["a"]);
        let task_id = wf.tasks[0].id.clone();
        drop(registry.register(wf).await.unwrap());

        match registry.advance_on_completion(&task_id, true).await {
            AdvanceResult::NoOp { reason, .. } => assert_eq!(reason, NoOpReason::NotDispatched),
            AdvanceResult::Advanced(_) => panic!("pending task must not advance"),
        }
    }

    #[tokio::test]
    async fn second_completion_is_a_no_op() {
        let registry = WorkflowRegistry::new();
        let mut guard = registry.register(workflow("w1", &["a"])).await.unwrap();
        let task_id = guard.tasks[0].id.clone();
        guard.mark_started(0);
        drop(guard);

        match registry.advance_on_completion(&task_id, true).await {
            AdvanceResult::Advanced(advanced) => {
                assert_eq!(advanced.status, TaskStatus::Completed);
                assert!(advanced.workflow_is_terminal());
            }
            AdvanceResult::NoOp { .. } => panic!("first completion must advance"),
        }

        match registry.advance_on_completion(&task_id, true).await {
            AdvanceResult::NoOp { reason, .. } => {
                assert_eq!(reason, NoOpReason::AlreadyTerminal(TaskStatus::Completed))
            }
            AdvanceResult::Advanced(_) => panic!("duplicate must not advance"),
        }
        assert_eq!(
            registry.lookup("w1").await.unwrap().state,
            WorkflowState::Succeeded
        );
    }

    #[tokio::test]
    async fn repeated_success_replays_when_successor_is_pending() {
        let registry = WorkflowRegistry::new();
        let mut guard = registry.register(workflow("w1", &["a", "b"])).await.unwrap();
        let first = guard.tasks[0].id.clone();
        guard.mark_started(0);
        drop(guard);

        assert!(matches!(
            registry.advance_on_completion(&first, true).await,
            AdvanceResult::Advanced(Advanced { replayed: false, .. })
        ));
        // successor was never started, so the redelivery is handed back
        assert!(matches!(
            registry.advance_on_completion(&first, true).await,
            AdvanceResult::Advanced(Advanced { replayed: true, .. })
        ));
        // a contradicting failure for a completed task is ignored
        assert!(matches!(
            registry.advance_on_completion(&first, false).await,
            AdvanceResult::NoOp { .. }
        ));
    }
}
