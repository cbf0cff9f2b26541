use crate::task::{now_millis, Task, TaskStatus};
use crate::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Column width of the bounded string fields of a task record
pub const MAX_FIELD_LEN: usize = 255;

/// Durable record of each task's lifecycle, keyed by task id
///
/// Used for audit and display. Workflow ownership is never resolved through
/// the store.
#[async_trait]
pub trait TaskRecordStore: Send + Sync {
    /// Insert or update a record. A missing id is generated. A first insert
    /// stamps `created_at`; every write stamps `updated_at`. A status may only
    /// stay put or move forward; a terminal record never changes status.
    async fn upsert(&self, task: &Task) -> Result<Task, StoreError>;

    async fn find_by_id(&self, id: &str) -> Result<Task, StoreError>;

    async fn list(&self) -> Result<Vec<Task>, StoreError>;
}

fn check_bounds(task: &Task) -> Result<(), StoreError> {
    let fields = [
        ("id", task.id.as_str()),
        ("type", task.task_type.as_str()),
        ("workflowId", task.workflow_id.as_str()),
    ];
    for (field, value) in fields {
        if value.chars().count() > MAX_FIELD_LEN {
            return Err(StoreError::FieldTooLong {
                field,
                max: MAX_FIELD_LEN,
            });
        }
    }
    Ok(())
}

/// Forward moves may skip a lost intermediate write (PENDING straight to
/// COMPLETED); nothing moves backwards or between terminal statuses.
fn check_progress(existing: &Task, next: TaskStatus) -> Result<(), StoreError> {
    if existing.status == next || next.rank() > existing.status.rank() {
        return Ok(());
    }
    Err(StoreError::StatusRegression {
        id: existing.id.clone(),
        from: existing.status,
        to: next,
    })
}

/// Task store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    records: RwLock<HashMap<String, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRecordStore for MemoryTaskStore {
    async fn upsert(&self, task: &Task) -> Result<Task, StoreError> {
        check_bounds(task)?;

        let mut record = task.clone();
        if record.id.is_empty() {
            record.id = Uuid::new_v4().to_string();
        }

        let now = now_millis();
        let mut records = self.records.write().await;
        match records.get(&record.id) {
            Some(existing) => {
                check_progress(existing, record.status)?;
                record.created_at = existing.created_at;
            }
            None => record.created_at = now,
        }
        record.updated_at = now;
        records.insert(record.id.clone(), record.clone());

        tracing::debug!("Stored task {} as {}", record.id, record.status);
        Ok(record)
    }

    async fn find_by_id(&self, id: &str) -> Result<Task, StoreError> {
        self.records
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self.records.read().await.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskStatus;

    #[tokio::test]
    async fn first_insert_stamps_and_later_writes_keep_created_at() {
        let store = MemoryTaskStore::new();
        let mut task = Task::new("a", "w1");
        task.created_at = 0;

        let stored = store.upsert(&task).await.unwrap();
        assert!(stored.created_at > 0);

        let mut update = stored.clone();
        update.status = TaskStatus::InProgress;
        update.created_at = 1;
        let updated = store.upsert(&update).await.unwrap();
        assert_eq!(updated.created_at, stored.created_at);
        assert_eq!(updated.status, TaskStatus::InProgress);
        assert!(updated.updated_at >= stored.updated_at);
    }

    #[tokio::test]
    async fn terminal_records_keep_their_status() {
        let store = MemoryTaskStore::new();
        let mut task = Task::new("a", "w1");
        task.status = TaskStatus::Completed;
        let stored = store.upsert(&task).await.unwrap();

        for next in [TaskStatus::InProgress, TaskStatus::Pending, TaskStatus::Failed] {
            let mut again = stored.clone();
            again.status = next;
            match store.upsert(&again).await {
                Err(StoreError::StatusRegression { from, to, .. }) => {
                    assert_eq!(from, TaskStatus::Completed);
                    assert_eq!(to, next);
                }
                other => panic!("expected a regression error, got {:?}", other),
            }
        }
        assert_eq!(
            store.find_by_id(&stored.id).await.unwrap().status,
            TaskStatus::Completed
        );

        // rewriting the same terminal status is allowed
        assert!(store.upsert(&stored).await.is_ok());
    }

    #[tokio::test]
    async fn status_may_skip_forward() {
        let store = MemoryTaskStore::new();
        let task = Task::new("a", "w1");
        let stored = store.upsert(&task).await.unwrap();

        let mut done = stored.clone();
        done.status = TaskStatus::Failed;
        assert_eq!(store.upsert(&done).await.unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn missing_ids_are_generated() {
        let store = MemoryTaskStore::new();
        let mut task = Task::new("a", "w1");
        task.id.clear();
        let stored = store.upsert(&task).await.unwrap();
        assert!(!stored.id.is_empty());
        assert_eq!(store.find_by_id(&stored.id).await.unwrap(), stored);
    }

    #[tokio::test]
    async fn oversized_fields_are_rejected() {
        let store = MemoryTaskStore::new();
        let task = Task::new("x".repeat(MAX_FIELD_LEN + 1), "w1");
        assert!(matches!(
            store.upsert(&task).await,
            Err(StoreError::FieldTooLong { field: "type", .. })
        ));
        assert!(matches!(
            store.find_by_id(&task.id).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
