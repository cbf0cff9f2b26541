// crates/wfruntime/tests/common/mod.rs
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use wfcore::{
    BusError, CompletionNotification, MemoryBus, MemoryTaskStore, MessageBus, RetryPolicy,
    StoreError, Subscription, Task, TaskRecordStore, WorkflowEvent, TASK_QUEUE,
};
use wfruntime::{RuntimeConfig, Transition, WorkflowRuntime};

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        retry: RetryPolicy::none(),
        ..RuntimeConfig::default()
    }
}

/// Runtime over an in-memory bus and store, with the bus exposed so tests
/// can play the part of the workers
pub struct Harness {
    pub runtime: WorkflowRuntime,
    pub bus: Arc<FlakyBus>,
    pub store: Arc<FlakyStore>,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let bus = Arc::new(FlakyBus::new());
        let store = Arc::new(FlakyStore::new());
        let runtime = WorkflowRuntime::new(store.clone(), bus.clone(), test_config());
        Self { runtime, bus, store }
    }

    /// Take every task waiting on the dispatch queue
    pub fn dispatched(&self) -> Vec<Task> {
        self.bus
            .inner
            .drain(TASK_QUEUE)
            .iter()
            .map(|payload| serde_json::from_slice(payload).expect("dispatch payload is a task"))
            .collect()
    }

    pub async fn complete(&self, task_id: &str) -> Transition {
        self.runtime
            .handle_completion(&CompletionNotification::success(task_id))
            .await
            .expect("completion applies")
    }

    pub async fn fail(&self, task_id: &str) -> Transition {
        self.runtime
            .handle_completion(&CompletionNotification::failure(task_id))
            .await
            .expect("failure applies")
    }
}

/// Memory bus that can be told to reject the next N publishes
pub struct FlakyBus {
    pub inner: MemoryBus,
    failures: AtomicU32,
}

impl FlakyBus {
    pub fn new() -> Self {
        Self {
            inner: MemoryBus::new(),
            failures: AtomicU32::new(0),
        }
    }

    pub fn fail_next_publishes(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageBus for FlakyBus {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(BusError::PublishFailed {
                queue: queue.to_string(),
                reason: "broker unreachable".to_string(),
            });
        }
        self.inner.publish(queue, payload).await
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BusError> {
        self.inner.subscribe(queue).await
    }
}

/// Memory store whose writes can be switched off
pub struct FlakyStore {
    pub inner: MemoryTaskStore,
    down: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryTaskStore::new(),
            down: AtomicBool::new(false),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskRecordStore for FlakyStore {
    async fn upsert(&self, task: &Task) -> Result<Task, StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("database is down".to_string()));
        }
        self.inner.upsert(task).await
    }

    async fn find_by_id(&self, id: &str) -> Result<Task, StoreError> {
        self.inner.find_by_id(id).await
    }

    async fn list(&self) -> Result<Vec<Task>, StoreError> {
        self.inner.list().await
    }
}

/// Wait for the first event matching `predicate`
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<WorkflowEvent>,
    mut predicate: F,
) -> WorkflowEvent
where
    F: FnMut(&WorkflowEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
