use crate::registry::HandlerRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wfcore::{
    BusError, CompletionNotification, Delivery, MessageBus, RetryPolicy, StoreError, Subscription,
    Task, TaskContext, TaskError, TaskRecordStore, TaskStatus,
};
use wfruntime::{env_parse, RuntimeConfig};

const RECEIVE_BACKOFF: Duration = Duration::from_millis(500);

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent workers, each holding at most one claim; zero
    /// leaves execution to external worker processes
    pub workers: usize,
    /// Sleep used by `time.delay`
    pub task_delay: Duration,
    pub dispatch_queue: String,
    pub completion_queue: String,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_runtime(&RuntimeConfig::default())
    }
}

impl WorkerConfig {
    /// Queue names and retry policy shared with the engine
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            workers: 4,
            task_delay: Duration::from_millis(2000),
            dispatch_queue: runtime.dispatch_queue.clone(),
            completion_queue: runtime.completion_queue.clone(),
            retry: runtime.retry.clone(),
        }
    }

    /// Defaults overridden by `WF_WORKERS` and `WF_TASK_DELAY_MS`
    pub fn from_env(runtime: &RuntimeConfig) -> Self {
        let mut config = Self::from_runtime(runtime);
        if let Some(workers) = env_parse::<usize>("WF_WORKERS") {
            config.workers = workers;
        }
        if let Some(delay) = env_parse("WF_TASK_DELAY_MS") {
            config.task_delay = Duration::from_millis(delay);
        }
        config
    }
}

/// How one claimed dispatch was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Nack,
}

/// Executes dispatched tasks and reports their outcome
///
/// One `run` loop holds at most one claimed message; the completion is
/// published before the dispatch message is acknowledged.
pub struct WorkerExecutor {
    handlers: Arc<HandlerRegistry>,
    store: Arc<dyn TaskRecordStore>,
    bus: Arc<dyn MessageBus>,
    config: WorkerConfig,
}

impl WorkerExecutor {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        store: Arc<dyn TaskRecordStore>,
        bus: Arc<dyn MessageBus>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            handlers,
            store,
            bus,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Claim and execute tasks until `shutdown` fires or the bus closes
    pub async fn run(&self, worker: usize, shutdown: CancellationToken) -> Result<(), BusError> {
        let mut subscription = self.bus.subscribe(&self.config.dispatch_queue).await?;
        tracing::info!("Worker {} waiting for tasks on {}", worker, self.config.dispatch_queue);

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = subscription.next() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    let settlement = self.process(worker, &delivery, &shutdown).await;
                    let settled = match settlement {
                        Settlement::Ack => subscription.ack(&delivery).await,
                        Settlement::Nack => subscription.nack(&delivery).await,
                    };
                    if let Err(e) = settled {
                        tracing::error!("Worker {} failed to settle task message {}: {}", worker, delivery.tag, e);
                    }
                }
                Ok(None) => {
                    tracing::info!("Dispatch queue closed");
                    break;
                }
                Err(e) => {
                    tracing::error!("Worker {} failed to receive task: {}", worker, e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                    }
                }
            }
        }

        tracing::info!("Worker {} stopped", worker);
        Ok(())
    }

    async fn process(&self, worker: usize, delivery: &Delivery, shutdown: &CancellationToken) -> Settlement {
        let mut task: Task = match serde_json::from_slice(&delivery.payload) {
            Ok(task) => task,
            Err(e) => {
                tracing::error!("Dropping malformed task message {}: {}", delivery.tag, e);
                return Settlement::Ack;
            }
        };

        // A redelivery after the outcome was recorded only needs reporting
        match self.store.find_by_id(&task.id).await {
            Ok(stored) if stored.is_terminal() => {
                tracing::info!(
                    "Task {} already {}, reporting the recorded outcome again",
                    stored.id,
                    stored.status
                );
                return self.report(&stored).await;
            }
            Ok(_) | Err(StoreError::NotFound(_)) => {}
            Err(e) => tracing::warn!("Could not look up task {}: {}", task.id, e),
        }

        tracing::info!(
            "Worker {} claimed task {} ({}) of workflow {}",
            worker,
            task.id,
            task.task_type,
            task.workflow_id
        );
        self.record(&mut task, TaskStatus::InProgress).await;

        let ctx = TaskContext {
            task: task.clone(),
            redelivered: delivery.redelivered,
            cancellation: shutdown.child_token(),
        };
        let outcome = match self.handlers.get(&task.task_type) {
            Some(handler) => handler.execute(ctx).await,
            None => Err(TaskError::UnknownType(task.task_type.clone())),
        };

        let status = match outcome {
            Ok(()) => {
                tracing::info!("Task {} completed", task.id);
                TaskStatus::Completed
            }
            Err(TaskError::Cancelled) => {
                // Shutting down mid-task; another worker picks it up
                tracing::warn!("Task {} cancelled, releasing claim", task.id);
                return Settlement::Nack;
            }
            Err(e) => {
                tracing::warn!("Task {} failed: {}", task.id, e);
                TaskStatus::Failed
            }
        };
        self.record(&mut task, status).await;
        self.report(&task).await
    }

    /// Publish the task's status as its completion; the dispatch message is
    /// only released once that publish is confirmed
    async fn report(&self, task: &Task) -> Settlement {
        let payload = match CompletionNotification::encode(&task) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Could not encode completion of task {}: {}", task.id, e);
                return Settlement::Nack;
            }
        };
        let published = self
            .config
            .retry
            .run("publish completion", || {
                self.bus.publish(&self.config.completion_queue, payload.clone())
            })
            .await;

        match published {
            Ok(()) => {
                tracing::debug!("Reported task {} as {}", task.id, task.status);
                Settlement::Ack
            }
            Err(e) => {
                tracing::error!("Could not report task {}, requesting redelivery: {}", task.id, e);
                Settlement::Nack
            }
        }
    }

    /// Move the record to `status` and persist it; the record is secondary
    /// to the completion message, so write failures are only logged
    async fn record(&self, task: &mut Task, status: TaskStatus) {
        task.status = status;
        task.updated_at = wfcore::now_millis();

        let current: &Task = task;
        let stored = self
            .config
            .retry
            .run("record task status", || self.store.upsert(current))
            .await;
        match stored {
            Ok(stored) => *task = stored,
            Err(StoreError::StatusRegression { from, .. }) => {
                // Someone else settled it first; report what the store holds
                tracing::warn!("Task {} is already {}, not recording {}", task.id, from, status);
                if let Ok(stored) = self.store.find_by_id(&task.id).await {
                    *task = stored;
                }
            }
            Err(e) => tracing::warn!("Could not record task {} as {}: {}", task.id, status, e),
        }
    }
}

/// Start `config.workers` competing workers on one executor
pub fn spawn_workers(executor: Arc<WorkerExecutor>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
    (0..executor.config().workers)
        .map(|worker| {
            let executor = executor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = executor.run(worker, shutdown).await {
                    tracing::error!("Worker {} could not start: {}", worker, e);
                }
            })
        })
        .collect()
}
