use crate::completion::{CompletionHandler, Transition};
use crate::dispatcher::Dispatcher;
use crate::registry::WorkflowRegistry;
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wfcore::{
    BusError, CompletionNotification, EventBus, FlowError, MessageBus, RetryPolicy, StoreError,
    Task, TaskId, TaskRecordStore, Workflow, WorkflowError, WorkflowEvent, WorkflowSubmission,
    TASK_COMPLETION_QUEUE, TASK_QUEUE,
};

/// Main entry point of the orchestration engine
///
/// Wires the registry, dispatcher and completion handler around one task
/// store and one message bus.
pub struct WorkflowRuntime {
    registry: Arc<WorkflowRegistry>,
    dispatcher: Arc<Dispatcher>,
    completions: Arc<CompletionHandler>,
    store: Arc<dyn TaskRecordStore>,
    bus: Arc<dyn MessageBus>,
    event_bus: Arc<EventBus>,
    config: RuntimeConfig,
}

impl WorkflowRuntime {
    pub fn new(
        store: Arc<dyn TaskRecordStore>,
        bus: Arc<dyn MessageBus>,
        config: RuntimeConfig,
    ) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let registry = Arc::new(WorkflowRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            bus.clone(),
            event_bus.clone(),
            &config,
        ));
        let completions = Arc::new(CompletionHandler::new(
            registry.clone(),
            dispatcher.clone(),
            event_bus.clone(),
        ));

        Self {
            registry,
            dispatcher,
            completions,
            store,
            bus,
            event_bus,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn TaskRecordStore> {
        &self.store
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Register a submitted workflow and dispatch its initial tasks
    ///
    /// If the initial dispatch fails the workflow stays registered with its
    /// tasks un-started and the dispatch error is returned; `resume` retries.
    pub async fn submit(&self, submission: WorkflowSubmission) -> Result<Workflow, FlowError> {
        let workflow = submission.into_workflow()?;
        let mut guard = self.registry.register(workflow).await?;

        self.event_bus.emit(WorkflowEvent::WorkflowRegistered {
            workflow_id: guard.id.clone(),
            name: guard.name.clone(),
            execution_mode: guard.execution_mode,
            task_count: guard.tasks.len(),
            timestamp: Utc::now(),
        });

        self.dispatcher.start_initial(&mut guard).await?;
        Ok(guard.clone())
    }

    /// Workflow snapshot with each task's latest known status
    ///
    /// The registry is authoritative for orchestration; the store may be
    /// ahead of it when a worker has recorded progress whose completion
    /// notification is still in flight.
    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow, FlowError> {
        let mut workflow = self.registry.lookup(workflow_id).await?;
        for task in workflow.tasks.iter_mut() {
            match self.store.find_by_id(&task.id).await {
                Ok(record) => merge_record(task, record),
                Err(StoreError::NotFound(_)) => {}
                Err(e) => tracing::warn!("Could not read record of task {}: {}", task.id, e),
            }
        }
        Ok(workflow)
    }

    pub async fn list_workflows(&self) -> Vec<Workflow> {
        self.registry.list().await
    }

    /// Stored record of a single task
    pub async fn get_task(&self, task_id: &str) -> Result<Task, FlowError> {
        match self.store.find_by_id(task_id).await {
            Ok(task) => Ok(task),
            Err(StoreError::NotFound(id)) => Err(WorkflowError::TaskNotFound(id).into()),
            Err(e) => Err(e.into()),
        }
    }

    /// Dispatch eligible tasks that were never started
    pub async fn resume(&self, workflow_id: &str) -> Result<Vec<TaskId>, FlowError> {
        let mut guard = self.registry.lock(workflow_id).await?;
        Ok(self.dispatcher.resume(&mut guard).await?)
    }

    /// Apply one completion notification directly, bypassing the bus
    pub async fn handle_completion(
        &self,
        notification: &CompletionNotification,
    ) -> Result<Transition, FlowError> {
        Ok(self.completions.handle(notification).await?)
    }

    /// Subscribe to the completion queue and process it in the background
    pub async fn spawn_completion_loop(
        &self,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>, BusError> {
        let subscription = self.bus.subscribe(&self.config.completion_queue).await?;
        let completions = self.completions.clone();
        Ok(tokio::spawn(async move {
            completions.run(subscription, shutdown).await;
        }))
    }

    /// Subscribe to engine events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

fn merge_record(task: &mut Task, record: Task) {
    if record.status.rank() > task.status.rank() {
        task.status = record.status;
    }
    task.created_at = record.created_at;
    task.updated_at = task.updated_at.max(record.updated_at);
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub dispatch_queue: String,
    pub completion_queue: String,
    pub retry: RetryPolicy,
    pub event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            dispatch_queue: TASK_QUEUE.to_string(),
            completion_queue: TASK_COMPLETION_QUEUE.to_string(),
            retry: RetryPolicy::default(),
            event_buffer_size: 1000,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `WF_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(queue) = std::env::var("WF_DISPATCH_QUEUE") {
            config.dispatch_queue = queue;
        }
        if let Ok(queue) = std::env::var("WF_COMPLETION_QUEUE") {
            config.completion_queue = queue;
        }
        if let Some(attempts) = env_parse("WF_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = attempts;
        }
        if let Some(delay) = env_parse("WF_RETRY_DELAY_MS") {
            config.retry.delay_ms = delay;
        }
        if let Some(size) = env_parse("WF_EVENT_BUFFER") {
            config.event_buffer_size = size;
        }
        config
    }
}

/// Parse an environment variable, ignoring (with a warning) unparsable values
pub fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {}: {:?}", name, raw);
            None
        }
    }
}
