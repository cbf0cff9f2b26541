// crates/wfworker/tests/worker_test.rs

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use wfcore::{
    ExecutionMode, MemoryBus, MemoryTaskStore, MessageBus, RetryPolicy, Subscription, Task,
    TaskRecordStore, TaskStatus, WorkflowEvent, WorkflowState, WorkflowSubmission,
    TASK_COMPLETION_QUEUE, TASK_QUEUE,
};
use wfruntime::{RuntimeConfig, WorkflowRuntime};
use wfworker::{register_all, spawn_workers, HandlerRegistry, WorkerConfig, WorkerExecutor};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init();
}

struct Cluster {
    runtime: WorkflowRuntime,
    bus: Arc<MemoryBus>,
    store: Arc<MemoryTaskStore>,
    shutdown: CancellationToken,
}

impl Cluster {
    /// Engine, completion loop and a small worker pool on one in-memory bus
    async fn start(workers: usize) -> Self {
        init_tracing();
        let bus = Arc::new(MemoryBus::new());
        let store = Arc::new(MemoryTaskStore::new());
        let runtime_config = RuntimeConfig {
            retry: RetryPolicy::none(),
            ..RuntimeConfig::default()
        };
        let runtime = WorkflowRuntime::new(store.clone(), bus.clone(), runtime_config.clone());
        let shutdown = CancellationToken::new();
        runtime
            .spawn_completion_loop(shutdown.clone())
            .await
            .expect("completion loop starts");

        let config = WorkerConfig {
            workers,
            task_delay: Duration::from_millis(20),
            ..WorkerConfig::from_runtime(&runtime_config)
        };
        let mut handlers = HandlerRegistry::new();
        register_all(&mut handlers, &config);
        let executor = Arc::new(WorkerExecutor::new(
            Arc::new(handlers),
            store.clone(),
            bus.clone(),
            config,
        ));
        spawn_workers(executor, shutdown.clone());

        Self {
            runtime,
            bus,
            store,
            shutdown,
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn wait_until_terminal(
    events: &mut broadcast::Receiver<WorkflowEvent>,
    workflow_id: &str,
) -> WorkflowEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if event.is_terminal() && event.workflow_id() == workflow_id => {
                    return event
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("workflow did not finish in time")
}

#[tokio::test]
async fn test_sequential_workflow_runs_to_completion() {
    let cluster = Cluster::start(2).await;
    let mut events = cluster.runtime.subscribe_events();

    let submission = WorkflowSubmission::new("w1")
        .with_id("w1")
        .with_task("debug.log")
        .with_task("time.delay")
        .with_task("debug.log");
    cluster.runtime.submit(submission).await.unwrap();

    let event = wait_until_terminal(&mut events, "w1").await;
    assert!(matches!(event, WorkflowEvent::WorkflowSucceeded { .. }));

    let workflow = cluster.runtime.get_workflow("w1").await.unwrap();
    assert_eq!(workflow.state, WorkflowState::Succeeded);
    for task in &workflow.tasks {
        assert_eq!(task.status, TaskStatus::Completed);
        let record = cluster.store.find_by_id(&task.id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(record.updated_at >= record.created_at);
    }
}

#[tokio::test]
async fn test_parallel_workflow_runs_to_completion() {
    let cluster = Cluster::start(4).await;
    let mut events = cluster.runtime.subscribe_events();

    let submission = (0..6).fold(
        WorkflowSubmission::new("fan-out")
            .with_id("fan-out")
            .with_mode(ExecutionMode::Parallel),
        |s, _| s.with_task("time.delay"),
    );
    cluster.runtime.submit(submission).await.unwrap();

    let event = wait_until_terminal(&mut events, "fan-out").await;
    assert!(matches!(event, WorkflowEvent::WorkflowSucceeded { .. }));
}

#[tokio::test]
async fn test_failing_handler_fails_workflow() {
    let cluster = Cluster::start(1).await;
    let mut events = cluster.runtime.subscribe_events();

    let submission = WorkflowSubmission::new("broken")
        .with_id("broken")
        .with_task("debug.fail")
        .with_task("debug.log");
    let workflow = cluster.runtime.submit(submission).await.unwrap();

    let event = wait_until_terminal(&mut events, "broken").await;
    match event {
        WorkflowEvent::WorkflowFailed { failed_task, .. } => {
            assert_eq!(failed_task, workflow.tasks[0].id)
        }
        other => panic!("unexpected event {:?}", other),
    }

    let snapshot = cluster.runtime.get_workflow("broken").await.unwrap();
    assert_eq!(snapshot.tasks[0].status, TaskStatus::Failed);
    assert_eq!(snapshot.tasks[1].status, TaskStatus::Pending);
    assert!(matches!(
        cluster.store.find_by_id(&workflow.tasks[1].id).await,
        Err(wfcore::StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_unknown_task_type_reports_failure() {
    let cluster = Cluster::start(1).await;
    let mut events = cluster.runtime.subscribe_events();

    let workflow = cluster
        .runtime
        .submit(WorkflowSubmission::new("odd").with_id("odd").with_task("no.such.type"))
        .await
        .unwrap();

    let event = wait_until_terminal(&mut events, "odd").await;
    assert!(matches!(event, WorkflowEvent::WorkflowFailed { .. }));
    let record = cluster.store.find_by_id(&workflow.tasks[0].id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_malformed_messages_do_not_stop_the_loops() {
    let cluster = Cluster::start(1).await;
    let mut events = cluster.runtime.subscribe_events();

    cluster
        .bus
        .publish(TASK_QUEUE, b"not a task".to_vec())
        .await
        .unwrap();
    cluster
        .bus
        .publish(TASK_COMPLETION_QUEUE, br#"{"status":"COMPLETED"}"#.to_vec())
        .await
        .unwrap();

    cluster
        .runtime
        .submit(WorkflowSubmission::new("after").with_id("after").with_task("debug.log"))
        .await
        .unwrap();

    let event = wait_until_terminal(&mut events, "after").await;
    assert!(matches!(event, WorkflowEvent::WorkflowSucceeded { .. }));
    assert_eq!(cluster.bus.pending(TASK_QUEUE), 0);
    assert_eq!(cluster.bus.pending(TASK_COMPLETION_QUEUE), 0);
}

#[tokio::test]
async fn test_worker_reports_exactly_one_completion_per_task() {
    init_tracing();
    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(MemoryTaskStore::new());
    let config = WorkerConfig {
        workers: 3,
        retry: RetryPolicy::none(),
        ..WorkerConfig::default()
    };
    let mut handlers = HandlerRegistry::new();
    register_all(&mut handlers, &config);
    let executor = Arc::new(WorkerExecutor::new(
        Arc::new(handlers),
        store.clone(),
        bus.clone(),
        config,
    ));
    let mut completions = bus.subscribe(TASK_COMPLETION_QUEUE).await.unwrap();

    let tasks: Vec<Task> = (0..10).map(|_| Task::new("debug.log", "direct")).collect();
    for task in &tasks {
        bus.publish(TASK_QUEUE, serde_json::to_vec(task).unwrap())
            .await
            .unwrap();
    }

    let shutdown = CancellationToken::new();
    let handles = spawn_workers(executor, shutdown.clone());

    let mut reported = Vec::new();
    while reported.len() < tasks.len() {
        let delivery = tokio::time::timeout(Duration::from_secs(5), completions.next())
            .await
            .expect("completion arrives")
            .unwrap()
            .unwrap();
        completions.ack(&delivery).await.unwrap();
        let task: Task = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        reported.push(task.id);
    }

    shutdown.cancel();
    futures::future::join_all(handles).await;

    reported.sort();
    let mut expected: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
    expected.sort();
    assert_eq!(reported, expected);
    assert_eq!(bus.pending(TASK_QUEUE), 0);
    assert_eq!(bus.pending(TASK_COMPLETION_QUEUE), 0);
}

#[tokio::test]
async fn test_redelivered_dispatch_of_finished_task_reports_recorded_outcome() {
    init_tracing();
    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(MemoryTaskStore::new());
    let config = WorkerConfig {
        workers: 1,
        retry: RetryPolicy::none(),
        ..WorkerConfig::default()
    };
    let mut handlers = HandlerRegistry::new();
    register_all(&mut handlers, &config);
    let executor = Arc::new(WorkerExecutor::new(
        Arc::new(handlers),
        store.clone(),
        bus.clone(),
        config,
    ));
    let mut completions = bus.subscribe(TASK_COMPLETION_QUEUE).await.unwrap();

    // debug.fail would fail if it ran again; the record says it succeeded
    let task = Task::new("debug.fail", "settled");
    let mut finished = task.clone();
    finished.status = TaskStatus::Completed;
    store.upsert(&finished).await.unwrap();

    bus.publish(TASK_QUEUE, serde_json::to_vec(&task).unwrap())
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let handles = spawn_workers(executor, shutdown.clone());

    let delivery = tokio::time::timeout(Duration::from_secs(5), completions.next())
        .await
        .expect("completion arrives")
        .unwrap()
        .unwrap();
    completions.ack(&delivery).await.unwrap();
    let reported: Task = serde_json::from_slice(&delivery.payload).unwrap();
    assert_eq!(reported.id, task.id);
    assert_eq!(reported.status, TaskStatus::Completed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    futures::future::join_all(handles).await;

    assert_eq!(bus.pending(TASK_QUEUE), 0);
    assert_eq!(bus.pending(TASK_COMPLETION_QUEUE), 0, "exactly one completion");
    let record = store.find_by_id(&task.id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_registry_lists_builtin_handlers() {
    let mut handlers = HandlerRegistry::new();
    register_all(&mut handlers, &WorkerConfig::default());

    assert_eq!(
        handlers.list_task_types(),
        vec!["debug.fail", "debug.log", "time.delay"]
    );
    assert!(handlers.get("debug.log").is_some());
    assert!(handlers.get("missing").is_none());
    assert!(!handlers.description("time.delay").unwrap_or_default().is_empty());
}
