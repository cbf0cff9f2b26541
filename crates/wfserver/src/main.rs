mod api;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use api::AppState;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wfcore::{MemoryTaskStore, MessageBus, TaskRecordStore};
use wfruntime::{RuntimeConfig, WorkflowRuntime};
use wfworker::{register_all, spawn_workers, HandlerRegistry, WorkerConfig, WorkerExecutor};

#[cfg(feature = "iggy")]
async fn connect_bus() -> anyhow::Result<Arc<dyn MessageBus>> {
    let mut config = wfcore::IggyBusConfig::default();
    if let Ok(connection_string) = std::env::var("IGGY_CONNECTION_STRING") {
        config.connection_string = connection_string;
    }
    Ok(Arc::new(wfcore::IggyBus::connect(config).await?))
}

#[cfg(not(feature = "iggy"))]
async fn connect_bus() -> anyhow::Result<Arc<dyn MessageBus>> {
    info!("Using in-process message bus");
    Ok(Arc::new(wfcore::MemoryBus::new()))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("🚀 Starting workflow engine server");

    let runtime_config = RuntimeConfig::from_env();
    let worker_config = WorkerConfig::from_env(&runtime_config);

    let store: Arc<dyn TaskRecordStore> = Arc::new(MemoryTaskStore::new());
    let bus = connect_bus().await?;
    let runtime = Arc::new(WorkflowRuntime::new(store.clone(), bus.clone(), runtime_config));

    let shutdown = CancellationToken::new();
    let completion_loop = runtime.spawn_completion_loop(shutdown.clone()).await?;

    let mut handlers = HandlerRegistry::new();
    register_all(&mut handlers, &worker_config);
    let handlers = Arc::new(handlers);

    info!("✅ Starting {} in-process workers", worker_config.workers);
    let executor = Arc::new(WorkerExecutor::new(
        handlers.clone(),
        store.clone(),
        bus.clone(),
        worker_config,
    ));
    let workers = spawn_workers(executor, shutdown.clone());

    let app_state = web::Data::new(AppState { runtime, handlers });

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("🌐 Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(api::configure)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    info!("Shutting down background loops");
    shutdown.cancel();
    let _ = completion_loop.await;
    for worker in workers {
        let _ = worker.await;
    }

    Ok(())
}
