use actix_web::{get, post, web, HttpResponse, Responder, Result as ActixResult};
use actix_ws::Message;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use uuid::Uuid;
use wfcore::{FlowError, StoreError, WorkflowError, WorkflowSubmission};
use wfruntime::WorkflowRuntime;
use wfworker::HandlerRegistry;

/// Application state shared across handlers
pub struct AppState {
    pub runtime: Arc<WorkflowRuntime>,
    pub handlers: Arc<HandlerRegistry>,
}

/// Error response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    workflow_id: Option<String>,
}

fn error_response(error: &FlowError, workflow_id: Option<String>) -> HttpResponse {
    let body = ErrorResponse {
        error: error.to_string(),
        workflow_id,
    };
    match error {
        FlowError::Workflow(WorkflowError::Duplicate(_)) => HttpResponse::Conflict().json(body),
        FlowError::Workflow(WorkflowError::NotFound(_) | WorkflowError::TaskNotFound(_))
        | FlowError::Store(StoreError::NotFound(_)) => HttpResponse::NotFound().json(body),
        FlowError::Workflow(_) | FlowError::Notification(_) | FlowError::Serialization(_) => {
            HttpResponse::BadRequest().json(body)
        }
        FlowError::Dispatch(_) | FlowError::Bus(_) => HttpResponse::BadGateway().json(body),
        FlowError::Store(_) => HttpResponse::ServiceUnavailable().json(body),
    }
}

/// Register every route on an app
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(list_workflows)
        .service(create_workflow)
        .service(get_workflow)
        .service(resume_workflow)
        .service(list_tasks)
        .service(get_task)
        .service(list_task_types)
        .service(websocket_events);
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "wfengine"
    }))
}

/// List registered workflows
#[get("/api/workflows")]
async fn list_workflows(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    Ok(HttpResponse::Ok().json(data.runtime.list_workflows().await))
}

/// Submit a new workflow and dispatch its first task(s)
#[post("/api/workflows")]
async fn create_workflow(
    data: web::Data<AppState>,
    submission: web::Json<WorkflowSubmission>,
) -> ActixResult<impl Responder> {
    let mut submission = submission.into_inner();
    // Known up front so a 502 can still point at the registered workflow
    let workflow_id = submission
        .id
        .get_or_insert_with(|| Uuid::new_v4().to_string())
        .clone();

    info!("Creating workflow: {} ({})", submission.name, workflow_id);

    match data.runtime.submit(submission).await {
        Ok(workflow) => Ok(HttpResponse::Created().json(workflow)),
        Err(e @ FlowError::Dispatch(_)) => {
            error!("Workflow {} registered but not started: {}", workflow_id, e);
            Ok(error_response(&e, Some(workflow_id)))
        }
        Err(e) => {
            warn!("Rejected workflow {}: {}", workflow_id, e);
            Ok(error_response(&e, None))
        }
    }
}

/// Get a workflow with the latest status of each task
#[get("/api/workflows/{id}")]
async fn get_workflow(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    match data.runtime.get_workflow(&workflow_id).await {
        Ok(workflow) => Ok(HttpResponse::Ok().json(workflow)),
        Err(e) => Ok(error_response(&e, None)),
    }
}

/// Dispatch eligible tasks that never made it onto the bus
#[post("/api/workflows/{id}/resume")]
async fn resume_workflow(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    info!("Resuming workflow: {}", workflow_id);

    match data.runtime.resume(&workflow_id).await {
        Ok(dispatched) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "workflowId": workflow_id,
            "dispatched": dispatched,
        }))),
        Err(e) => {
            error!("Resume of workflow {} failed: {}", workflow_id, e);
            Ok(error_response(&e, Some(workflow_id)))
        }
    }
}

/// Every stored task record
#[get("/api/tasks")]
async fn list_tasks(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    match data.runtime.store().list().await {
        Ok(tasks) => Ok(HttpResponse::Ok().json(tasks)),
        Err(e) => Ok(error_response(&FlowError::from(e), None)),
    }
}

/// Stored record of one task
#[get("/api/tasks/{id}")]
async fn get_task(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> ActixResult<impl Responder> {
    match data.runtime.get_task(&path.into_inner()).await {
        Ok(task) => Ok(HttpResponse::Ok().json(task)),
        Err(e) => Ok(error_response(&e, None)),
    }
}

/// Task types the in-process workers can execute
#[get("/api/task-types")]
async fn list_task_types(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let types: Vec<_> = data
        .handlers
        .list_task_types()
        .into_iter()
        .map(|task_type| {
            let description = data.handlers.description(&task_type).unwrap_or_default();
            serde_json::json!({
                "type": task_type,
                "description": description,
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(types))
}

/// WebSocket endpoint streaming engine events
#[get("/api/events")]
async fn websocket_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client connected");

    let mut events = data.runtime.subscribe_events();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("WebSocket client lagging, {} events skipped", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}
