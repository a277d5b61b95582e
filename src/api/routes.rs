//! REST endpoints for tasks, agents and system status.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use super::ws::ws_handler;
use crate::error::{DispatchError, Error};
use crate::service::{DEFAULT_LIST_LIMIT, Orchestrator};
use crate::task::{TaskRequest, TaskState};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

/// Build the Axum router with the REST and WebSocket routes.
pub fn api_routes(orchestrator: Orchestrator) -> Router {
    let state = AppState { orchestrator };

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/tasks", post(submit_task).get(list_tasks))
        .route("/api/tasks/{id}/status", get(task_status))
        .route("/api/tasks/{id}/result", get(task_result))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/{name}", get(agent_status))
        .route("/api/agents/{name}/enable", post(enable_agent))
        .route("/api/agents/{name}/disable", post(disable_agent))
        .route("/api/agents/{name}/concurrency", post(set_concurrency))
        .route("/api/status", get(system_status))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

type ApiResponse = (StatusCode, Json<Value>);

fn error_response(err: Error) -> ApiResponse {
    let status = match &err {
        Error::Dispatch(DispatchError::Validation(_)) => StatusCode::BAD_REQUEST,
        Error::Dispatch(DispatchError::NotFound { .. }) => StatusCode::NOT_FOUND,
        Error::Dispatch(DispatchError::NoAgentAvailable { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => {
            error!(error = %err, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({"error": err.to_string()})))
}

fn ok<T: serde::Serialize>(status: StatusCode, body: T) -> ApiResponse {
    (status, Json(json!(body)))
}

fn parse_task_id(id: &str) -> Result<Uuid, ApiResponse> {
    Uuid::parse_str(id).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Invalid task ID"})),
        )
    })
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "mcp-orchestrator"
    }))
}

// ── Tasks ───────────────────────────────────────────────────────────────

async fn submit_task(State(state): State<AppState>, Json(body): Json<Value>) -> impl IntoResponse {
    let request: TaskRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => return error_response(DispatchError::Validation(e.to_string()).into()),
    };

    match state.orchestrator.submit(request).await {
        Ok(submission) => {
            info!(task_id = %submission.task_id, state = %submission.state, "Task submitted via API");
            ok(StatusCode::CREATED, submission)
        }
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ListParams {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_tasks(State(state): State<AppState>, Query(params): Query<ListParams>) -> impl IntoResponse {
    let filter = match params.status.as_deref().map(str::parse::<TaskState>).transpose() {
        Ok(filter) => filter,
        Err(e) => return error_response(DispatchError::Validation(e).into()),
    };

    match state
        .orchestrator
        .list_tasks(filter, params.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await
    {
        Ok(tasks) => ok(StatusCode::OK, tasks),
        Err(e) => error_response(e),
    }
}

async fn task_status(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.orchestrator.status(id).await {
        Ok(status) => ok(StatusCode::OK, status),
        Err(e) => error_response(e),
    }
}

async fn task_result(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.orchestrator.result(id).await {
        Ok(Some(result)) => ok(StatusCode::OK, result),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("No result available for task {id}")})),
        ),
        Err(e) => error_response(e),
    }
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.orchestrator.cancel(id).await {
        Ok(status) => ok(StatusCode::OK, status),
        Err(e) => error_response(e),
    }
}

// ── Agents ──────────────────────────────────────────────────────────────

async fn list_agents(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!(state.orchestrator.list_agents().await))
}

async fn agent_status(State(state): State<AppState>, Path(name): Path<String>) -> impl IntoResponse {
    match state.orchestrator.agent_status(&name).await {
        Ok(status) => ok(StatusCode::OK, status),
        Err(e) => error_response(e),
    }
}

async fn enable_agent(State(state): State<AppState>, Path(name): Path<String>) -> impl IntoResponse {
    match state.orchestrator.set_agent_enabled(&name, true).await {
        Ok(descriptor) => ok(StatusCode::OK, descriptor),
        Err(e) => error_response(e),
    }
}

async fn disable_agent(State(state): State<AppState>, Path(name): Path<String>) -> impl IntoResponse {
    match state.orchestrator.set_agent_enabled(&name, false).await {
        Ok(descriptor) => ok(StatusCode::OK, descriptor),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ConcurrencyRequest {
    max_concurrent: usize,
}

async fn set_concurrency(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<ConcurrencyRequest>,
) -> impl IntoResponse {
    match state
        .orchestrator
        .set_agent_max_concurrent(&name, body.max_concurrent)
        .await
    {
        Ok(descriptor) => ok(StatusCode::OK, descriptor),
        Err(e) => error_response(e),
    }
}

// ── System ──────────────────────────────────────────────────────────────

async fn system_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.orchestrator.system_status().await {
        Ok(status) => ok(StatusCode::OK, status),
        Err(e) => error_response(e),
    }
}
