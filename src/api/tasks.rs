//! Task API endpoints.
//!
//! Thin JSON wrappers over the [`Orchestrator`](crate::orchestrator::Orchestrator)
//! operations. Background work started here is detached; clients poll
//! `GET /api/tasks/:id` for progress.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::routes::AppState;
use crate::error::Error;
use crate::task::{Task, TaskPhase};

/// Create task routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_tasks))
        .route("/", post(create_task))
        .route("/:id", get(get_task))
        .route("/:id", delete(delete_task))
        .route("/:id", patch(move_task))
        .route("/:id/plan", post(generate_plan))
        .route("/:id/approve-plan", post(approve_plan))
        .route("/:id/start-development", post(start_development))
        .route("/:id/resume", post(resume))
        .route("/:id/pause", post(pause))
        .route("/:id/subtasks/:sid/skip", post(skip_subtask))
        .route("/:id/subtasks/:sid", delete(delete_subtask))
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::TaskNotFound(_) | Error::SubtaskNotFound { .. } => StatusCode::NOT_FOUND,
        Error::Locked(_) | Error::AlreadyRunning(_) => StatusCode::CONFLICT,
        Error::InvalidState(_) | Error::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
        Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn into_response(error: Error) -> (StatusCode, String) {
    let status = status_for(&error);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("Request failed: {:#}", error);
    }
    (status, error.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Request/Response Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Agent working directory (defaults to the project dir)
    pub worktree_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct MoveTaskRequest {
    pub phase: TaskPhase,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub task_id: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeResponse {
    pub task_id: String,
    pub reset_subtasks: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseResponse {
    pub task_id: String,
    pub agent_stopped: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /api/tasks - List all tasks, clearing stale agent assignments.
async fn list_tasks(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Task>> {
    state
        .orchestrator
        .list_tasks()
        .await
        .map(Json)
        .map_err(into_response)
}

/// POST /api/tasks - Create a task in planning.
async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<Task> {
    state
        .orchestrator
        .create_task(&req.title, &req.description, req.worktree_path)
        .await
        .map(Json)
        .map_err(into_response)
}

/// GET /api/tasks/:id
async fn get_task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Task> {
    state
        .orchestrator
        .get_task(&id)
        .await
        .map(Json)
        .map_err(into_response)
}

/// DELETE /api/tasks/:id
async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, String), (StatusCode, String)> {
    state
        .orchestrator
        .delete_task(&id)
        .await
        .map_err(into_response)?;
    Ok((StatusCode::OK, format!("Task {} deleted", id)))
}

/// PATCH /api/tasks/:id - Move a task to another phase.
async fn move_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<MoveTaskRequest>,
) -> ApiResult<Task> {
    state
        .orchestrator
        .move_task(&id, req.phase)
        .await
        .map(Json)
        .map_err(into_response)
}

/// POST /api/tasks/:id/plan - Generate a plan in the background.
async fn generate_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<AcceptedResponse> {
    state
        .orchestrator
        .generate_plan(&id)
        .await
        .map_err(into_response)?;
    Ok(Json(AcceptedResponse {
        task_id: id,
        message: "Plan generation started".to_string(),
    }))
}

/// POST /api/tasks/:id/approve-plan
async fn approve_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Task> {
    state
        .orchestrator
        .approve_plan(&id)
        .await
        .map(Json)
        .map_err(into_response)
}

/// POST /api/tasks/:id/start-development - Generate subtasks and run dev+QA.
async fn start_development(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<AcceptedResponse> {
    state
        .orchestrator
        .start_development(&id)
        .await
        .map_err(into_response)?;
    Ok(Json(AcceptedResponse {
        task_id: id,
        message: "Development started".to_string(),
    }))
}

/// POST /api/tasks/:id/resume
async fn resume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<ResumeResponse> {
    let (reset_subtasks, _) = state
        .orchestrator
        .resume(&id)
        .await
        .map_err(into_response)?;
    Ok(Json(ResumeResponse {
        task_id: id,
        reset_subtasks,
    }))
}

/// POST /api/tasks/:id/pause
async fn pause(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<PauseResponse> {
    let agent_stopped = state.orchestrator.pause(&id).await.map_err(into_response)?;
    Ok(Json(PauseResponse {
        task_id: id,
        agent_stopped,
    }))
}

/// POST /api/tasks/:id/subtasks/:sid/skip
async fn skip_subtask(
    State(state): State<Arc<AppState>>,
    Path((id, sid)): Path<(String, String)>,
) -> ApiResult<Task> {
    state
        .orchestrator
        .skip_subtask(&id, &sid)
        .await
        .map(Json)
        .map_err(into_response)
}

/// DELETE /api/tasks/:id/subtasks/:sid
async fn delete_subtask(
    State(state): State<Arc<AppState>>,
    Path((id, sid)): Path<(String, String)>,
) -> ApiResult<Task> {
    state
        .orchestrator
        .delete_subtask(&id, &sid)
        .await
        .map(Json)
        .map_err(into_response)
}
