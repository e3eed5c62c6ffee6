//! Producer and operator REST handlers
//!
//! Everything lives under `/api/v1/accounts/:account_id`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    ApprovalRequest, CreateTaskRequest, DisconnectResponse, ExecuteTaskResponse,
    RegisterDelegateRequest, SelectedDelegateResponse,
};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/accounts/:account_id/tasks", post(create_task))
        .route("/api/v1/accounts/:account_id/tasks/execute", post(execute_task))
        .route("/api/v1/accounts/:account_id/tasks/:task_id", get(get_task))
        .route("/api/v1/accounts/:account_id/tasks/:task_id/abort", post(abort_task))
        .route("/api/v1/accounts/:account_id/tasks/:task_id/expire", post(expire_task))
        .route(
            "/api/v1/accounts/:account_id/tasks/:task_id/selection-logs",
            get(selection_logs),
        )
        .route(
            "/api/v1/accounts/:account_id/tasks/:task_id/selected-delegate",
            get(selected_delegate),
        )
        .route(
            "/api/v1/accounts/:account_id/delegates",
            get(list_delegates).post(register_delegate),
        )
        .route(
            "/api/v1/accounts/:account_id/delegates/:delegate_id/approval",
            post(mark_approval),
        )
        .route(
            "/api/v1/accounts/:account_id/delegates/:delegate_id/disconnect",
            post(mark_disconnected),
        )
}

/// POST /tasks - queue a task
async fn create_task(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse> {
    let task = state
        .dispatcher
        .queue_task(req.into_submission(&account_id))
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// POST /tasks/execute - queue a task and wait for its result
async fn execute_task(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse> {
    let result = state
        .dispatcher
        .execute_task(req.into_submission(&account_id))
        .await?;
    Ok(Json(ExecuteTaskResponse { result }))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path((account_id, task_id)): Path<(String, Uuid)>,
) -> Result<impl IntoResponse> {
    let task = state.dispatcher.get_task(&account_id, task_id).await?;
    Ok(Json(task))
}

async fn abort_task(
    State(state): State<Arc<AppState>>,
    Path((account_id, task_id)): Path<(String, Uuid)>,
) -> Result<impl IntoResponse> {
    let task = state.dispatcher.abort_task(&account_id, task_id).await?;
    Ok(Json(task))
}

async fn expire_task(
    State(state): State<Arc<AppState>>,
    Path((account_id, task_id)): Path<(String, Uuid)>,
) -> Result<impl IntoResponse> {
    let task = state.dispatcher.expire_task(&account_id, task_id).await?;
    Ok(Json(task))
}

async fn selection_logs(
    State(state): State<Arc<AppState>>,
    Path((account_id, task_id)): Path<(String, Uuid)>,
) -> Result<impl IntoResponse> {
    // 404 rather than an empty log for a task that does not exist
    state.dispatcher.get_task(&account_id, task_id).await?;
    let entries = state
        .dispatcher
        .fetch_task_selection_logs(&account_id, task_id)
        .await?;
    Ok(Json(entries))
}

async fn selected_delegate(
    State(state): State<Arc<AppState>>,
    Path((account_id, task_id)): Path<(String, Uuid)>,
) -> Result<impl IntoResponse> {
    let delegate_id = state
        .dispatcher
        .fetch_selected_delegate_for_task(&account_id, task_id)
        .await?;
    Ok(Json(SelectedDelegateResponse {
        task_id,
        delegate_id,
    }))
}

async fn list_delegates(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> impl IntoResponse {
    Json(state.dispatcher.list_delegates(&account_id).await)
}

/// POST /delegates - full registration
async fn register_delegate(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    Json(req): Json<RegisterDelegateRequest>,
) -> Result<impl IntoResponse> {
    if req.delegate_id.trim().is_empty() {
        return Err(crate::error::DispatchError::InvalidTask(
            "delegate_id is required".to_string(),
        ));
    }
    let delegate = state
        .dispatcher
        .register_delegate(req.into_registration(&account_id))
        .await;
    Ok((StatusCode::CREATED, Json(delegate)))
}

async fn mark_approval(
    State(state): State<Arc<AppState>>,
    Path((account_id, delegate_id)): Path<(String, String)>,
    Json(req): Json<ApprovalRequest>,
) -> Result<impl IntoResponse> {
    let delegate = state
        .dispatcher
        .mark_approval(&account_id, &delegate_id, req.action)
        .await?;
    Ok(Json(delegate))
}

async fn mark_disconnected(
    State(state): State<Arc<AppState>>,
    Path((account_id, delegate_id)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    let failed_over = state
        .dispatcher
        .mark_disconnected(&account_id, &delegate_id)
        .await?;
    Ok(Json(DisconnectResponse {
        delegate_id,
        failed_over,
    }))
}
