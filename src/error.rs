//! Error types for the dispatch core
//!
//! Claim conflicts and ineligibility are not errors; they are ordinary
//! outcomes returned as values by the queue and the dispatcher.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Delegate not found: {0}")]
    DelegateNotFound(String),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Delegate {delegate_id} does not own task {task_id}")]
    NotAssigned { task_id: Uuid, delegate_id: String },

    #[error("All delegates failed for task {task_id}: {message}")]
    AllDelegatesFailed { task_id: Uuid, message: String },

    #[error("Task {task_id} expired: {message}")]
    Expired { task_id: Uuid, message: String },

    #[error("Task {0} was aborted")]
    Aborted(Uuid),

    #[error("Timed out waiting for task {0}")]
    SyncTimeout(Uuid),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Database(_) | DispatchError::SyncTimeout(_))
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = match &self {
            DispatchError::Database(e) => {
                tracing::error!("Database error: {}", e);
                StatusCode::SERVICE_UNAVAILABLE
            }
            DispatchError::Serialization(e) => {
                tracing::error!("Serialization error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            DispatchError::TaskNotFound(_) | DispatchError::DelegateNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            DispatchError::InvalidTask(_) => StatusCode::BAD_REQUEST,
            DispatchError::InvalidStateTransition(_) | DispatchError::NotAssigned { .. } => {
                StatusCode::CONFLICT
            }
            DispatchError::AllDelegatesFailed { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::Expired { .. } | DispatchError::Aborted(_) => StatusCode::GONE,
            DispatchError::SyncTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = axum::Json(serde_json::json!({
            "error": self.to_string(),
            "retryable": self.is_retryable(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
