//! Runner-side error type and its `axum` response mapping (spec.md §7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kohakuriver_common::{ErrorKind, TaskId};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("{0}")]
    Validation(String),

    #[error("task {0} is already running on this node")]
    AlreadyRunning(TaskId),

    #[error("task {0} not found on this node")]
    NotFound(TaskId),

    #[error("runner has not finished startup reconciliation yet")]
    NotReady,

    #[error("docker operation failed: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl RunnerError {
    fn kind(&self) -> ErrorKind {
        match self {
            RunnerError::Validation(_) => ErrorKind::Validation,
            RunnerError::AlreadyRunning(_) => ErrorKind::Validation,
            RunnerError::NotFound(_) => ErrorKind::Validation,
            RunnerError::NotReady => ErrorKind::Dispatch,
            RunnerError::Docker(_) => ErrorKind::Dispatch,
            RunnerError::Database(_) => ErrorKind::FatalInvariant,
            RunnerError::Io(_) => ErrorKind::FatalInvariant,
            RunnerError::Serialization(_) => ErrorKind::FatalInvariant,
            RunnerError::Internal(_) => ErrorKind::FatalInvariant,
        }
    }
}

impl IntoResponse for RunnerError {
    fn into_response(self) -> Response {
        let status = match &self {
            RunnerError::NotFound(_) => StatusCode::NOT_FOUND,
            RunnerError::AlreadyRunning(_) => StatusCode::CONFLICT,
            RunnerError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            other => StatusCode::from_u16(other.kind().http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        };
        if matches!(
            self,
            RunnerError::Database(_) | RunnerError::Internal(_) | RunnerError::Io(_)
        ) {
            tracing::error!(error = %self, "runner request failed");
        } else {
            tracing::debug!(error = %self, "runner request rejected");
        }
        (status, axum::Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;
