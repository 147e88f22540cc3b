//! Host-side error type and its `axum` response mapping (spec.md §7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kohakuriver_common::ErrorKind;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("{0}")]
    Validation(String),

    #[error("no node satisfies the request: {0}")]
    ResourceExhaustion(String),

    #[error("task {0} not found")]
    NotFound(i64),

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("runner dispatch failed: {0}")]
    Dispatch(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl HostError {
    fn kind(&self) -> ErrorKind {
        match self {
            HostError::Validation(_) => ErrorKind::Validation,
            HostError::ResourceExhaustion(_) => ErrorKind::ResourceExhaustion,
            HostError::NotFound(_) | HostError::NodeNotFound(_) => ErrorKind::Validation,
            HostError::StateConflict(_) => ErrorKind::StateConflict,
            HostError::Dispatch(_) => ErrorKind::Dispatch,
            HostError::Database(_) => ErrorKind::FatalInvariant,
            HostError::Serialization(_) => ErrorKind::FatalInvariant,
            HostError::Internal(_) => ErrorKind::FatalInvariant,
        }
    }
}

impl IntoResponse for HostError {
    fn into_response(self) -> Response {
        let status = match &self {
            HostError::NotFound(_) | HostError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            other => StatusCode::from_u16(other.kind().http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        };
        if matches!(
            self,
            HostError::Database(_) | HostError::Internal(_) | HostError::Serialization(_)
        ) {
            tracing::error!(error = %self, "host request failed");
        } else {
            tracing::debug!(error = %self, "host request rejected");
        }
        (status, axum::Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type HostResult<T> = Result<T, HostError>;
