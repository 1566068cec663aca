//! Unified error handling for the API

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use weaver_core::{ExecutorError, RunError};

/// API error response body
#[derive(Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
}

/// Application error types
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    /// The target exists but is in the wrong state for the request
    Conflict(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
        };

        (
            status,
            Json(ApiError {
                error: message,
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Log full error chain for debugging, return sanitized message to client
        tracing::error!("Internal error: {:?}", err);
        AppError::Internal(err.to_string())
    }
}

impl From<ExecutorError> for AppError {
    fn from(err: ExecutorError) -> Self {
        let message = err.to_string();
        match err {
            ExecutorError::PlanNotFound(_) | ExecutorError::TaskNotFound(_) => {
                AppError::NotFound(message)
            }
            ExecutorError::InvalidTransition { .. } | ExecutorError::AlreadyRunning(_) => {
                AppError::Conflict(message)
            }
            ExecutorError::InvalidPlan(_) => AppError::BadRequest(message),
        }
    }
}

impl From<RunError> for AppError {
    fn from(err: RunError) -> Self {
        let message = err.to_string();
        match err {
            RunError::NotFound(_) => AppError::NotFound(message),
            RunError::InvalidState { .. } | RunError::NoPendingInput(_) => {
                AppError::Conflict(message)
            }
            RunError::Executor(e) => e.into(),
            RunError::Storage(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: impl Into<AppError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn domain_errors_map_to_http_statuses() {
        assert_eq!(
            status_of(RunError::NotFound("r1".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(RunError::NoPendingInput("r1".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(RunError::Executor(ExecutorError::TaskNotFound("t1".into()))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(ExecutorError::InvalidPlan("cycle".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(RunError::Storage(anyhow::anyhow!("disk gone"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
