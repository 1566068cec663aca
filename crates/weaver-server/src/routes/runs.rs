//! Run control endpoints

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};

use crate::error::AppError;
use crate::types::{
    CancelRunRequest, ProvideInputRequest, ProvideInputResponse, RunResponse, RunStatusResponse,
};
use crate::AppState;

const DEFAULT_CANCEL_REASON: &str = "cancelled by user";

/// Build the runs router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/:id", get(get_run))
        .route("/:id/input", post(provide_input))
        .route("/:id/cancel", post(cancel_run))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunResponse>, AppError> {
    let run = state
        .coordinator
        .record(&run_id)
        .ok_or_else(|| AppError::NotFound(format!("run not found: {}", run_id)))?;
    let pending_questions = state.coordinator.pending_questions(&run_id)?;
    Ok(Json(RunResponse {
        run,
        pending_questions,
    }))
}

/// Answer a question the run is blocked on
async fn provide_input(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(req): Json<ProvideInputRequest>,
) -> Result<Json<ProvideInputResponse>, AppError> {
    if req.answer.trim().is_empty() {
        return Err(AppError::BadRequest("answer must not be empty".to_string()));
    }

    let question_id =
        state
            .coordinator
            .provide_input(&run_id, &req.answer, req.question_id.as_deref())?;
    let status = state
        .coordinator
        .status(&run_id)
        .ok_or_else(|| AppError::NotFound(format!("run not found: {}", run_id)))?;

    tracing::info!(run_id = %run_id, question_id = %question_id, "Input provided");
    Ok(Json(ProvideInputResponse {
        run_id,
        question_id,
        status,
    }))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    req: Option<Json<CancelRunRequest>>,
) -> Result<Json<RunStatusResponse>, AppError> {
    let reason = req
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());

    state.coordinator.cancel(&run_id, &reason)?;
    let status = state
        .coordinator
        .status(&run_id)
        .ok_or_else(|| AppError::NotFound(format!("run not found: {}", run_id)))?;

    Ok(Json(RunStatusResponse { run_id, status }))
}
