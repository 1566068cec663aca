//! Plan endpoints

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};

use weaver_core::plan::Plan;

use crate::error::AppError;
use crate::AppState;

/// Build the plans router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/:id", get(get_plan))
        .route("/:id/abort", post(abort_plan))
}

async fn get_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<String>,
) -> Result<Json<Plan>, AppError> {
    state
        .executor()
        .plan(&plan_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("plan not found: {}", plan_id)))
}

/// Cancel in-flight tasks and settle the rest; returns the aborted plan
async fn abort_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<String>,
) -> Result<Json<Plan>, AppError> {
    let plan = state.executor().abort(&plan_id)?;
    Ok(Json(plan))
}
