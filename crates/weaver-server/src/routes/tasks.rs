//! Task recovery endpoints

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};

use weaver_core::plan::{TaskExecutor, TaskStatus};
use weaver_core::ExecutorError;

use crate::error::AppError;
use crate::types::TaskActionResponse;
use crate::AppState;

/// Build the tasks router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/:id/blocked", get(blocked_downstream))
        .route("/:id/retry", post(retry_task))
        .route("/:id/skip", post(skip_task))
}

/// Tasks held back, directly or transitively, by this one
async fn blocked_downstream(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Vec<String>>, AppError> {
    Ok(Json(state.executor().blocked_downstream(&task_id)?))
}

/// Requeue a failed or timed-out task with a fresh retry budget
async fn retry_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskActionResponse>, AppError> {
    let executor = state.executor();
    let plan_id = plan_of(executor, &task_id)?;
    let blocked = executor.blocked_downstream(&task_id)?;
    executor.retry(&task_id)?;
    redrive(executor, &plan_id);
    let unblocked = unblocked_now(executor, &plan_id, blocked);

    Ok(Json(TaskActionResponse {
        task_id,
        plan_id,
        unblocked,
    }))
}

/// Skip a task and release the tasks that were waiting only on it
async fn skip_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskActionResponse>, AppError> {
    let executor = state.executor();
    let plan_id = plan_of(executor, &task_id)?;
    let unblocked = executor.skip(&task_id)?;
    redrive(executor, &plan_id);

    Ok(Json(TaskActionResponse {
        task_id,
        plan_id,
        unblocked,
    }))
}

fn plan_of(executor: &TaskExecutor, task_id: &str) -> Result<String, AppError> {
    executor
        .plan_id_for_task(task_id)
        .ok_or_else(|| ExecutorError::TaskNotFound(task_id.to_string()).into())
}

/// Of the tasks blocked before a retry, those no longer blocked after it
fn unblocked_now(executor: &TaskExecutor, plan_id: &str, before: Vec<String>) -> Vec<String> {
    let Some(plan) = executor.plan(plan_id) else {
        return Vec::new();
    };
    before
        .into_iter()
        .filter(|id| {
            plan.task(id)
                .map(|t| t.status != TaskStatus::Blocked)
                .unwrap_or(false)
        })
        .collect()
}

/// Drive the plan again unless something already is
fn redrive(executor: &TaskExecutor, plan_id: &str) {
    if executor.is_driving(plan_id) {
        return;
    }
    let executor = executor.clone();
    let plan_id = plan_id.to_string();
    tokio::spawn(async move {
        match executor.resume(&plan_id).await {
            Ok(plan) => {
                tracing::info!(plan_id = %plan_id, status = %plan.status, "Re-driven plan settled")
            }
            Err(ExecutorError::AlreadyRunning(_)) => {}
            Err(e) => tracing::warn!(plan_id = %plan_id, error = %e, "Failed to re-drive plan"),
        }
    });
}
