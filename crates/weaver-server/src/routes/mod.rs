//! API routes

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};

use crate::AppState;

mod events;
mod plans;
mod runs;
mod tasks;

/// Build the API router with all endpoints
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .nest("/sessions", events::router())
        .nest("/runs", runs::router())
        .nest("/plans", plans::router())
        .nest("/tasks", tasks::router())
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
