//! Weaver Server
//!
//! Thin HTTP surface over the Weaver engine: session event history, an SSE
//! stream that catches up from the event log and then follows the live bus,
//! and run/plan/task control endpoints.
//! The binary in `main.rs` starts it through `start_server()`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{http::Method, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use weaver_core::events::EventBus;
use weaver_core::plan::{PlanManager, TaskExecutor, TaskRunner};
use weaver_core::run::RunCoordinator;
use weaver_core::storage::EventStore;
use weaver_core::WeaverConfig;

pub mod error;
pub mod routes;
pub mod types;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub bus: EventBus,
    pub store: Arc<EventStore>,
    pub coordinator: RunCoordinator,
}

impl AppState {
    pub fn executor(&self) -> &TaskExecutor {
        self.coordinator.executor()
    }
}

/// Open storage and wire the bus, executor, and run coordinator together.
///
/// `make_runner` gets the server's bus so agent events land in the same log.
pub fn build_state<F>(config: &WeaverConfig, make_runner: F) -> anyhow::Result<AppState>
where
    F: FnOnce(&EventBus) -> Arc<dyn TaskRunner>,
{
    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let store = Arc::new(EventStore::open(&db_path)?);
    let bus = EventBus::with_store(
        config.events.subscriber_capacity,
        store.clone(),
        config.events.store_failure_alert_threshold,
    );
    let runner = make_runner(&bus);
    let plans = PlanManager::new(db_path);
    let executor = TaskExecutor::with_writer(
        bus.clone(),
        config.executor.clone(),
        plans.spawn_writer(),
    );
    let coordinator =
        RunCoordinator::persistent(bus.clone(), executor, runner, store.clone(), plans);

    Ok(AppState {
        bus,
        store,
        coordinator,
    })
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .nest("/api", routes::api_router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the server and block until shutdown.
///
/// Runs left unfinished by a previous process are restored so they can be
/// inspected and cancelled; with `resume_runs` their plans are driven again.
pub async fn start_server<F>(
    config: WeaverConfig,
    make_runner: F,
    resume_runs: bool,
) -> anyhow::Result<()>
where
    F: FnOnce(&EventBus) -> Arc<dyn TaskRunner>,
{
    let state = build_state(&config, make_runner)?;

    if resume_runs {
        let resumed = state.coordinator.resume_unfinished().await?;
        tracing::info!(runs = resumed.len(), "Resumed unfinished runs");
    } else {
        let restored = state.coordinator.restore_unfinished().await?;
        tracing::info!(runs = restored.len(), "Restored unfinished runs");
    }

    let addr: SocketAddr = format!("0.0.0.0:{}", config.server.port).parse()?;
    let app = build_router(state);

    tracing::info!("Weaver server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
