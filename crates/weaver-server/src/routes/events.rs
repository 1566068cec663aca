//! Session event history and the catch-up stream

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use futures::stream::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use weaver_core::events::{EventSubscription, SessionEvent};

use crate::error::AppError;
use crate::types::{EventsQuery, StreamEvent};
use crate::AppState;

const TERMINAL_RUN_EVENTS: &[&str] = &["run_completed", "run_failed", "run_cancelled"];

/// Build the session events router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/:id/events", get(list_events))
        .route("/:id/stream", get(stream_events))
}

/// Persisted events after `since_seq`, in seq order
async fn list_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<SessionEvent>>, AppError> {
    let events = state.store.get_events(&session_id, query.since_seq).await?;
    Ok(Json(events))
}

/// Replay persisted events after `since_seq`, then follow live events until
/// the session's runs settle.
///
/// The stream ends with a `done` frame. When nothing is in flight it ends
/// right after the replay.
async fn stream_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    // Subscribe, then drain the writer so the log holds everything published
    // before the subscription
    let live = state.bus.subscribe_session(&session_id);
    state.bus.flush().await;
    let backlog = state.store.get_events(&session_id, query.since_seq).await?;

    let last_run_event = backlog
        .iter()
        .rev()
        .find(|e| e.event_type.starts_with("run_"))
        .map(|e| e.event_type.as_str());
    let settled = state.coordinator.active_runs(&session_id).is_empty()
        && last_run_event.map_or(true, |t| TERMINAL_RUN_EVENTS.contains(&t));

    tracing::debug!(
        session_id = %session_id,
        since_seq = ?query.since_seq,
        replay = backlog.len(),
        settled,
        "Event stream opened"
    );

    let (sse_tx, sse_rx) = mpsc::channel::<Result<Event, Infallible>>(100);
    tokio::spawn(forward(sse_tx, backlog, live, settled));

    let stream = ReceiverStream::new(sse_rx);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn forward(
    sse_tx: mpsc::Sender<Result<Event, Infallible>>,
    backlog: Vec<SessionEvent>,
    mut live: EventSubscription,
    settled: bool,
) {
    for event in backlog {
        let frame = StreamEvent {
            event_type: event.event_type,
            payload: event.payload,
            timestamp: Some(event.created_at.to_rfc3339()),
            seq: Some(event.seq),
        };
        if !send_event(&sse_tx, &frame).await {
            return;
        }
    }

    if !settled {
        loop {
            let event = tokio::select! {
                _ = sse_tx.closed() => return,
                event = live.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            let last = TERMINAL_RUN_EVENTS.contains(&event.event_type.as_str());
            let frame = StreamEvent {
                event_type: event.event_type,
                payload: event.payload,
                timestamp: Some(event.timestamp.to_rfc3339()),
                seq: None,
            };
            if !send_event(&sse_tx, &frame).await {
                return;
            }
            if last {
                break;
            }
        }
    }

    send_event(&sse_tx, &StreamEvent::done()).await;
}

async fn send_event(sse_tx: &mpsc::Sender<Result<Event, Infallible>>, event: &StreamEvent) -> bool {
    let sse_event = Event::default()
        .json_data(event)
        .unwrap_or_else(|_| Event::default().data("error"));
    sse_tx.send(Ok(sse_event)).await.is_ok()
}
