//! API request and response types

use serde::{Deserialize, Serialize};
use serde_json::Value;

use weaver_core::run::{PendingQuestion, RunStatus};
use weaver_core::storage::RunRecord;

/// Query for event history and the catch-up stream
#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Only events with a greater seq
    pub since_seq: Option<i64>,
}

/// One SSE frame on the session stream.
///
/// `seq` is absent for live-only events (deltas, pings) and the final
/// `done` sentinel.
#[derive(Debug, Serialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
}

impl StreamEvent {
    pub fn done() -> Self {
        Self {
            event_type: "done".to_string(),
            payload: Value::Null,
            timestamp: None,
            seq: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ProvideInputRequest {
    pub answer: String,
    pub question_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProvideInputResponse {
    pub run_id: String,
    pub question_id: String,
    pub status: RunStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRunRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunStatusResponse {
    pub run_id: String,
    pub status: RunStatus,
}

/// A run with the questions it is waiting on
#[derive(Debug, Serialize)]
pub struct RunResponse {
    #[serde(flatten)]
    pub run: RunRecord,
    pub pending_questions: Vec<PendingQuestion>,
}

#[derive(Debug, Serialize)]
pub struct TaskActionResponse {
    pub task_id: String,
    pub plan_id: String,
    /// Tasks that went from blocked back to pending
    pub unblocked: Vec<String>,
}
