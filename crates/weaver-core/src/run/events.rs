//! Run lifecycle and interview events

use serde::Serialize;

use crate::events::{DomainEvent, EventSource};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunCreated {
        run_id: String,
    },
    RunStarted {
        run_id: String,
        plan_ids: Vec<String>,
    },
    RunWaitingInput {
        run_id: String,
        question_id: String,
        question: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
    },
    RunResumed {
        run_id: String,
        waited_ms: u64,
    },
    RunCompleted {
        run_id: String,
    },
    RunFailed {
        run_id: String,
        error: String,
    },
    RunCancelled {
        run_id: String,
        reason: String,
    },
    InterviewQuestion {
        run_id: String,
        question_id: String,
        question: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        options: Vec<String>,
        agent_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
    },
    InterviewAnswer {
        run_id: String,
        question_id: String,
        answer: String,
    },
}

impl DomainEvent for RunEvent {
    fn source(&self) -> EventSource {
        EventSource::Session
    }
}
