use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event types that are written to the session log.
///
/// Streaming deltas, keep-alives, and progress ticks are live-only; any type
/// not listed here is never persisted.
pub const PERSISTED_EVENT_TYPES: &[&str] = &[
    "agent_start",
    "agent_end",
    "agent_complete",
    "agent_error",
    "tool_call",
    "tool_result",
    "plan_created",
    "plan_updated",
    "task_started",
    "task_done",
    "task_completed",
    "task_failed",
    "task_aborted",
    "task_retrying",
    "task_skipped",
    "task_blocked",
    "run_created",
    "run_started",
    "run_waiting_input",
    "run_resumed",
    "run_completed",
    "run_failed",
    "run_cancelled",
    "interview_question",
    "interview_answer",
    "version_created",
    "snapshot_created",
];

/// Whether an event of this type belongs in the durable log
pub fn should_store(event_type: &str) -> bool {
    PERSISTED_EVENT_TYPES.contains(&event_type)
}

/// Known event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentStart,
    AgentProgress,
    AgentEnd,
    AgentComplete,
    AgentError,
    Delta,
    Thinking,
    Ping,
    ToolCall,
    ToolResult,
    PlanCreated,
    PlanUpdated,
    TaskStarted,
    TaskDone,
    TaskCompleted,
    TaskFailed,
    TaskAborted,
    TaskRetrying,
    TaskSkipped,
    TaskBlocked,
    RunCreated,
    RunStarted,
    RunWaitingInput,
    RunResumed,
    RunCompleted,
    RunFailed,
    RunCancelled,
    InterviewQuestion,
    InterviewAnswer,
    VersionCreated,
    SnapshotCreated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentStart => "agent_start",
            Self::AgentProgress => "agent_progress",
            Self::AgentEnd => "agent_end",
            Self::AgentComplete => "agent_complete",
            Self::AgentError => "agent_error",
            Self::Delta => "delta",
            Self::Thinking => "thinking",
            Self::Ping => "ping",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::PlanCreated => "plan_created",
            Self::PlanUpdated => "plan_updated",
            Self::TaskStarted => "task_started",
            Self::TaskDone => "task_done",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::TaskAborted => "task_aborted",
            Self::TaskRetrying => "task_retrying",
            Self::TaskSkipped => "task_skipped",
            Self::TaskBlocked => "task_blocked",
            Self::RunCreated => "run_created",
            Self::RunStarted => "run_started",
            Self::RunWaitingInput => "run_waiting_input",
            Self::RunResumed => "run_resumed",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
            Self::RunCancelled => "run_cancelled",
            Self::InterviewQuestion => "interview_question",
            Self::InterviewAnswer => "interview_answer",
            Self::VersionCreated => "version_created",
            Self::SnapshotCreated => "snapshot_created",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }

    pub fn is_persisted(&self) -> bool {
        should_store(self.as_str())
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which layer produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Session,
    Plan,
    Task,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Plan => "plan",
            Self::Task => "task",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "session" => Some(Self::Session),
            "plan" => Some(Self::Plan),
            "task" => Some(Self::Task),
            _ => None,
        }
    }
}

/// A published event, as delivered to live subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub session_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub source: EventSource,
    pub timestamp: DateTime<Utc>,
}

/// A persisted event with its session sequence number
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub id: String,
    pub session_id: String,
    pub seq: i64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub source: EventSource,
    pub created_at: DateTime<Utc>,
}

/// Typed event enums that can be published on the bus.
///
/// Implementors serialize with `#[serde(tag = "type")]`; the tag becomes the
/// event type and the remaining fields the payload.
pub trait DomainEvent: Serialize {
    fn source(&self) -> EventSource;
}

/// Split a tagged event into `(type, payload)`
pub fn split_event<E: Serialize>(event: &E) -> Option<(String, Value)> {
    let mut value = serde_json::to_value(event).ok()?;
    let object = value.as_object_mut()?;
    let event_type = match object.remove("type")? {
        Value::String(s) => s,
        _ => return None,
    };
    Some((event_type, value))
}
