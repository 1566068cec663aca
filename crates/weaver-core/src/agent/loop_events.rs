//! Events published by the agent loop.
//!
//! `AgentEvent` is everything one agent invocation reports. The emitter tags
//! each event with the agent and task it belongs to before it goes on the
//! bus, so consumers can group the interleaved events of parallel tasks.

use serde::Serialize;
use serde_json::Value;

use super::AgentType;
use crate::ai::types::Usage;
use crate::events::{split_event, DomainEvent, EventBus, EventSource};

/// Events emitted by the agent loop.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStart {
        agent_type: AgentType,
    },

    /// Iteration tick (live only)
    AgentProgress {
        iteration: usize,
        max_iterations: usize,
    },

    /// Text content delta from the model (live only)
    Delta {
        delta: String,
    },

    /// Extended thinking delta (live only)
    Thinking {
        thinking: String,
    },

    ToolCall {
        tool_call_id: String,
        name: String,
        arguments: Value,
    },

    ToolResult {
        tool_call_id: String,
        name: String,
        output: String,
        success: bool,
    },

    /// Loop finished; `outcome` is `completed` or `cancelled`
    AgentEnd {
        outcome: String,
        iterations: usize,
        usage: Usage,
    },

    AgentError {
        kind: String,
        message: String,
        iterations: usize,
        usage: Usage,
    },
}

impl DomainEvent for AgentEvent {
    fn source(&self) -> EventSource {
        EventSource::Task
    }
}

/// Publishes `AgentEvent`s for one agent invocation
#[derive(Clone)]
pub struct AgentEmitter {
    bus: EventBus,
    session_id: String,
    agent_id: String,
    task_id: Option<String>,
}

impl AgentEmitter {
    pub fn new(
        bus: EventBus,
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
        task_id: Option<String>,
    ) -> Self {
        Self {
            bus,
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            task_id,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn emit(&self, event: AgentEvent) {
        let Some((event_type, mut payload)) = split_event(&event) else {
            tracing::error!(agent_id = %self.agent_id, "Failed to serialize agent event");
            return;
        };
        if let Some(object) = payload.as_object_mut() {
            object.insert("agent_id".to_string(), Value::String(self.agent_id.clone()));
            if let Some(task_id) = &self.task_id {
                object.insert("task_id".to_string(), Value::String(task_id.clone()));
            }
        }
        let source = if self.task_id.is_some() {
            event.source()
        } else {
            EventSource::Session
        };
        self.bus.publish(&self.session_id, event_type, payload, source);
    }
}
