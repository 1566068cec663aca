//! Plan and task lifecycle events

use serde::Serialize;

use super::types::{Plan, PlanStatus, TaskStatus};
use crate::agent::AgentType;
use crate::ai::types::Usage;
use crate::events::{DomainEvent, EventSource};

/// Task outline carried by `plan_created`
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutline {
    pub id: String,
    pub title: String,
    pub agent_type: AgentType,
    pub depends_on: Vec<String>,
    pub can_parallel: bool,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanEvent {
    PlanCreated {
        plan_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        goal: String,
        tasks: Vec<TaskOutline>,
    },
    PlanUpdated {
        plan_id: String,
        status: PlanStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        unblocked: Vec<String>,
    },
    TaskStarted {
        plan_id: String,
        task_id: String,
        title: String,
        agent_type: AgentType,
        attempt: u32,
    },
    TaskDone {
        plan_id: String,
        task_id: String,
        summary: String,
        retry_count: u32,
        usage: Usage,
    },
    /// Terminal failure; `status` tells `failed` and `timeout` apart
    TaskFailed {
        plan_id: String,
        task_id: String,
        status: TaskStatus,
        error: String,
        retry_count: u32,
        max_retries: u32,
        blocked_downstream: Vec<String>,
    },
    TaskAborted {
        plan_id: String,
        task_id: String,
        status: TaskStatus,
        reason: String,
    },
    TaskRetrying {
        plan_id: String,
        task_id: String,
        /// Failed attempts so far
        attempt: u32,
        max_retries: u32,
        delay_ms: u64,
        error: String,
    },
    TaskSkipped {
        plan_id: String,
        task_id: String,
        reason: String,
    },
    TaskBlocked {
        plan_id: String,
        task_id: String,
        blocked_by: String,
    },
}

impl PlanEvent {
    pub fn created(plan: &Plan) -> Self {
        Self::PlanCreated {
            plan_id: plan.id.clone(),
            run_id: plan.run_id.clone(),
            goal: plan.goal.clone(),
            tasks: plan
                .tasks
                .iter()
                .map(|t| TaskOutline {
                    id: t.id.clone(),
                    title: t.title.clone(),
                    agent_type: t.agent_type,
                    depends_on: t.depends_on.clone(),
                    can_parallel: t.can_parallel,
                    required: t.required,
                })
                .collect(),
        }
    }
}

impl DomainEvent for PlanEvent {
    fn source(&self) -> EventSource {
        match self {
            Self::PlanCreated { .. } | Self::PlanUpdated { .. } => EventSource::Plan,
            _ => EventSource::Task,
        }
    }
}
