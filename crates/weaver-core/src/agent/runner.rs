//! Runs plan tasks as agent loop invocations

use std::sync::Arc;

use async_trait::async_trait;

use super::agent_loop::{AgentLoop, AgentRequest};
use super::cancellation::AgentCancellation;
use super::context::ConversationContext;
use crate::ai::types::ModelMessage;
use crate::error::AgentError;
use crate::plan::{TaskAssignment, TaskOutput, TaskRunner};

/// Task runner backed by the agent loop.
///
/// Each attempt starts from a fresh context: the agent role's system
/// instruction, a pinned brief with the goal, the task, and the results of
/// its dependencies, then the task itself as the user turn.
pub struct AgentTaskRunner {
    agent: Arc<AgentLoop>,
}

impl AgentTaskRunner {
    pub fn new(agent: Arc<AgentLoop>) -> Self {
        Self { agent }
    }

    fn context_for(assignment: &TaskAssignment) -> ConversationContext {
        let task = &assignment.task;
        let mut context = ConversationContext::new(task.agent_type.system_instruction());
        context.push_pinned(ModelMessage::user(brief(assignment)));

        let mut instruction = format!("Task: {}", task.title);
        if !task.description.is_empty() {
            instruction.push_str("\n\n");
            instruction.push_str(&task.description);
        }
        if task.retry_count > 0 {
            // Let the model know earlier attempts went wrong
            if let Some(error) = &task.error_message {
                instruction.push_str(&format!(
                    "\n\nA previous attempt failed with: {}",
                    error
                ));
            }
        }
        context.push(ModelMessage::user(instruction));
        context
    }
}

fn brief(assignment: &TaskAssignment) -> String {
    let mut brief = format!("Overall goal: {}", assignment.goal);
    if !assignment.upstream.is_empty() {
        brief.push_str("\n\nResults of completed prerequisite tasks:");
        for upstream in &assignment.upstream {
            brief.push_str(&format!("\n- {}: {}", upstream.title, upstream.summary));
        }
    }
    brief
}

#[async_trait]
impl TaskRunner for AgentTaskRunner {
    async fn run_task(
        &self,
        assignment: TaskAssignment,
        cancellation: AgentCancellation,
    ) -> Result<TaskOutput, AgentError> {
        let request = AgentRequest::new(
            assignment.session_id.clone(),
            assignment.task.agent_type,
            Self::context_for(&assignment),
        )
        .with_task(assignment.task.id.clone())
        .with_input_gate(assignment.input_gate.clone());

        tracing::debug!(
            plan_id = %assignment.plan_id,
            task_id = %assignment.task.id,
            agent_id = %request.agent_id,
            agent_type = %assignment.task.agent_type,
            "Running task agent"
        );

        let outcome = self.agent.run(request, cancellation).await?;
        Ok(TaskOutput {
            summary: outcome.text,
            usage: outcome.usage,
        })
    }
}
