//! The seam between the task executor and whatever does a task's work

use std::sync::Arc;

use async_trait::async_trait;

use super::types::Task;
use crate::agent::AgentCancellation;
use crate::ai::types::Usage;
use crate::error::AgentError;
use crate::run::InputGate;

/// Result of a finished dependency, handed to the tasks that wait on it
#[derive(Debug, Clone)]
pub struct UpstreamResult {
    pub task_id: String,
    pub title: String,
    pub summary: String,
}

/// Everything a runner gets for one attempt at a task
#[derive(Clone)]
pub struct TaskAssignment {
    pub session_id: String,
    pub plan_id: String,
    pub goal: String,
    /// Snapshot at attempt start; `retry_count` is the number of failed attempts so far
    pub task: Task,
    pub upstream: Vec<UpstreamResult>,
    pub input_gate: Option<Arc<InputGate>>,
}

/// Successful attempt
#[derive(Debug, Clone, Default)]
pub struct TaskOutput {
    pub summary: String,
    pub usage: Usage,
}

/// Performs one attempt at a task.
///
/// Must return promptly once `cancellation` fires. Errors that report
/// `is_retryable()` are retried by the executor while attempts remain.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(
        &self,
        assignment: TaskAssignment,
        cancellation: AgentCancellation,
    ) -> Result<TaskOutput, AgentError>;
}
