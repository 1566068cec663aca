//! Plan and task records
//!
//! Only the task executor mutates these once a plan is registered.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentType;
use crate::ai::types::Usage;
use crate::constants;
use crate::error::ExecutorError;

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Retrying,
    Blocked,
    Done,
    Failed,
    Aborted,
    Timeout,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Retrying => "retrying",
            Self::Blocked => "blocked",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::Timeout => "timeout",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "in_progress" => Self::InProgress,
            "retrying" => Self::Retrying,
            "blocked" => Self::Blocked,
            "done" => Self::Done,
            "failed" => Self::Failed,
            "aborted" => Self::Aborted,
            "timeout" => Self::Timeout,
            "skipped" => Self::Skipped,
            _ => return None,
        })
    }

    /// No further automatic transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Failed | Self::Aborted | Self::Timeout | Self::Skipped
        )
    }

    /// Satisfies dependents
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Done | Self::Skipped)
    }

    /// Prevents dependents from ever starting without manual recovery
    pub fn blocks_dependents(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Aborted | Self::Timeout | Self::Blocked
        )
    }

    /// Manual `retry` is allowed from here
    pub fn is_retryable_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Timeout)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of agent work inside a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub agent_type: AgentType,
    pub status: TaskStatus,
    /// 0-100
    pub progress: u8,
    pub depends_on: Vec<String>,
    pub can_parallel: bool,
    /// Whether the plan can only succeed if this task does
    pub required: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub token_usage: Usage,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        agent_type: AgentType,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            agent_type,
            status: TaskStatus::Pending,
            progress: 0,
            depends_on: Vec::new(),
            can_parallel: false,
            required: true,
            retry_count: 0,
            max_retries: constants::executor::MAX_RETRIES,
            error_message: None,
            token_usage: Usage::default(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn parallel(mut self) -> Self {
        self.can_parallel = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Clear outcome fields before another attempt
    pub(crate) fn reset_outcome(&mut self) {
        self.progress = 0;
        self.error_message = None;
        self.started_at = None;
        self.completed_at = None;
    }
}

/// Derived plan state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Done,
    Failed,
    Aborted,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "done" => Self::Done,
            "failed" => Self::Failed,
            "aborted" => Self::Aborted,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Aborted)
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A goal decomposed into dependent tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub session_id: String,
    pub run_id: Option<String>,
    pub goal: String,
    pub tasks: Vec<Task>,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(session_id: impl Into<String>, goal: impl Into<String>, tasks: Vec<Task>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            run_id: None,
            goal: goal.into(),
            tasks,
            status: PlanStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    /// Unique ids, known dependencies, no cycles
    pub fn validate(&self) -> Result<(), ExecutorError> {
        let mut ids = HashSet::new();
        for task in &self.tasks {
            if !ids.insert(task.id.as_str()) {
                return Err(ExecutorError::InvalidPlan(format!(
                    "duplicate task id {}",
                    task.id
                )));
            }
        }
        for task in &self.tasks {
            for dep in &task.depends_on {
                if dep == &task.id {
                    return Err(ExecutorError::InvalidPlan(format!(
                        "task {} depends on itself",
                        task.id
                    )));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(ExecutorError::InvalidPlan(format!(
                        "task {} depends on unknown task {}",
                        task.id, dep
                    )));
                }
            }
        }

        // Kahn's algorithm: anything left unvisited sits on a cycle
        let mut in_degree: HashMap<&str, usize> = self
            .tasks
            .iter()
            .map(|t| (t.id.as_str(), t.depends_on.len()))
            .collect();
        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for dependent in self.dependents_of(id) {
                if let Some(d) = in_degree.get_mut(dependent.id.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(dependent.id.as_str());
                    }
                }
            }
        }
        if visited != self.tasks.len() {
            return Err(ExecutorError::InvalidPlan(
                "task dependencies contain a cycle".to_string(),
            ));
        }
        Ok(())
    }

    /// Tasks that list `task_id` as a direct dependency
    pub fn dependents_of<'a>(&'a self, task_id: &'a str) -> impl Iterator<Item = &'a Task> + 'a {
        self.tasks
            .iter()
            .filter(move |t| t.depends_on.iter().any(|d| d == task_id))
    }

    /// All dependencies done or skipped
    pub fn dependencies_satisfied(&self, task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            self.task(dep)
                .map(|d| d.status.is_success())
                .unwrap_or(false)
        })
    }

    /// Some dependency can no longer succeed without manual recovery
    pub fn has_blocking_dependency(&self, task: &Task) -> bool {
        task.depends_on.iter().any(|dep| {
            self.task(dep)
                .map(|d| d.status.blocks_dependents())
                .unwrap_or(false)
        })
    }

    /// Transitive dependents of `task_id`, in plan order
    pub fn transitive_dependents(&self, task_id: &str) -> Vec<String> {
        let mut found: HashSet<String> = HashSet::new();
        let mut queue = VecDeque::from([task_id.to_string()]);
        while let Some(id) = queue.pop_front() {
            for dependent in self.dependents_of(&id) {
                if found.insert(dependent.id.clone()) {
                    queue.push_back(dependent.id.clone());
                }
            }
        }
        self.tasks
            .iter()
            .filter(|t| found.contains(&t.id))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Transitive dependents of `task_id` that are currently blocked
    pub fn blocked_downstream(&self, task_id: &str) -> Vec<String> {
        self.transitive_dependents(task_id)
            .into_iter()
            .filter(|id| {
                self.task(id)
                    .map(|t| t.status == TaskStatus::Blocked)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Nothing left that could still make progress on its own
    pub fn is_settled(&self) -> bool {
        self.tasks.iter().all(|t| {
            t.status.is_terminal() || t.status == TaskStatus::Blocked
        })
    }

    /// Status implied by the task states
    pub fn derive_status(&self) -> PlanStatus {
        if self.status == PlanStatus::Aborted {
            return PlanStatus::Aborted;
        }
        if !self.is_settled() {
            let started = self
                .tasks
                .iter()
                .any(|t| t.status != TaskStatus::Pending);
            return if started {
                PlanStatus::Running
            } else {
                PlanStatus::Pending
            };
        }
        let all_required_succeeded = self
            .tasks
            .iter()
            .filter(|t| t.required)
            .all(|t| t.status.is_success());
        if all_required_succeeded {
            PlanStatus::Done
        } else {
            PlanStatus::Failed
        }
    }

    /// Sum of token usage across tasks
    pub fn total_usage(&self) -> Usage {
        let mut total = Usage::default();
        for task in &self.tasks {
            total.add(&task.token_usage);
        }
        total
    }
}
