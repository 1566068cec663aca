//! Test doubles
//!
//! - `ScriptedProvider` - an `LlmProvider` that replays canned turns
//! - `ScriptedRunner` - a `TaskRunner` with scripted per-task outcomes that
//!   records what the executor asked of it

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::agent::AgentCancellation;
use crate::ai::provider::{LlmProvider, StreamPart};
use crate::ai::types::{AiTool, AiToolCall, FinishReason, ModelMessage, Usage};
use crate::error::{AgentError, ProviderError};
use crate::plan::{TaskAssignment, TaskOutput, TaskRunner};

enum TurnKind {
    Text(String),
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    Fail(ProviderError),
    Hang,
}

/// One canned model response
pub struct ScriptedTurn {
    kind: TurnKind,
    usage: Option<Usage>,
}

impl ScriptedTurn {
    pub fn text(text: &str) -> Self {
        Self {
            kind: TurnKind::Text(text.to_string()),
            usage: None,
        }
    }

    pub fn tool_call(id: &str, name: &str, arguments: Value) -> Self {
        Self {
            kind: TurnKind::ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            },
            usage: None,
        }
    }

    /// The request fails before any part is streamed
    pub fn fail(error: ProviderError) -> Self {
        Self {
            kind: TurnKind::Fail(error),
            usage: None,
        }
    }

    /// The stream stays open and silent
    pub fn hang() -> Self {
        Self {
            kind: TurnKind::Hang,
            usage: None,
        }
    }

    pub fn with_usage(mut self, prompt_tokens: usize, completion_tokens: usize) -> Self {
        self.usage = Some(Usage::new(prompt_tokens, completion_tokens));
        self
    }
}

/// Provider that answers each request with the next scripted turn
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<Vec<ModelMessage>>>,
    held: Mutex<Vec<mpsc::UnboundedSender<StreamPart>>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far
    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    /// Messages sent with the `index`th request
    pub fn request(&self, index: usize) -> Option<Vec<ModelMessage>> {
        self.requests.lock().get(index).cloned()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream_chat(
        &self,
        messages: Vec<ModelMessage>,
        _tools: Vec<AiTool>,
    ) -> Result<mpsc::UnboundedReceiver<StreamPart>, ProviderError> {
        self.requests.lock().push(messages);
        let turn = self
            .turns
            .lock()
            .pop_front()
            .ok_or_else(|| ProviderError::permanent("no scripted turn left"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let finish = match turn.kind {
            TurnKind::Fail(error) => return Err(error),
            TurnKind::Hang => {
                self.held.lock().push(tx);
                return Ok(rx);
            }
            TurnKind::Text(text) => {
                let _ = tx.send(StreamPart::TextDelta { delta: text });
                FinishReason::Stop
            }
            TurnKind::ToolCall {
                id,
                name,
                arguments,
            } => {
                let _ = tx.send(StreamPart::ToolCallStart {
                    id: id.clone(),
                    name: name.clone(),
                });
                let _ = tx.send(StreamPart::ToolCallComplete {
                    tool_call: AiToolCall {
                        id,
                        name,
                        arguments,
                    },
                });
                FinishReason::ToolCalls
            }
        };
        if let Some(usage) = turn.usage {
            let _ = tx.send(StreamPart::Usage { usage });
        }
        let _ = tx.send(StreamPart::Finish { reason: finish });
        Ok(rx)
    }
}

enum StepOutcome {
    Ok(String),
    Fail(AgentError),
    /// Waits for cancellation
    Hang,
    /// Never returns, even when cancelled
    Stuck,
}

/// One scripted attempt at a task
pub struct Step {
    outcome: StepOutcome,
    delay: Duration,
}

impl Step {
    pub fn ok(summary: &str) -> Self {
        Self::new(StepOutcome::Ok(summary.to_string()))
    }

    pub fn fail(error: AgentError) -> Self {
        Self::new(StepOutcome::Fail(error))
    }

    pub fn hang() -> Self {
        Self::new(StepOutcome::Hang)
    }

    pub fn stuck() -> Self {
        Self::new(StepOutcome::Stuck)
    }

    /// Take `delay` before producing the outcome
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn new(outcome: StepOutcome) -> Self {
        Self {
            outcome,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Default)]
struct RunnerLog {
    attempts: HashMap<String, usize>,
    first_started: Vec<String>,
    assignments: HashMap<String, TaskAssignment>,
    cancellations: HashMap<String, Vec<AgentCancellation>>,
    active: HashSet<String>,
    peak: usize,
    overlaps: HashMap<String, HashSet<String>>,
}

/// Task runner driven by per-task scripts.
///
/// Tasks without a script, or whose script ran out, succeed immediately.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    log: Mutex<RunnerLog>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcomes of successive attempts at `task_id`
    pub fn script(self, task_id: &str, steps: Vec<Step>) -> Self {
        self.scripts.lock().insert(task_id.to_string(), steps.into());
        self
    }

    pub fn attempts(&self, task_id: &str) -> usize {
        self.log.lock().attempts.get(task_id).copied().unwrap_or(0)
    }

    /// Task ids in the order of their first attempt
    pub fn started_order(&self) -> Vec<String> {
        self.log.lock().first_started.clone()
    }

    pub fn last_assignment(&self, task_id: &str) -> Option<TaskAssignment> {
        self.log.lock().assignments.get(task_id).cloned()
    }

    /// Most attempts that were ever running at once
    pub fn peak_concurrency(&self) -> usize {
        self.log.lock().peak
    }

    /// Number of other tasks that ran at the same time as `task_id`
    pub fn max_overlap_with(&self, task_id: &str) -> usize {
        self.log
            .lock()
            .overlaps
            .get(task_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Whether the latest attempt of every listed task was cancelled
    pub fn all_cancelled(&self, task_ids: &[&str]) -> bool {
        let log = self.log.lock();
        task_ids.iter().all(|id| {
            log.cancellations
                .get(*id)
                .and_then(|c| c.last())
                .map(|c| c.is_cancelled())
                .unwrap_or(false)
        })
    }

    /// Wait until every listed task has started at least once
    pub async fn wait_started(&self, task_ids: &[&str]) {
        for _ in 0..2500 {
            let started = {
                let log = self.log.lock();
                task_ids.iter().all(|id| log.attempts.contains_key(*id))
            };
            if started {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("tasks {:?} never started", task_ids);
    }

    fn begin(&self, assignment: &TaskAssignment, cancellation: &AgentCancellation) {
        let task_id = assignment.task.id.clone();
        let mut log = self.log.lock();
        *log.attempts.entry(task_id.clone()).or_insert(0) += 1;
        if !log.first_started.contains(&task_id) {
            log.first_started.push(task_id.clone());
        }
        log.assignments.insert(task_id.clone(), assignment.clone());
        log.cancellations
            .entry(task_id.clone())
            .or_default()
            .push(cancellation.clone());

        let others: Vec<String> = log.active.iter().cloned().collect();
        for other in others {
            log.overlaps
                .entry(task_id.clone())
                .or_default()
                .insert(other.clone());
            log.overlaps.entry(other).or_default().insert(task_id.clone());
        }
        log.active.insert(task_id);
        log.peak = log.peak.max(log.active.len());
    }
}

struct ActiveGuard<'a> {
    log: &'a Mutex<RunnerLog>,
    task_id: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.log.lock().active.remove(&self.task_id);
    }
}

#[async_trait]
impl TaskRunner for ScriptedRunner {
    async fn run_task(
        &self,
        assignment: TaskAssignment,
        cancellation: AgentCancellation,
    ) -> Result<TaskOutput, AgentError> {
        let task_id = assignment.task.id.clone();
        let step = self
            .scripts
            .lock()
            .get_mut(&task_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Step::ok(&format!("{} done", assignment.task.title)));

        self.begin(&assignment, &cancellation);
        let _active = ActiveGuard {
            log: &self.log,
            task_id,
        };

        if !step.delay.is_zero() {
            tokio::select! {
                _ = cancellation.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(step.delay) => {}
            }
        }

        match step.outcome {
            StepOutcome::Ok(summary) => Ok(TaskOutput {
                summary,
                usage: Usage::new(10, 2),
            }),
            StepOutcome::Fail(error) => Err(error),
            StepOutcome::Hang => {
                cancellation.cancelled().await;
                Err(AgentError::Cancelled)
            }
            StepOutcome::Stuck => std::future::pending().await,
        }
    }
}
