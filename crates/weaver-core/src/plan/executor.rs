//! Task executor
//!
//! Drives a plan's tasks through their lifecycle. Each plan has one
//! scheduling loop that owns every decision: starting ready tasks, handling
//! finished attempts, firing retry deadlines, and sweeping timeouts. Workers
//! only run a `TaskRunner` and report back; a report from an attempt that was
//! aborted or timed out in the meantime is discarded.
//!
//! Every transition is published as an event and queued for persistence
//! while the plan lock is held, so both see transitions in the order they
//! happened.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;

use super::events::PlanEvent;
use super::manager::PlanWriter;
use super::runner::{TaskAssignment, TaskOutput, TaskRunner, UpstreamResult};
use super::types::{Plan, PlanStatus, Task, TaskStatus};
use crate::agent::{AgentCancellation, AgentType};
use crate::ai::retry::backoff_delay;
use crate::config::ExecutorSettings;
use crate::error::{AgentError, ExecutorError};
use crate::events::EventBus;
use crate::run::InputGate;

/// What a plan needs in order to be driven
#[derive(Clone)]
pub struct PlanContext {
    pub runner: Arc<dyn TaskRunner>,
    /// Present when the plan belongs to a run that can wait for the user
    pub input_gate: Option<Arc<InputGate>>,
}

impl PlanContext {
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            runner,
            input_gate: None,
        }
    }

    pub fn with_input_gate(mut self, gate: Option<Arc<InputGate>>) -> Self {
        self.input_gate = gate;
        self
    }
}

struct Attempt {
    id: u64,
    started: Instant,
    /// Run suspension total when the attempt started
    suspended_at_start: Duration,
    cancel: AgentCancellation,
    exclusive: bool,
}

struct PlanState {
    plan: Plan,
    attempts: HashMap<String, Attempt>,
    retry_at: HashMap<String, Instant>,
    summaries: HashMap<String, String>,
}

struct PlanRuntime {
    state: Mutex<PlanState>,
    context: Mutex<Option<PlanContext>>,
    cancel: AgentCancellation,
    wake: Notify,
    driving: AtomicBool,
}

impl PlanRuntime {
    fn new(plan: Plan, context: Option<PlanContext>) -> Self {
        Self {
            state: Mutex::new(PlanState {
                plan,
                attempts: HashMap::new(),
                retry_at: HashMap::new(),
                summaries: HashMap::new(),
            }),
            context: Mutex::new(context),
            cancel: AgentCancellation::new(),
            wake: Notify::new(),
            driving: AtomicBool::new(false),
        }
    }

    fn suspended(&self) -> Duration {
        self.context
            .lock()
            .as_ref()
            .and_then(|c| c.input_gate.as_ref())
            .map(|g| g.suspended())
            .unwrap_or_default()
    }
}

/// Clears the driving flag however the scheduling loop exits
struct DrivingGuard<'a> {
    flag: &'a AtomicBool,
    held: bool,
}

impl DrivingGuard<'_> {
    /// Must be called with the plan state locked
    fn release(&mut self) {
        if self.held {
            self.flag.store(false, Ordering::Release);
            self.held = false;
        }
    }
}

impl Drop for DrivingGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

struct Launch {
    task_id: String,
    attempt_id: u64,
    assignment: TaskAssignment,
    cancel: AgentCancellation,
}

struct Completion {
    task_id: String,
    attempt_id: u64,
    result: Result<TaskOutput, AgentError>,
}

struct ExecutorInner {
    bus: EventBus,
    settings: ExecutorSettings,
    writer: Option<PlanWriter>,
    plans: DashMap<String, Arc<PlanRuntime>>,
    task_index: DashMap<String, String>,
    next_attempt: AtomicU64,
}

/// Schedules plan tasks onto task runners
#[derive(Clone)]
pub struct TaskExecutor {
    inner: Arc<ExecutorInner>,
}

impl TaskExecutor {
    pub fn new(bus: EventBus, settings: ExecutorSettings) -> Self {
        Self::build(bus, settings, None)
    }

    /// Executor that persists every transition through `writer`
    pub fn with_writer(bus: EventBus, settings: ExecutorSettings, writer: PlanWriter) -> Self {
        Self::build(bus, settings, Some(writer))
    }

    fn build(bus: EventBus, settings: ExecutorSettings, writer: Option<PlanWriter>) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                bus,
                settings,
                writer,
                plans: DashMap::new(),
                task_index: DashMap::new(),
                next_attempt: AtomicU64::new(1),
            }),
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.inner.settings
    }

    /// A new task using this executor's attempt ceiling
    pub fn task(
        &self,
        title: impl Into<String>,
        description: impl Into<String>,
        agent_type: AgentType,
    ) -> Task {
        Task::new(title, description, agent_type).with_max_retries(self.inner.settings.max_retries)
    }

    /// Register a new plan without driving it
    pub fn register(&self, plan: Plan, context: Option<PlanContext>) -> Result<(), ExecutorError> {
        plan.validate()?;
        if self.inner.plans.contains_key(&plan.id) {
            return Err(ExecutorError::InvalidPlan(format!(
                "plan {} is already registered",
                plan.id
            )));
        }

        self.index_tasks(&plan);
        self.emit(&plan, PlanEvent::created(&plan));
        self.persist(&plan);
        tracing::info!(
            plan_id = %plan.id,
            session_id = %plan.session_id,
            tasks = plan.tasks.len(),
            "Plan registered"
        );
        let plan_id = plan.id.clone();
        self.inner
            .plans
            .insert(plan_id, Arc::new(PlanRuntime::new(plan, context)));
        Ok(())
    }

    /// Adopt a plan loaded from storage.
    ///
    /// Attempts that were in flight when the previous process stopped are
    /// requeued; their recorded failures still count.
    pub fn adopt(&self, mut plan: Plan, context: Option<PlanContext>) -> Result<(), ExecutorError> {
        plan.validate()?;
        if self.inner.plans.contains_key(&plan.id) {
            return Ok(());
        }

        let mut requeued = Vec::new();
        for task in &mut plan.tasks {
            if matches!(task.status, TaskStatus::InProgress | TaskStatus::Retrying) {
                task.status = TaskStatus::Pending;
                requeued.push(task.id.clone());
            }
        }

        self.index_tasks(&plan);
        if !requeued.is_empty() {
            tracing::info!(
                plan_id = %plan.id,
                requeued = requeued.len(),
                "Requeued interrupted tasks"
            );
            self.persist(&plan);
        }
        let plan_id = plan.id.clone();
        self.inner
            .plans
            .insert(plan_id, Arc::new(PlanRuntime::new(plan, context)));
        Ok(())
    }

    fn index_tasks(&self, plan: &Plan) {
        for task in &plan.tasks {
            self.inner.task_index.insert(task.id.clone(), plan.id.clone());
        }
    }

    /// Set the runner used when the plan is next driven
    pub fn attach(&self, plan_id: &str, context: PlanContext) -> Result<(), ExecutorError> {
        let runtime = self.runtime(plan_id)?;
        *runtime.context.lock() = Some(context);
        Ok(())
    }

    /// Register a plan and drive it until it settles or is aborted
    pub async fn run(&self, plan: Plan, context: PlanContext) -> Result<Plan, ExecutorError> {
        let plan_id = plan.id.clone();
        self.register(plan, Some(context))?;
        self.drive(&plan_id).await
    }

    /// Drive an already registered plan again, typically after `retry` or `skip`
    pub async fn resume(&self, plan_id: &str) -> Result<Plan, ExecutorError> {
        self.drive(plan_id).await
    }

    /// Snapshot of a registered plan
    pub fn plan(&self, plan_id: &str) -> Option<Plan> {
        self.inner
            .plans
            .get(plan_id)
            .map(|r| r.state.lock().plan.clone())
    }

    pub fn plan_id_for_task(&self, task_id: &str) -> Option<String> {
        self.inner.task_index.get(task_id).map(|id| id.clone())
    }

    pub fn is_driving(&self, plan_id: &str) -> bool {
        self.inner
            .plans
            .get(plan_id)
            .map(|r| r.driving.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Cancel every in-flight attempt and settle every unfinished task.
    ///
    /// Running and mid-retry tasks become `aborted`, tasks that never
    /// started become `skipped`. No task is `in_progress` once this returns.
    pub fn abort(&self, plan_id: &str) -> Result<Plan, ExecutorError> {
        let runtime = self.runtime(plan_id)?;
        let snapshot = {
            let mut state = runtime.state.lock();
            if state.plan.status == PlanStatus::Aborted {
                return Ok(state.plan.clone());
            }

            for (_, attempt) in state.attempts.drain() {
                attempt.cancel.cancel();
            }
            state.retry_at.clear();

            let now = Utc::now();
            let plan_id = state.plan.id.clone();
            let mut events = Vec::new();
            for task in &mut state.plan.tasks {
                match task.status {
                    TaskStatus::InProgress | TaskStatus::Retrying => {
                        task.status = TaskStatus::Aborted;
                        task.completed_at = Some(now);
                        events.push(PlanEvent::TaskAborted {
                            plan_id: plan_id.clone(),
                            task_id: task.id.clone(),
                            status: TaskStatus::Aborted,
                            reason: "plan aborted".to_string(),
                        });
                    }
                    TaskStatus::Pending | TaskStatus::Blocked => {
                        task.status = TaskStatus::Skipped;
                        task.completed_at = Some(now);
                        events.push(PlanEvent::TaskSkipped {
                            plan_id: plan_id.clone(),
                            task_id: task.id.clone(),
                            reason: "plan aborted".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            for event in events {
                self.emit(&state.plan, event);
            }

            state.plan.status = PlanStatus::Aborted;
            state.plan.updated_at = now;
            self.emit(
                &state.plan,
                PlanEvent::PlanUpdated {
                    plan_id,
                    status: PlanStatus::Aborted,
                    reason: Some("aborted".to_string()),
                    unblocked: Vec::new(),
                },
            );
            self.persist(&state.plan);
            state.plan.clone()
        };

        runtime.cancel.cancel();
        runtime.wake.notify_one();
        tracing::info!(plan_id = %plan_id, "Plan aborted");
        Ok(snapshot)
    }

    /// Requeue a failed or timed-out task with a fresh attempt budget
    pub fn retry(&self, task_id: &str) -> Result<(), ExecutorError> {
        let runtime = self.runtime_for_task(task_id)?;
        {
            let mut state = runtime.state.lock();
            ensure_not_aborted(&state.plan, task_id, "retry")?;
            let task = state
                .plan
                .task_mut(task_id)
                .ok_or_else(|| ExecutorError::TaskNotFound(task_id.to_string()))?;
            if !task.status.is_retryable_failure() {
                return Err(ExecutorError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: task.status.to_string(),
                    action: "retry",
                });
            }
            task.status = TaskStatus::Pending;
            task.retry_count = 0;
            task.reset_outcome();

            let unblocked = unblock(&mut state.plan);
            self.refresh_status(
                &mut state.plan,
                Some(format!("task {} queued for retry", task_id)),
                unblocked,
                true,
            );
            self.persist(&state.plan);
            tracing::info!(plan_id = %state.plan.id, task_id = %task_id, "Task queued for retry");
        }
        runtime.wake.notify_one();
        Ok(())
    }

    /// Mark a task skipped and unblock what was waiting only on it.
    ///
    /// Returns the ids of tasks that went from blocked back to pending.
    pub fn skip(&self, task_id: &str) -> Result<Vec<String>, ExecutorError> {
        let runtime = self.runtime_for_task(task_id)?;
        let unblocked = {
            let mut state = runtime.state.lock();
            ensure_not_aborted(&state.plan, task_id, "skip")?;
            let task = state
                .plan
                .task_mut(task_id)
                .ok_or_else(|| ExecutorError::TaskNotFound(task_id.to_string()))?;
            if matches!(
                task.status,
                TaskStatus::InProgress | TaskStatus::Done | TaskStatus::Skipped | TaskStatus::Aborted
            ) {
                return Err(ExecutorError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: task.status.to_string(),
                    action: "skip",
                });
            }
            task.status = TaskStatus::Skipped;
            task.completed_at = Some(Utc::now());
            state.retry_at.remove(task_id);

            let plan_id = state.plan.id.clone();
            self.emit(
                &state.plan,
                PlanEvent::TaskSkipped {
                    plan_id,
                    task_id: task_id.to_string(),
                    reason: "skipped by user".to_string(),
                },
            );

            let unblocked = unblock(&mut state.plan);
            self.refresh_status(
                &mut state.plan,
                Some(format!("task {} skipped", task_id)),
                unblocked.clone(),
                !unblocked.is_empty(),
            );
            self.persist(&state.plan);
            tracing::info!(
                plan_id = %state.plan.id,
                task_id = %task_id,
                unblocked = unblocked.len(),
                "Task skipped"
            );
            unblocked
        };
        runtime.wake.notify_one();
        Ok(unblocked)
    }

    /// Tasks transitively blocked because of `task_id`
    pub fn blocked_downstream(&self, task_id: &str) -> Result<Vec<String>, ExecutorError> {
        let runtime = self.runtime_for_task(task_id)?;
        let state = runtime.state.lock();
        Ok(state.plan.blocked_downstream(task_id))
    }

    /// One timeout pass over every plan; returns the tasks that timed out
    pub fn sweep_timeouts(&self) -> Vec<String> {
        let runtimes: Vec<Arc<PlanRuntime>> =
            self.inner.plans.iter().map(|r| r.value().clone()).collect();
        let mut timed_out = Vec::new();
        for runtime in runtimes {
            let expired = self.sweep_plan(&runtime);
            if !expired.is_empty() {
                runtime.wake.notify_one();
                timed_out.extend(expired);
            }
        }
        timed_out
    }

    async fn drive(&self, plan_id: &str) -> Result<Plan, ExecutorError> {
        let runtime = self.runtime(plan_id)?;
        let context = runtime.context.lock().clone().ok_or_else(|| {
            ExecutorError::InvalidPlan(format!("plan {} has no task runner attached", plan_id))
        })?;
        if runtime
            .driving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ExecutorError::AlreadyRunning(plan_id.to_string()));
        }
        let mut driving = DrivingGuard {
            flag: &runtime.driving,
            held: true,
        };

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
        let mut sweep = tokio::time::interval(self.inner.settings.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        tracing::debug!(plan_id = %plan_id, "Driving plan");

        loop {
            let (launches, next_retry, finished) = {
                let mut state = runtime.state.lock();
                let launches = self.schedule(&runtime, &mut state, &context);
                let finished = state.plan.status == PlanStatus::Aborted
                    || (state.attempts.is_empty() && state.plan.is_settled());
                if finished {
                    driving.release();
                }
                (launches, state.retry_at.values().min().copied(), finished)
            };

            for launch in launches {
                let runner = context.runner.clone();
                let done_tx = done_tx.clone();
                tokio::spawn(async move {
                    let result = runner.run_task(launch.assignment, launch.cancel).await;
                    let _ = done_tx.send(Completion {
                        task_id: launch.task_id,
                        attempt_id: launch.attempt_id,
                        result,
                    });
                });
            }

            if finished {
                break;
            }

            tokio::select! {
                _ = runtime.cancel.cancelled() => break,
                Some(done) = done_rx.recv() => self.complete(&runtime, done),
                _ = runtime.wake.notified() => {}
                _ = sweep.tick() => {
                    self.sweep_plan(&runtime);
                }
                _ = sleep_until(next_retry) => {}
            }
        }

        let plan = runtime.state.lock().plan.clone();
        tracing::info!(plan_id = %plan_id, status = %plan.status, "Plan settled");
        Ok(plan)
    }

    /// Start every task that may start now
    fn schedule(
        &self,
        runtime: &PlanRuntime,
        state: &mut PlanState,
        context: &PlanContext,
    ) -> Vec<Launch> {
        let mut launches = Vec::new();
        if state.plan.status == PlanStatus::Aborted || runtime.cancel.is_cancelled() {
            return launches;
        }
        if state.attempts.values().any(|a| a.exclusive) {
            return launches;
        }

        let now = Instant::now();
        let max_workers = self.inner.settings.max_workers.max(1);
        let mut running = state.attempts.len();

        let ready: Vec<(String, bool)> = state
            .plan
            .tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Retrying))
            .filter(|t| state.retry_at.get(&t.id).map_or(true, |at| *at <= now))
            .filter(|t| state.plan.dependencies_satisfied(t))
            .map(|t| (t.id.clone(), t.can_parallel))
            .collect();

        for (task_id, can_parallel) in ready {
            if running >= max_workers {
                break;
            }
            if !can_parallel {
                // Sequential tasks run alone and in plan order
                if running == 0 {
                    launches.extend(self.launch(runtime, state, context, &task_id, true));
                }
                break;
            }
            launches.extend(self.launch(runtime, state, context, &task_id, false));
            running += 1;
        }
        launches
    }

    fn launch(
        &self,
        runtime: &PlanRuntime,
        state: &mut PlanState,
        context: &PlanContext,
        task_id: &str,
        exclusive: bool,
    ) -> Option<Launch> {
        let upstream = self.upstream(state, task_id);
        let task = state.plan.task_mut(task_id)?;
        let first_attempt = task.status == TaskStatus::Pending && task.retry_count == 0;
        task.status = TaskStatus::InProgress;
        task.progress = 0;
        if task.started_at.is_none() {
            task.started_at = Some(Utc::now());
        }
        let snapshot = task.clone();

        let attempt_id = self.inner.next_attempt.fetch_add(1, Ordering::Relaxed);
        let cancel = runtime.cancel.child();
        state.retry_at.remove(task_id);
        state.attempts.insert(
            task_id.to_string(),
            Attempt {
                id: attempt_id,
                started: Instant::now(),
                suspended_at_start: runtime.suspended(),
                cancel: cancel.clone(),
                exclusive,
            },
        );

        let plan_id = state.plan.id.clone();

        if first_attempt {
            self.emit(
                &state.plan,
                PlanEvent::TaskStarted {
                    plan_id: plan_id.clone(),
                    task_id: task_id.to_string(),
                    title: snapshot.title.clone(),
                    agent_type: snapshot.agent_type,
                    attempt: snapshot.retry_count + 1,
                },
            );
        }
        tracing::info!(
            plan_id = %plan_id,
            task_id = %task_id,
            attempt = snapshot.retry_count + 1,
            "Task started"
        );
        self.refresh_status(&mut state.plan, None, Vec::new(), false);
        self.persist(&state.plan);

        Some(Launch {
            task_id: task_id.to_string(),
            attempt_id,
            assignment: TaskAssignment {
                session_id: state.plan.session_id.clone(),
                plan_id,
                goal: state.plan.goal.clone(),
                task: snapshot,
                upstream,
                input_gate: context.input_gate.clone(),
            },
            cancel,
        })
    }

    fn upstream(&self, state: &PlanState, task_id: &str) -> Vec<UpstreamResult> {
        let Some(task) = state.plan.task(task_id) else {
            return Vec::new();
        };
        task.depends_on
            .iter()
            .filter_map(|dep| {
                let summary = state.summaries.get(dep)?;
                let dep_task = state.plan.task(dep)?;
                Some(UpstreamResult {
                    task_id: dep.clone(),
                    title: dep_task.title.clone(),
                    summary: summary.clone(),
                })
            })
            .collect()
    }

    /// Apply a worker's report
    fn complete(&self, runtime: &PlanRuntime, done: Completion) {
        let mut state = runtime.state.lock();
        match state.attempts.get(&done.task_id) {
            Some(attempt) if attempt.id == done.attempt_id => {}
            _ => {
                tracing::debug!(
                    task_id = %done.task_id,
                    attempt_id = done.attempt_id,
                    "Discarding result of a superseded attempt"
                );
                return;
            }
        }
        state.attempts.remove(&done.task_id);

        let plan_id = state.plan.id.clone();
        let task_id = done.task_id;
        match done.result {
            Ok(output) => {
                let Some(task) = state.plan.task_mut(&task_id) else {
                    return;
                };
                task.status = TaskStatus::Done;
                task.progress = 100;
                task.completed_at = Some(Utc::now());
                task.error_message = None;
                task.token_usage.add(&output.usage);
                let event = PlanEvent::TaskDone {
                    plan_id: plan_id.clone(),
                    task_id: task_id.clone(),
                    summary: output.summary.clone(),
                    retry_count: task.retry_count,
                    usage: task.token_usage,
                };
                state.summaries.insert(task_id.clone(), output.summary);
                self.emit(&state.plan, event);
                tracing::info!(plan_id = %plan_id, task_id = %task_id, "Task done");
            }
            Err(error) => {
                let Some(task) = state.plan.task_mut(&task_id) else {
                    return;
                };
                task.retry_count += 1;
                task.error_message = Some(error.to_string());
                let (retry_count, max_retries) = (task.retry_count, task.max_retries);

                if error.is_retryable() && retry_count < max_retries {
                    task.status = TaskStatus::Retrying;
                    let delay = backoff_delay(
                        self.inner.settings.retry_base_delay(),
                        self.inner.settings.retry_max_delay(),
                        retry_count - 1,
                    );
                    state.retry_at.insert(task_id.clone(), Instant::now() + delay);
                    tracing::warn!(
                        plan_id = %plan_id,
                        task_id = %task_id,
                        attempt = retry_count,
                        max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Task failed, retrying"
                    );
                    self.emit(
                        &state.plan,
                        PlanEvent::TaskRetrying {
                            plan_id,
                            task_id,
                            attempt: retry_count,
                            max_retries,
                            delay_ms: delay.as_millis() as u64,
                            error: error.to_string(),
                        },
                    );
                } else {
                    task.status = TaskStatus::Failed;
                    task.completed_at = Some(Utc::now());
                    tracing::warn!(
                        plan_id = %plan_id,
                        task_id = %task_id,
                        retry_count,
                        error = %error,
                        "Task failed"
                    );
                    self.fail_terminally(&mut state.plan, &task_id, error.to_string());
                }
            }
        }

        self.refresh_status(&mut state.plan, None, Vec::new(), false);
        self.persist(&state.plan);
    }

    /// Emit `task_failed` for a task already in its terminal status, then block its dependents
    fn fail_terminally(&self, plan: &mut Plan, task_id: &str, error: String) {
        let newly_blocked = block_dependents(plan, task_id);
        let Some(task) = plan.task(task_id) else {
            return;
        };
        let event = PlanEvent::TaskFailed {
            plan_id: plan.id.clone(),
            task_id: task_id.to_string(),
            status: task.status,
            error,
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            blocked_downstream: plan.blocked_downstream(task_id),
        };
        self.emit(plan, event);
        for blocked in newly_blocked {
            self.emit(
                plan,
                PlanEvent::TaskBlocked {
                    plan_id: plan.id.clone(),
                    task_id: blocked,
                    blocked_by: task_id.to_string(),
                },
            );
        }
    }

    /// Time out attempts past the ceiling, not counting time the run spent waiting for the user
    fn sweep_plan(&self, runtime: &PlanRuntime) -> Vec<String> {
        let ceiling = self.inner.settings.task_timeout();
        let suspended_now = runtime.suspended();
        let mut state = runtime.state.lock();

        let expired: Vec<String> = state
            .attempts
            .iter()
            .filter(|(_, attempt)| {
                let suspended = suspended_now.saturating_sub(attempt.suspended_at_start);
                attempt.started.elapsed().saturating_sub(suspended) > ceiling
            })
            .map(|(task_id, _)| task_id.clone())
            .collect();

        for task_id in &expired {
            if let Some(attempt) = state.attempts.remove(task_id) {
                attempt.cancel.cancel();
            }
            let reason = format!("Task exceeded the {}s timeout", ceiling.as_secs());
            if let Some(task) = state.plan.task_mut(task_id) {
                task.status = TaskStatus::Timeout;
                task.completed_at = Some(Utc::now());
                task.error_message = Some(reason.clone());
            }
            tracing::warn!(
                plan_id = %state.plan.id,
                task_id = %task_id,
                timeout_secs = ceiling.as_secs(),
                "Task timed out"
            );
            self.fail_terminally(&mut state.plan, task_id, reason);
        }

        if !expired.is_empty() {
            self.refresh_status(&mut state.plan, None, Vec::new(), false);
            self.persist(&state.plan);
        }
        expired
    }

    /// Recompute the plan status, emitting `plan_updated` when it changed or `force` is set
    fn refresh_status(
        &self,
        plan: &mut Plan,
        reason: Option<String>,
        unblocked: Vec<String>,
        force: bool,
    ) {
        let status = plan.derive_status();
        if status == plan.status && !force {
            return;
        }
        plan.status = status;
        plan.updated_at = Utc::now();
        self.emit(
            plan,
            PlanEvent::PlanUpdated {
                plan_id: plan.id.clone(),
                status,
                reason,
                unblocked,
            },
        );
    }

    fn emit(&self, plan: &Plan, event: PlanEvent) {
        self.inner.bus.emit(&plan.session_id, &event);
    }

    fn persist(&self, plan: &Plan) {
        if let Some(writer) = &self.inner.writer {
            writer.record(plan);
        }
    }

    /// Wait until every queued plan snapshot is written
    pub async fn flush(&self) {
        if let Some(writer) = &self.inner.writer {
            writer.flush().await;
        }
    }

    fn runtime(&self, plan_id: &str) -> Result<Arc<PlanRuntime>, ExecutorError> {
        self.inner
            .plans
            .get(plan_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| ExecutorError::PlanNotFound(plan_id.to_string()))
    }

    fn runtime_for_task(&self, task_id: &str) -> Result<Arc<PlanRuntime>, ExecutorError> {
        let plan_id = self
            .plan_id_for_task(task_id)
            .ok_or_else(|| ExecutorError::TaskNotFound(task_id.to_string()))?;
        self.runtime(&plan_id)
    }
}

fn ensure_not_aborted(plan: &Plan, task_id: &str, action: &'static str) -> Result<(), ExecutorError> {
    if plan.status == PlanStatus::Aborted {
        return Err(ExecutorError::InvalidTransition {
            task_id: task_id.to_string(),
            from: "in an aborted plan".to_string(),
            action,
        });
    }
    Ok(())
}

/// Block every unfinished transitive dependent; returns the newly blocked ids
fn block_dependents(plan: &mut Plan, task_id: &str) -> Vec<String> {
    let mut newly_blocked = Vec::new();
    for id in plan.transitive_dependents(task_id) {
        if let Some(task) = plan.task_mut(&id) {
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::Blocked;
                newly_blocked.push(id);
            }
        }
    }
    newly_blocked
}

/// Return blocked tasks to pending once no dependency holds them back.
///
/// Runs to a fixpoint so chains of blocked tasks clear together.
fn unblock(plan: &mut Plan) -> Vec<String> {
    let mut unblocked = Vec::new();
    loop {
        let ready: Vec<String> = plan
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Blocked && !plan.has_blocking_dependency(t))
            .map(|t| t.id.clone())
            .collect();
        if ready.is_empty() {
            return unblocked;
        }
        for id in ready {
            if let Some(task) = plan.task_mut(&id) {
                task.status = TaskStatus::Pending;
            }
            unblocked.push(id);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::storage::EventStore;
    use crate::testing::{ScriptedRunner, Step};
    use tempfile::TempDir;

    fn settings() -> ExecutorSettings {
        ExecutorSettings {
            max_workers: 4,
            max_retries: 3,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
            task_timeout_secs: 900,
            sweep_interval_ms: 20,
        }
    }

    fn task(id: &str) -> Task {
        Task::new(id, format!("work on {id}"), AgentType::Generation).with_id(id)
    }

    fn transient() -> AgentError {
        ProviderError::transient("503 from provider").into()
    }

    fn status(plan: &Plan, id: &str) -> TaskStatus {
        plan.task(id).unwrap().status
    }

    #[tokio::test]
    async fn retried_dependency_then_dependent_event_sequence() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(EventStore::open(&dir.path().join("events.db")).unwrap());
        let bus = EventBus::with_store(256, store.clone(), 5);
        let executor = TaskExecutor::new(bus.clone(), settings());

        let runner = Arc::new(
            ScriptedRunner::new()
                .script("A", vec![Step::fail(transient()), Step::fail(transient()), Step::ok("A done")])
                .script("B", vec![Step::ok("B done")]),
        );
        let plan = Plan::new("s1", "goal", vec![task("A"), task("B").depends_on(["A"])]).with_id("p1");

        let plan = executor.run(plan, PlanContext::new(runner.clone())).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Done);
        assert_eq!(status(&plan, "A"), TaskStatus::Done);
        assert_eq!(plan.task("A").unwrap().retry_count, 2);
        assert_eq!(status(&plan, "B"), TaskStatus::Done);
        assert_eq!(runner.attempts("A"), 3);

        // B saw A's result
        let b_upstream = runner.last_assignment("B").unwrap().upstream;
        assert_eq!(b_upstream[0].summary, "A done");

        bus.flush().await;
        let events = store.get_events("s1", None).await.unwrap();
        let tasks: Vec<(String, String, Option<u64>)> = events
            .iter()
            .filter(|e| e.event_type.starts_with("task_"))
            .map(|e| {
                (
                    e.event_type.clone(),
                    e.payload["task_id"].as_str().unwrap().to_string(),
                    e.payload["attempt"].as_u64().filter(|_| e.event_type == "task_retrying"),
                )
            })
            .collect();
        let expected = vec![
            ("task_started".to_string(), "A".to_string(), None),
            ("task_retrying".to_string(), "A".to_string(), Some(1)),
            ("task_retrying".to_string(), "A".to_string(), Some(2)),
            ("task_done".to_string(), "A".to_string(), None),
            ("task_started".to_string(), "B".to_string(), None),
            ("task_done".to_string(), "B".to_string(), None),
        ];
        assert_eq!(tasks, expected);
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn exhausting_retries_fails_and_blocks_dependents() {
        let bus = EventBus::new(256);
        let mut sub = bus.subscribe();
        let executor = TaskExecutor::new(bus.clone(), settings());
        let runner = Arc::new(ScriptedRunner::new().script(
            "A",
            vec![Step::fail(transient()), Step::fail(transient()), Step::fail(transient())],
        ));
        let plan = Plan::new(
            "s1",
            "goal",
            vec![task("A"), task("B").depends_on(["A"]), task("C").depends_on(["B"])],
        );

        let plan = executor.run(plan, PlanContext::new(runner.clone())).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Failed);
        let a = plan.task("A").unwrap();
        assert_eq!(a.status, TaskStatus::Failed);
        assert_eq!(a.retry_count, 3);
        assert_eq!(a.retry_count, a.max_retries);
        assert!(a.error_message.as_deref().unwrap().contains("503"));
        assert_eq!(runner.attempts("A"), 3);
        assert_eq!(runner.attempts("B"), 0);
        assert_eq!(status(&plan, "B"), TaskStatus::Blocked);
        assert_eq!(status(&plan, "C"), TaskStatus::Blocked);
        assert_eq!(executor.blocked_downstream("A").unwrap(), vec!["B", "C"]);

        let mut retrying = 0;
        let mut failed = None;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), sub.recv()).await
        {
            match event.event_type.as_str() {
                "task_retrying" => retrying += 1,
                "task_failed" => failed = Some(event.payload),
                _ => {}
            }
        }
        assert_eq!(retrying, 2);
        let failed = failed.unwrap();
        assert_eq!(failed["status"], "failed");
        assert_eq!(failed["retry_count"], 3);
        assert_eq!(failed["blocked_downstream"], serde_json::json!(["B", "C"]));
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let executor = TaskExecutor::new(EventBus::new(64), settings());
        let runner = Arc::new(ScriptedRunner::new().script(
            "A",
            vec![Step::fail(AgentError::ContextOverflow {
                required: 10,
                budget: 5,
            })],
        ));
        let plan = Plan::new("s1", "goal", vec![task("A")]);
        let plan = executor.run(plan, PlanContext::new(runner.clone())).await.unwrap();
        assert_eq!(status(&plan, "A"), TaskStatus::Failed);
        assert_eq!(plan.task("A").unwrap().retry_count, 1);
        assert_eq!(runner.attempts("A"), 1);
    }

    #[tokio::test]
    async fn parallel_tasks_overlap_and_sequential_tasks_run_alone() {
        let executor = TaskExecutor::new(EventBus::new(256), settings());
        let delay = Duration::from_millis(40);
        let runner = Arc::new(
            ScriptedRunner::new()
                .script("p1", vec![Step::ok("1").after(delay)])
                .script("p2", vec![Step::ok("2").after(delay)])
                .script("p3", vec![Step::ok("3").after(delay)])
                .script("s", vec![Step::ok("s").after(delay)]),
        );
        let plan = Plan::new(
            "s1",
            "goal",
            vec![
                task("p1").parallel(),
                task("p2").parallel(),
                task("p3").parallel(),
                task("s").depends_on(["p1"]),
            ],
        );

        let plan = executor.run(plan, PlanContext::new(runner.clone())).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Done);
        assert!(runner.peak_concurrency() >= 3);
        assert!(runner.max_overlap_with("s") == 0);
    }

    #[tokio::test]
    async fn worker_pool_bounds_concurrency() {
        let executor = TaskExecutor::new(
            EventBus::new(256),
            ExecutorSettings {
                max_workers: 2,
                ..settings()
            },
        );
        let mut runner = ScriptedRunner::new();
        let mut tasks = Vec::new();
        for i in 0..5 {
            let id = format!("t{i}");
            runner = runner.script(&id, vec![Step::ok("ok").after(Duration::from_millis(20))]);
            tasks.push(task(&id).parallel());
        }
        let runner = Arc::new(runner);

        let plan = executor
            .run(Plan::new("s1", "goal", tasks), PlanContext::new(runner.clone()))
            .await
            .unwrap();
        assert_eq!(plan.status, PlanStatus::Done);
        assert_eq!(runner.peak_concurrency(), 2);
    }

    #[tokio::test]
    async fn abort_leaves_nothing_in_progress() {
        let executor = TaskExecutor::new(EventBus::new(256), settings());
        let runner = Arc::new(
            ScriptedRunner::new()
                .script("A", vec![Step::hang()])
                .script("B", vec![Step::hang()])
                .script("R", vec![Step::fail(transient()), Step::hang()]),
        );
        let plan = Plan::new(
            "s1",
            "goal",
            vec![
                task("A").parallel(),
                task("B").parallel(),
                task("C").depends_on(["A"]),
                task("R").parallel().with_max_retries(3),
            ],
        )
        .with_id("p1");

        let driver = {
            let executor = executor.clone();
            let runner = runner.clone();
            tokio::spawn(async move { executor.run(plan, PlanContext::new(runner)).await })
        };
        runner.wait_started(&["A", "B"]).await;

        let aborted = executor.abort("p1").unwrap();
        assert!(aborted
            .tasks
            .iter()
            .all(|t| t.status != TaskStatus::InProgress));
        assert_eq!(status(&aborted, "A"), TaskStatus::Aborted);
        assert_eq!(status(&aborted, "B"), TaskStatus::Aborted);
        assert_eq!(status(&aborted, "C"), TaskStatus::Skipped);
        assert!(aborted.task("A").unwrap().completed_at.is_some());
        assert_eq!(aborted.status, PlanStatus::Aborted);

        let settled = driver.await.unwrap().unwrap();
        assert_eq!(settled.status, PlanStatus::Aborted);
        assert!(settled.tasks.iter().all(|t| t.status != TaskStatus::InProgress));
        assert!(runner.all_cancelled(&["A", "B"]));

        // Manual recovery is meaningless after a deliberate abort
        assert!(matches!(
            executor.retry("A"),
            Err(ExecutorError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn timeout_transitions_exactly_once() {
        let bus = EventBus::new(256);
        let mut sub = bus.subscribe();
        let executor = TaskExecutor::new(
            bus.clone(),
            ExecutorSettings {
                task_timeout_secs: 0,
                sweep_interval_ms: 60_000,
                ..settings()
            },
        );
        // Ignores cancellation entirely
        let runner = Arc::new(ScriptedRunner::new().script("A", vec![Step::stuck()]));
        let plan = Plan::new(
            "s1",
            "goal",
            vec![task("A"), task("B").depends_on(["A"])],
        )
        .with_id("p1");
        executor.register(plan, Some(PlanContext::new(runner.clone()))).unwrap();

        let driver = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.resume("p1").await })
        };
        runner.wait_started(&["A"]).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(executor.sweep_timeouts(), vec!["A".to_string()]);
        assert!(executor.sweep_timeouts().is_empty());

        let plan = driver.await.unwrap().unwrap();
        let a = plan.task("A").unwrap();
        assert_eq!(a.status, TaskStatus::Timeout);
        assert!(a.completed_at.is_some());
        assert!(a.error_message.as_deref().unwrap().contains("timeout"));
        assert_eq!(status(&plan, "B"), TaskStatus::Blocked);
        assert_eq!(plan.status, PlanStatus::Failed);
        assert!(runner.all_cancelled(&["A"]));

        let mut timeouts = 0;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), sub.recv()).await
        {
            if event.event_type == "task_failed" {
                assert_eq!(event.payload["status"], "timeout");
                timeouts += 1;
            }
        }
        assert_eq!(timeouts, 1);
        assert!(executor.sweep_timeouts().is_empty());
    }

    #[tokio::test]
    async fn skip_unblocks_only_tasks_waiting_solely_on_it() {
        let executor = TaskExecutor::new(EventBus::new(256), settings());
        let runner = Arc::new(
            ScriptedRunner::new()
                .script("A", vec![Step::fail(AgentError::Cancelled)])
                .script("X", vec![Step::fail(AgentError::Cancelled)])
                .script("B", vec![Step::ok("b")])
                .script("C", vec![Step::ok("c")])
                .script("D", vec![Step::ok("d")]),
        );
        let plan = Plan::new(
            "s1",
            "goal",
            vec![
                task("A").parallel(),
                task("X").parallel(),
                task("B").depends_on(["A"]),
                task("C").depends_on(["B"]),
                task("D").depends_on(["A", "X"]),
            ],
        )
        .with_id("p1");

        let plan = executor.run(plan, PlanContext::new(runner.clone())).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Failed);
        for id in ["B", "C", "D"] {
            assert_eq!(status(&plan, id), TaskStatus::Blocked);
        }

        let mut unblocked = executor.skip("A").unwrap();
        unblocked.sort();
        assert_eq!(unblocked, vec!["B", "C"]);
        let snapshot = executor.plan("p1").unwrap();
        assert_eq!(status(&snapshot, "A"), TaskStatus::Skipped);
        assert_eq!(status(&snapshot, "D"), TaskStatus::Blocked);

        let plan = executor.resume("p1").await.unwrap();
        assert_eq!(status(&plan, "B"), TaskStatus::Done);
        assert_eq!(status(&plan, "C"), TaskStatus::Done);
        assert_eq!(status(&plan, "D"), TaskStatus::Blocked);
        assert_eq!(plan.status, PlanStatus::Failed);

        assert!(matches!(
            executor.skip("B"),
            Err(ExecutorError::InvalidTransition { action: "skip", .. })
        ));
    }

    #[tokio::test]
    async fn manual_retry_resets_bookkeeping() {
        let executor = TaskExecutor::new(EventBus::new(256), settings());
        let runner = Arc::new(
            ScriptedRunner::new()
                .script(
                    "A",
                    vec![
                        Step::fail(AgentError::Cancelled),
                        Step::fail(transient()),
                        Step::ok("second time lucky"),
                    ],
                )
                .script("B", vec![Step::ok("b")]),
        );
        let plan = Plan::new("s1", "goal", vec![task("A"), task("B").depends_on(["A"])]).with_id("p1");

        let plan = executor.run(plan, PlanContext::new(runner.clone())).await.unwrap();
        assert_eq!(status(&plan, "A"), TaskStatus::Failed);
        assert_eq!(plan.task("A").unwrap().retry_count, 1);

        assert!(matches!(
            executor.retry("B"),
            Err(ExecutorError::InvalidTransition { action: "retry", .. })
        ));
        executor.retry("A").unwrap();
        let snapshot = executor.plan("p1").unwrap();
        assert_eq!(status(&snapshot, "A"), TaskStatus::Pending);
        assert_eq!(snapshot.task("A").unwrap().retry_count, 0);
        assert_eq!(status(&snapshot, "B"), TaskStatus::Pending);

        let plan = executor.resume("p1").await.unwrap();
        assert_eq!(plan.status, PlanStatus::Done);
        assert_eq!(plan.task("A").unwrap().retry_count, 1);
        assert_eq!(runner.attempts("A"), 3);
    }

    #[tokio::test]
    async fn invalid_plans_and_unknown_ids_are_rejected() {
        let executor = TaskExecutor::new(EventBus::new(16), settings());
        let runner = Arc::new(ScriptedRunner::new());
        let cyclic = Plan::new(
            "s1",
            "goal",
            vec![task("A").depends_on(["B"]), task("B").depends_on(["A"])],
        );
        assert!(matches!(
            executor.run(cyclic, PlanContext::new(runner)).await,
            Err(ExecutorError::InvalidPlan(_))
        ));
        assert!(matches!(executor.abort("nope"), Err(ExecutorError::PlanNotFound(_))));
        assert!(matches!(executor.skip("nope"), Err(ExecutorError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn transitions_are_persisted() {
        let dir = TempDir::new().unwrap();
        let manager = crate::plan::PlanManager::new(dir.path().join("plans.db"));
        let executor = TaskExecutor::with_writer(EventBus::new(64), settings(), manager.spawn_writer());
        let runner = Arc::new(ScriptedRunner::new().script("A", vec![Step::ok("done")]));
        let plan = Plan::new("s1", "goal", vec![task("A")]).with_id("p1");

        executor.run(plan, PlanContext::new(runner)).await.unwrap();
        executor.flush().await;

        let saved = manager.get_plan("p1").unwrap().unwrap();
        assert_eq!(saved.status, PlanStatus::Done);
        assert_eq!(saved.tasks[0].status, TaskStatus::Done);
    }
}
