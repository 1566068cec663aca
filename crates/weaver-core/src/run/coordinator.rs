//! Run coordinator
//!
//! Owns every run's state machine and drives its plans through the task
//! executor, one plan after another. A run's status lives in a watch
//! channel: the input gate flips it between `running` and `waiting_input`,
//! the coordinator settles it, and a background task persists each change.
//!
//! After a restart, `restore` rebuilds runs from the `run_*` events in the
//! session log and `resume` picks their plans up where they stopped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::events::RunEvent;
use super::input::{InputGate, PendingQuestion};
use super::RunStatus;
use crate::error::{ExecutorError, RunError};
use crate::events::{EventBus, SessionEvent};
use crate::plan::{Plan, PlanContext, PlanManager, PlanStatus, TaskExecutor, TaskRunner};
use crate::storage::{Database, EventStore, RunRecord, RunStore};

const RUN_EVENT_TYPES: &[&str] = &[
    "run_created",
    "run_started",
    "run_waiting_input",
    "run_resumed",
    "run_completed",
    "run_failed",
    "run_cancelled",
];

#[derive(Clone)]
struct Persistence {
    events: Arc<EventStore>,
    plans: PlanManager,
}

#[derive(Default)]
struct RunDetails {
    plan_ids: Vec<String>,
    error: Option<String>,
}

struct RunHandle {
    id: String,
    session_id: String,
    created_at: DateTime<Utc>,
    status: Arc<watch::Sender<RunStatus>>,
    gate: Arc<InputGate>,
    details: Mutex<RunDetails>,
    /// Last status written to the runs table
    saved: watch::Sender<Option<RunStatus>>,
}

impl RunHandle {
    fn new(
        id: String,
        session_id: String,
        created_at: DateTime<Utc>,
        status: RunStatus,
        bus: EventBus,
    ) -> Self {
        let status = Arc::new(watch::Sender::new(status));
        let gate = Arc::new(InputGate::new(
            id.clone(),
            session_id.clone(),
            bus,
            status.clone(),
        ));
        Self {
            id,
            session_id,
            created_at,
            status,
            gate,
            details: Mutex::new(RunDetails::default()),
            saved: watch::Sender::new(None),
        }
    }

    fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    fn plan_ids(&self) -> Vec<String> {
        self.details.lock().plan_ids.clone()
    }

    fn record(&self, status: RunStatus) -> RunRecord {
        let details = self.details.lock();
        RunRecord {
            id: self.id.clone(),
            session_id: self.session_id.clone(),
            status,
            plan_ids: details.plan_ids.clone(),
            error: details.error.clone(),
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }
}

struct CoordinatorInner {
    bus: EventBus,
    executor: TaskExecutor,
    runner: Arc<dyn TaskRunner>,
    persistence: Option<Persistence>,
    runs: DashMap<String, Arc<RunHandle>>,
}

/// Creates, drives, and settles runs
#[derive(Clone)]
pub struct RunCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RunCoordinator {
    /// In-memory coordinator; runs are lost with the process
    pub fn new(bus: EventBus, executor: TaskExecutor, runner: Arc<dyn TaskRunner>) -> Self {
        Self::build(bus, executor, runner, None)
    }

    /// Coordinator that persists runs and can restore them from the event log.
    ///
    /// Run records share the plan database.
    pub fn persistent(
        bus: EventBus,
        executor: TaskExecutor,
        runner: Arc<dyn TaskRunner>,
        events: Arc<EventStore>,
        plans: PlanManager,
    ) -> Self {
        Self::build(bus, executor, runner, Some(Persistence { events, plans }))
    }

    fn build(
        bus: EventBus,
        executor: TaskExecutor,
        runner: Arc<dyn TaskRunner>,
        persistence: Option<Persistence>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                bus,
                executor,
                runner,
                persistence,
                runs: DashMap::new(),
            }),
        }
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.inner.executor
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Create a queued run for a session
    pub fn create(&self, session_id: &str) -> String {
        let run_id = uuid::Uuid::new_v4().to_string();
        let handle = Arc::new(RunHandle::new(
            run_id.clone(),
            session_id.to_string(),
            Utc::now(),
            RunStatus::Queued,
            self.inner.bus.clone(),
        ));
        self.inner.runs.insert(run_id.clone(), handle.clone());
        self.spawn_persister(handle);

        self.inner.bus.emit(
            session_id,
            &RunEvent::RunCreated {
                run_id: run_id.clone(),
            },
        );
        tracing::info!(run_id = %run_id, session_id = %session_id, "Run created");
        run_id
    }

    /// Register the run's plans and start driving them in order
    pub fn start(&self, run_id: &str, plans: Vec<Plan>) -> Result<Vec<String>, RunError> {
        let handle = self.handle(run_id)?;
        let status = handle.status();
        if status != RunStatus::Queued {
            return Err(invalid_state(&handle, status, "start"));
        }
        if plans.is_empty() {
            return Err(RunError::Executor(ExecutorError::InvalidPlan(
                "a run needs at least one plan".to_string(),
            )));
        }
        for plan in &plans {
            plan.validate()?;
        }

        let context =
            PlanContext::new(self.inner.runner.clone()).with_input_gate(Some(handle.gate.clone()));
        let mut plan_ids = Vec::with_capacity(plans.len());
        for mut plan in plans {
            plan.run_id = Some(run_id.to_string());
            plan.session_id = handle.session_id.clone();
            plan_ids.push(plan.id.clone());
            self.inner.executor.register(plan, Some(context.clone()))?;
        }
        handle.details.lock().plan_ids = plan_ids.clone();

        handle.status.send_replace(RunStatus::Running);
        self.inner.bus.emit(
            &handle.session_id,
            &RunEvent::RunStarted {
                run_id: run_id.to_string(),
                plan_ids: plan_ids.clone(),
            },
        );
        tracing::info!(run_id = %run_id, plans = plan_ids.len(), "Run started");

        tokio::spawn(drive_run(self.clone(), handle, plan_ids.clone()));
        Ok(plan_ids)
    }

    /// Answer a question the run is waiting on; returns the answered question id
    pub fn provide_input(
        &self,
        run_id: &str,
        answer: &str,
        question_id: Option<&str>,
    ) -> Result<String, RunError> {
        let handle = self.handle(run_id)?;
        let status = handle.status();
        if status.is_terminal() {
            return Err(invalid_state(&handle, status, "provide input to"));
        }
        handle.gate.provide_input(answer, question_id)
    }

    pub fn pending_questions(&self, run_id: &str) -> Result<Vec<PendingQuestion>, RunError> {
        Ok(self.handle(run_id)?.gate.pending())
    }

    /// Cancel the run and abort its plans
    pub fn cancel(&self, run_id: &str, reason: &str) -> Result<(), RunError> {
        let handle = self.handle(run_id)?;
        let won = self.finish(
            &handle,
            RunStatus::Cancelled,
            Some(reason.to_string()),
            RunEvent::RunCancelled {
                run_id: run_id.to_string(),
                reason: reason.to_string(),
            },
        );
        if !won {
            let status = handle.status();
            return Err(invalid_state(&handle, status, "cancel"));
        }
        Ok(())
    }

    pub fn status(&self, run_id: &str) -> Option<RunStatus> {
        self.inner.runs.get(run_id).map(|h| h.status())
    }

    pub fn record(&self, run_id: &str) -> Option<RunRecord> {
        self.inner.runs.get(run_id).map(|h| h.record(h.status()))
    }

    /// Watch a run's status
    pub fn subscribe(&self, run_id: &str) -> Result<watch::Receiver<RunStatus>, RunError> {
        Ok(self.handle(run_id)?.status.subscribe())
    }

    /// Wait for the run to settle (and, when persistent, for its record to be written)
    pub async fn wait(&self, run_id: &str) -> Result<RunStatus, RunError> {
        let handle = self.handle(run_id)?;
        let mut status_rx = handle.status.subscribe();
        let status = *status_rx
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| RunError::NotFound(run_id.to_string()))?;

        if self.inner.persistence.is_some() {
            let mut saved_rx = handle.saved.subscribe();
            let _ = saved_rx
                .wait_for(|s| s.map(|s| s.is_terminal()).unwrap_or(false))
                .await;
        }
        Ok(status)
    }

    /// Rebuild a session's runs from its `run_*` events.
    ///
    /// Runs already known to this coordinator are left as they are.
    pub async fn restore(&self, session_id: &str) -> Result<Vec<RunRecord>, RunError> {
        let persistence = self.persistence()?;
        let events = persistence
            .events
            .get_events_filtered(session_id, None, RUN_EVENT_TYPES)
            .await?;
        let records = fold_run_events(session_id, &events);

        for record in &records {
            if self.inner.runs.contains_key(&record.id) {
                continue;
            }
            let handle = Arc::new(RunHandle::new(
                record.id.clone(),
                record.session_id.clone(),
                record.created_at,
                record.status,
                self.inner.bus.clone(),
            ));
            {
                let mut details = handle.details.lock();
                details.plan_ids = record.plan_ids.clone();
                details.error = record.error.clone();
            }
            if record.status.is_terminal() {
                handle.gate.close();
                handle.saved.send_replace(Some(record.status));
            } else {
                self.spawn_persister(handle.clone());
            }
            self.inner.runs.insert(record.id.clone(), handle);
        }

        tracing::info!(session_id = %session_id, runs = records.len(), "Restored runs from event log");
        Ok(records)
    }

    /// Continue a restored run's plans
    pub async fn resume(&self, run_id: &str) -> Result<(), RunError> {
        let persistence = self.persistence()?;
        let handle = self.handle(run_id)?;
        let status = handle.status();
        if !matches!(status, RunStatus::Running | RunStatus::WaitingInput) {
            return Err(invalid_state(&handle, status, "resume"));
        }

        let plan_ids = handle.plan_ids();
        let manager = persistence.plans.clone();
        let lookup = run_id.to_string();
        let stored = tokio::task::spawn_blocking(move || manager.list_for_run(&lookup))
            .await
            .context("Plan lookup task panicked")??;
        let mut by_id: HashMap<String, Plan> =
            stored.into_iter().map(|p| (p.id.clone(), p)).collect();

        let context =
            PlanContext::new(self.inner.runner.clone()).with_input_gate(Some(handle.gate.clone()));
        for plan_id in &plan_ids {
            match by_id.remove(plan_id) {
                Some(plan) => self.inner.executor.adopt(plan, Some(context.clone()))?,
                None if self.inner.executor.plan(plan_id).is_some() => {
                    self.inner.executor.attach(plan_id, context.clone())?
                }
                None => {
                    return Err(RunError::Storage(anyhow!(
                        "plan {} of run {} is missing from storage",
                        plan_id,
                        run_id
                    )))
                }
            }
        }

        // Whoever asked before the restart is gone; its task will ask again
        if handle
            .status
            .send_if_modified(|s| std::mem::replace(s, RunStatus::Running) != RunStatus::Running)
        {
            self.inner.bus.emit(
                &handle.session_id,
                &RunEvent::RunResumed {
                    run_id: run_id.to_string(),
                    waited_ms: 0,
                },
            );
        }

        tracing::info!(run_id = %run_id, plans = plan_ids.len(), "Resuming run");
        tokio::spawn(drive_run(self.clone(), handle, plan_ids));
        Ok(())
    }

    /// Restore every session that has runs the runs table lists as unfinished.
    ///
    /// Returns those runs; nothing is resumed.
    pub async fn restore_unfinished(&self) -> Result<Vec<RunRecord>, RunError> {
        let persistence = self.persistence()?;
        let db_path = persistence.plans.db_path().to_path_buf();
        let unfinished = tokio::task::spawn_blocking(move || {
            let db = Database::new(&db_path)?;
            RunStore::new(&db).list_unfinished()
        })
        .await
        .context("Run lookup task panicked")??;

        let mut sessions: Vec<&str> = unfinished.iter().map(|r| r.session_id.as_str()).collect();
        sessions.sort_unstable();
        sessions.dedup();
        for session_id in sessions {
            self.restore(session_id).await?;
        }
        Ok(unfinished)
    }

    /// Restore and resume every unfinished run; returns the resumed run ids
    pub async fn resume_unfinished(&self) -> Result<Vec<String>, RunError> {
        let mut resumed = Vec::new();
        for record in self.restore_unfinished().await? {
            match self.resume(&record.id).await {
                Ok(()) => resumed.push(record.id),
                Err(e) => {
                    tracing::warn!(run_id = %record.id, error = %e, "Could not resume run")
                }
            }
        }
        Ok(resumed)
    }

    /// Runs of a session that have not settled
    pub fn active_runs(&self, session_id: &str) -> Vec<String> {
        self.inner
            .runs
            .iter()
            .filter(|h| h.session_id == session_id && !h.status().is_terminal())
            .map(|h| h.id.clone())
            .collect()
    }

    /// Move the run to a terminal status unless it already has one.
    ///
    /// The winner closes the input gate, aborts unfinished plans, and emits
    /// `event`; returns whether this call won.
    fn finish(
        &self,
        handle: &RunHandle,
        status: RunStatus,
        error: Option<String>,
        event: RunEvent,
    ) -> bool {
        let won = handle.status.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            if error.is_some() {
                handle.details.lock().error = error.clone();
            }
            *current = status;
            true
        });
        if !won {
            return false;
        }

        handle.gate.close();
        for plan_id in handle.plan_ids() {
            let settled = self
                .inner
                .executor
                .plan(&plan_id)
                .map(|p| p.status.is_terminal())
                .unwrap_or(true);
            if !settled {
                if let Err(e) = self.inner.executor.abort(&plan_id) {
                    tracing::warn!(run_id = %handle.id, plan_id = %plan_id, error = %e, "Failed to abort plan");
                }
            }
        }

        self.inner.bus.emit(&handle.session_id, &event);
        match status {
            RunStatus::Failed => tracing::warn!(
                run_id = %handle.id,
                error = error.as_deref().unwrap_or_default(),
                "Run failed"
            ),
            _ => tracing::info!(run_id = %handle.id, status = %status, "Run finished"),
        }
        true
    }

    fn spawn_persister(&self, handle: Arc<RunHandle>) {
        let Some(persistence) = &self.inner.persistence else {
            return;
        };
        let db_path = persistence.plans.db_path().to_path_buf();
        tokio::spawn(persist_run(handle, db_path));
    }

    fn handle(&self, run_id: &str) -> Result<Arc<RunHandle>, RunError> {
        self.inner
            .runs
            .get(run_id)
            .map(|h| h.value().clone())
            .ok_or_else(|| RunError::NotFound(run_id.to_string()))
    }

    fn persistence(&self) -> Result<&Persistence, RunError> {
        self.inner
            .persistence
            .as_ref()
            .ok_or_else(|| RunError::Storage(anyhow!("run coordinator has no storage")))
    }
}

fn invalid_state(handle: &RunHandle, status: RunStatus, action: &'static str) -> RunError {
    RunError::InvalidState {
        run_id: handle.id.clone(),
        status: status.to_string(),
        action,
    }
}

async fn drive_run(coordinator: RunCoordinator, handle: Arc<RunHandle>, plan_ids: Vec<String>) {
    let mut failure = None;
    for plan_id in &plan_ids {
        if handle.status().is_terminal() {
            return;
        }
        match coordinator.inner.executor.resume(plan_id).await {
            Ok(plan) if plan.status == PlanStatus::Done => {}
            Ok(plan) => {
                failure = Some(format!("plan {} ended {}", plan.id, plan.status));
                break;
            }
            Err(e) => {
                failure = Some(e.to_string());
                break;
            }
        }
    }

    let run_id = handle.id.clone();
    match failure {
        None => coordinator.finish(
            &handle,
            RunStatus::Completed,
            None,
            RunEvent::RunCompleted { run_id },
        ),
        Some(error) => coordinator.finish(
            &handle,
            RunStatus::Failed,
            Some(error.clone()),
            RunEvent::RunFailed { run_id, error },
        ),
    };
}

async fn persist_run(handle: Arc<RunHandle>, db_path: PathBuf) {
    let mut status_rx = handle.status.subscribe();
    loop {
        let status = *status_rx.borrow_and_update();
        let record = handle.record(status);
        let path = db_path.clone();
        let result = tokio::task::spawn_blocking(move || {
            let db = Database::new(&path)?;
            RunStore::new(&db).save_run(&record)
        })
        .await
        .context("Run save task panicked");
        if let Err(e) = result.and_then(|r| r) {
            tracing::error!(run_id = %handle.id, error = %e, "Failed to persist run");
        }
        handle.saved.send_replace(Some(status));

        if status.is_terminal() || status_rx.changed().await.is_err() {
            break;
        }
    }
}

/// Replay `run_*` events into run records, in order of creation
fn fold_run_events(session_id: &str, events: &[SessionEvent]) -> Vec<RunRecord> {
    let mut order: Vec<String> = Vec::new();
    let mut runs: HashMap<String, RunRecord> = HashMap::new();

    for event in events {
        let Some(run_id) = event.payload["run_id"].as_str() else {
            continue;
        };
        let record = runs.entry(run_id.to_string()).or_insert_with(|| {
            order.push(run_id.to_string());
            let mut record = RunRecord::new(run_id, session_id);
            record.created_at = event.created_at;
            record
        });
        // A late event never reopens a settled run
        if record.status.is_terminal() {
            continue;
        }
        match event.event_type.as_str() {
            "run_started" => {
                record.status = RunStatus::Running;
                record.plan_ids = event.payload["plan_ids"]
                    .as_array()
                    .map(|ids| {
                        ids.iter()
                            .filter_map(|id| id.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
            }
            "run_waiting_input" => record.status = RunStatus::WaitingInput,
            "run_resumed" => record.status = RunStatus::Running,
            "run_completed" => record.status = RunStatus::Completed,
            "run_failed" => {
                record.status = RunStatus::Failed;
                record.error = event.payload["error"].as_str().map(str::to_string);
            }
            "run_cancelled" => {
                record.status = RunStatus::Cancelled;
                record.error = event.payload["reason"].as_str().map(str::to_string);
            }
            _ => {}
        }
        record.updated_at = event.created_at;
    }

    order
        .into_iter()
        .filter_map(|id| runs.remove(&id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentLoop, AgentServices, AgentTaskRunner, AgentType};
    use crate::ai::retry::RetryConfig;
    use crate::config::{AgentSettings, ExecutorSettings};
    use crate::events::EventSource;
    use crate::plan::{Task, TaskStatus};
    use crate::testing::{ScriptedProvider, ScriptedRunner, ScriptedTurn, Step};
    use crate::tools::{AskUserTool, ToolRegistry};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn executor_settings() -> ExecutorSettings {
        ExecutorSettings {
            max_workers: 4,
            max_retries: 1,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 2,
            task_timeout_secs: 900,
            sweep_interval_ms: 20,
        }
    }

    struct Harness {
        _dir: TempDir,
        bus: EventBus,
        store: Arc<EventStore>,
        plans: PlanManager,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let db_path = dir.path().join("weaver.db");
            let store = Arc::new(EventStore::open(&db_path).unwrap());
            let bus = EventBus::with_store(512, store.clone(), 5);
            Self {
                bus,
                store,
                plans: PlanManager::new(db_path),
                _dir: dir,
            }
        }

        fn coordinator(&self, runner: Arc<dyn TaskRunner>) -> RunCoordinator {
            let executor = TaskExecutor::with_writer(
                self.bus.clone(),
                executor_settings(),
                self.plans.spawn_writer(),
            );
            RunCoordinator::persistent(
                self.bus.clone(),
                executor,
                runner,
                self.store.clone(),
                self.plans.clone(),
            )
        }

        async fn run_events(&self, session_id: &str) -> Vec<String> {
            self.bus.flush().await;
            self.store
                .get_events(session_id, None)
                .await
                .unwrap()
                .into_iter()
                .map(|e| e.event_type)
                .filter(|t| t.starts_with("run_") || t.starts_with("interview_"))
                .collect()
        }
    }

    fn task(id: &str) -> Task {
        Task::new(id, "", AgentType::Generation).with_id(id)
    }

    async fn wait_for_status(rx: &mut watch::Receiver<RunStatus>, status: RunStatus) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == status))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn completes_plans_in_order() {
        let harness = Harness::new();
        let runner = Arc::new(ScriptedRunner::new());
        let coordinator = harness.coordinator(runner.clone());

        let run_id = coordinator.create("s1");
        assert_eq!(coordinator.status(&run_id), Some(RunStatus::Queued));
        let plans = vec![
            Plan::new("s1", "first", vec![task("a")]).with_id("p1"),
            Plan::new("s1", "second", vec![task("b")]).with_id("p2"),
        ];
        assert_eq!(coordinator.start(&run_id, plans).unwrap(), vec!["p1", "p2"]);

        assert_eq!(coordinator.wait(&run_id).await.unwrap(), RunStatus::Completed);
        assert_eq!(runner.started_order(), vec!["a", "b"]);
        assert_eq!(
            coordinator.executor().plan("p2").unwrap().run_id.as_deref(),
            Some(run_id.as_str())
        );
        assert_eq!(
            harness.run_events("s1").await,
            vec!["run_created", "run_started", "run_completed"]
        );

        let saved = {
            let db = Database::new(harness.plans.db_path()).unwrap();
            RunStore::new(&db).get_run(&run_id).unwrap().unwrap()
        };
        assert_eq!(saved.status, RunStatus::Completed);
        assert_eq!(saved.plan_ids, vec!["p1", "p2"]);

        assert!(matches!(
            coordinator.start(&run_id, vec![Plan::new("s1", "again", vec![task("c")])]),
            Err(RunError::InvalidState { action: "start", .. })
        ));
    }

    #[tokio::test]
    async fn failed_plan_fails_run_and_skips_the_rest() {
        let harness = Harness::new();
        let runner = Arc::new(
            ScriptedRunner::new().script("a", vec![Step::fail(crate::AgentError::Cancelled)]),
        );
        let coordinator = harness.coordinator(runner.clone());

        let run_id = coordinator.create("s1");
        coordinator
            .start(
                &run_id,
                vec![
                    Plan::new("s1", "first", vec![task("a")]).with_id("p1"),
                    Plan::new("s1", "second", vec![task("b")]).with_id("p2"),
                ],
            )
            .unwrap();

        assert_eq!(coordinator.wait(&run_id).await.unwrap(), RunStatus::Failed);
        let record = coordinator.record(&run_id).unwrap();
        assert!(record.error.unwrap().contains("p1"));
        assert_eq!(runner.attempts("b"), 0);
        let second = coordinator.executor().plan("p2").unwrap();
        assert_eq!(second.status, PlanStatus::Aborted);
        assert_eq!(second.tasks[0].status, TaskStatus::Skipped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn waits_for_input_and_resumes() {
        let harness = Harness::new();
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedTurn::tool_call("c1", "ask_user", json!({"question": "Which tone?"})),
            ScriptedTurn::text("tone agreed: formal"),
        ]));
        let tools = Arc::new(ToolRegistry::new());
        tools.register(Arc::new(AskUserTool)).await;
        let agent = AgentLoop::new(
            AgentServices {
                provider,
                tools,
                bus: harness.bus.clone(),
            },
            AgentSettings::default(),
            RetryConfig::default(),
        );
        let coordinator = harness.coordinator(Arc::new(AgentTaskRunner::new(Arc::new(agent))));

        let run_id = coordinator.create("s1");
        let mut status = coordinator.subscribe(&run_id).unwrap();
        let plan = Plan::new(
            "s1",
            "write copy",
            vec![Task::new("Interview", "Clarify tone", AgentType::Interview).with_id("t1")],
        )
        .with_id("p1");
        coordinator.start(&run_id, vec![plan]).unwrap();

        wait_for_status(&mut status, RunStatus::WaitingInput).await;
        let pending = coordinator.pending_questions(&run_id).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].question, "Which tone?");
        assert_eq!(pending[0].task_id.as_deref(), Some("t1"));

        let answered = coordinator.provide_input(&run_id, "formal", None).unwrap();
        assert_eq!(answered, pending[0].question_id);
        assert!(matches!(
            coordinator.provide_input(&run_id, "again", None),
            Err(RunError::NoPendingInput(_))
        ));

        assert_eq!(coordinator.wait(&run_id).await.unwrap(), RunStatus::Completed);
        let plan = coordinator.executor().plan("p1").unwrap();
        assert_eq!(plan.tasks[0].status, TaskStatus::Done);
        assert_eq!(
            harness.run_events("s1").await,
            vec![
                "run_created",
                "run_started",
                "run_waiting_input",
                "interview_question",
                "interview_answer",
                "run_resumed",
                "run_completed",
            ]
        );
    }

    #[tokio::test]
    async fn cancel_cascades_to_plans() {
        let harness = Harness::new();
        let runner = Arc::new(
            ScriptedRunner::new()
                .script("a", vec![Step::hang()])
                .script("b", vec![Step::hang()]),
        );
        let coordinator = harness.coordinator(runner.clone());

        let run_id = coordinator.create("s1");
        let plan = Plan::new(
            "s1",
            "goal",
            vec![task("a").parallel(), task("b").parallel(), task("c").depends_on(["a"])],
        )
        .with_id("p1");
        coordinator.start(&run_id, vec![plan]).unwrap();
        runner.wait_started(&["a", "b"]).await;

        coordinator.cancel(&run_id, "user pressed stop").unwrap();
        assert_eq!(coordinator.status(&run_id), Some(RunStatus::Cancelled));
        assert_eq!(coordinator.wait(&run_id).await.unwrap(), RunStatus::Cancelled);

        let plan = coordinator.executor().plan("p1").unwrap();
        assert_eq!(plan.status, PlanStatus::Aborted);
        assert!(plan.tasks.iter().all(|t| t.status != TaskStatus::InProgress));
        assert!(runner.all_cancelled(&["a", "b"]));

        assert!(matches!(
            coordinator.cancel(&run_id, "again"),
            Err(RunError::InvalidState { action: "cancel", .. })
        ));
        assert!(matches!(
            coordinator.provide_input(&run_id, "late", None),
            Err(RunError::InvalidState { .. })
        ));

        let events = harness.run_events("s1").await;
        assert_eq!(events.last().map(String::as_str), Some("run_cancelled"));
        assert!(!events.iter().any(|t| t == "run_completed" || t == "run_failed"));
    }

    #[tokio::test]
    async fn restores_from_events_and_resumes_after_restart() {
        let harness = Harness::new();
        let stalled = Arc::new(ScriptedRunner::new().script("a", vec![Step::hang()]));
        let before = harness.coordinator(stalled.clone());

        let run_id = before.create("s1");
        let plan = Plan::new("s1", "goal", vec![task("a"), task("b").depends_on(["a"])]).with_id("p1");
        before.start(&run_id, vec![plan]).unwrap();
        stalled.wait_started(&["a"]).await;
        before.executor().flush().await;
        harness.bus.flush().await;

        // A second coordinator over the same storage stands in for a restarted process
        let runner = Arc::new(ScriptedRunner::new());
        let after = harness.coordinator(runner.clone());
        let restored = after.restore("s1").await.unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].id, run_id);
        assert_eq!(restored[0].status, RunStatus::Running);
        assert_eq!(restored[0].plan_ids, vec!["p1"]);

        after.resume(&run_id).await.unwrap();
        assert_eq!(after.wait(&run_id).await.unwrap(), RunStatus::Completed);
        assert_eq!(runner.started_order(), vec!["a", "b"]);

        // Terminal runs restore as settled and cannot be resumed
        let again = harness.coordinator(Arc::new(ScriptedRunner::new()));
        harness.bus.flush().await;
        let restored = again.restore("s1").await.unwrap();
        assert_eq!(restored[0].status, RunStatus::Completed);
        assert!(matches!(
            again.resume(&run_id).await,
            Err(RunError::InvalidState { action: "resume", .. })
        ));
    }

    #[test]
    fn folding_ignores_events_after_a_terminal_one() {
        let event = |seq: i64, event_type: &str, payload: serde_json::Value| SessionEvent {
            id: seq.to_string(),
            session_id: "s1".to_string(),
            seq,
            event_type: event_type.to_string(),
            payload,
            source: EventSource::Session,
            created_at: Utc::now(),
        };
        let events = vec![
            event(1, "run_created", json!({"run_id": "r1"})),
            event(2, "run_started", json!({"run_id": "r1", "plan_ids": ["p1"]})),
            event(3, "run_created", json!({"run_id": "r2"})),
            event(4, "run_cancelled", json!({"run_id": "r1", "reason": "stop"})),
            event(5, "run_resumed", json!({"run_id": "r1", "waited_ms": 3})),
        ];

        let records = fold_run_events("s1", &events);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, RunStatus::Cancelled);
        assert_eq!(records[0].error.as_deref(), Some("stop"));
        assert_eq!(records[1].status, RunStatus::Queued);
    }
}
