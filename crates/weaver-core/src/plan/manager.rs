//! Plan manager
//!
//! Plans persisted in SQLite:
//! - Synchronous lookups and saves through `PlanManager`
//! - A background `PlanWriter` the executor hands every transition to, so
//!   scheduling never waits on the database

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};

use super::types::Plan;
use crate::storage::{Database, PlanStore};

/// Manages plans with SQLite storage
#[derive(Debug, Clone)]
pub struct PlanManager {
    db_path: PathBuf,
}

impl PlanManager {
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    pub fn db_path(&self) -> &std::path::Path {
        &self.db_path
    }

    pub fn save_plan(&self, plan: &Plan) -> Result<()> {
        let db = Database::new(&self.db_path)?;
        PlanStore::new(&db).save_plan(plan)
    }

    pub fn get_plan(&self, plan_id: &str) -> Result<Option<Plan>> {
        let db = Database::new(&self.db_path)?;
        PlanStore::new(&db).get_plan(plan_id)
    }

    pub fn list_for_session(&self, session_id: &str) -> Result<Vec<Plan>> {
        let db = Database::new(&self.db_path)?;
        PlanStore::new(&db).list_for_session(session_id)
    }

    pub fn list_for_run(&self, run_id: &str) -> Result<Vec<Plan>> {
        let db = Database::new(&self.db_path)?;
        PlanStore::new(&db).list_for_run(run_id)
    }

    /// Load the plan that owns a task
    pub fn plan_for_task(&self, task_id: &str) -> Result<Option<Plan>> {
        let db = Database::new(&self.db_path)?;
        let store = PlanStore::new(&db);
        match store.plan_id_for_task(task_id)? {
            Some(plan_id) => store.get_plan(&plan_id),
            None => Ok(None),
        }
    }

    pub fn delete_plan(&self, plan_id: &str) -> Result<bool> {
        let db = Database::new(&self.db_path)?;
        PlanStore::new(&db).delete_plan(plan_id)
    }

    /// Start a background writer over this manager's database
    pub fn spawn_writer(&self) -> PlanWriter {
        PlanWriter::spawn(self.clone())
    }
}

enum WriterCommand {
    Save(Box<Plan>),
    Flush(oneshot::Sender<()>),
}

/// Ordered, non-blocking plan persistence
#[derive(Clone)]
pub struct PlanWriter {
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl PlanWriter {
    /// Must be called inside a tokio runtime
    pub fn spawn(manager: PlanManager) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(rx, manager));
        Self { tx }
    }

    /// Queue a snapshot of the plan for saving
    pub fn record(&self, plan: &Plan) {
        if self
            .tx
            .send(WriterCommand::Save(Box::new(plan.clone())))
            .is_err()
        {
            tracing::error!(plan_id = %plan.id, "Plan writer has stopped, plan not persisted");
        }
    }

    /// Wait until every snapshot queued so far is written
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriterCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_writer(mut rx: mpsc::UnboundedReceiver<WriterCommand>, manager: PlanManager) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Save(mut plan) => {
                // Only the newest queued snapshot of a plan matters
                let mut flushes = Vec::new();
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WriterCommand::Save(newer) if newer.id == plan.id => plan = newer,
                        WriterCommand::Save(other) => {
                            save(&manager, plan).await;
                            plan = other;
                        }
                        WriterCommand::Flush(done) => {
                            flushes.push(done);
                            break;
                        }
                    }
                }
                save(&manager, plan).await;
                for done in flushes {
                    let _ = done.send(());
                }
            }
            WriterCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    tracing::debug!("Plan writer stopped");
}

async fn save(manager: &PlanManager, plan: Box<Plan>) {
    let manager = manager.clone();
    let plan_id = plan.id.clone();
    let result = tokio::task::spawn_blocking(move || manager.save_plan(&plan))
        .await
        .context("Plan save task panicked");

    if let Err(e) = result.and_then(|r| r) {
        tracing::error!(plan_id = %plan_id, error = %e, "Failed to persist plan");
    }
}
