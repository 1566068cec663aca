//! Run records

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::database::Database;
use crate::run::RunStatus;

/// Persisted view of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub session_id: String,
    pub status: RunStatus,
    pub plan_ids: Vec<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(id: impl Into<String>, session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            session_id: session_id.into(),
            status: RunStatus::Queued,
            plan_ids: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// SQLite-backed run storage
pub struct RunStore<'a> {
    db: &'a Database,
}

impl<'a> RunStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn save_run(&self, run: &RunRecord) -> Result<()> {
        self.db.conn().execute(
            "INSERT INTO runs (id, session_id, status, plan_ids, error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 plan_ids = excluded.plan_ids,
                 error = excluded.error,
                 updated_at = excluded.updated_at",
            params![
                run.id,
                run.session_id,
                run.status.as_str(),
                serde_json::to_string(&run.plan_ids)?,
                run.error,
                run.created_at.to_rfc3339(),
                run.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let row = self
            .db
            .conn()
            .query_row(
                "SELECT id, session_id, status, plan_ids, error, created_at, updated_at
                 FROM runs WHERE id = ?1",
                [run_id],
                RawRun::from_row,
            )
            .optional()?;
        row.map(RawRun::into_record).transpose()
    }

    /// Runs of a session, oldest first
    pub fn list_for_session(&self, session_id: &str) -> Result<Vec<RunRecord>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, status, plan_ids, error, created_at, updated_at
             FROM runs WHERE session_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([session_id], RawRun::from_row)?;
        rows.map(|row| row?.into_record()).collect()
    }

    /// Runs that had not reached a terminal status when last saved
    pub fn list_unfinished(&self) -> Result<Vec<RunRecord>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, status, plan_ids, error, created_at, updated_at
             FROM runs WHERE status IN ('queued', 'running', 'waiting_input')
             ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([], RawRun::from_row)?;
        rows.map(|row| row?.into_record()).collect()
    }
}

struct RawRun {
    id: String,
    session_id: String,
    status: String,
    plan_ids: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            status: row.get(2)?,
            plan_ids: row.get(3)?,
            error: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<RunRecord> {
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("Unknown run status '{}' for run {}", self.status, self.id))?;
        Ok(RunRecord {
            status,
            plan_ids: serde_json::from_str(&self.plan_ids)?,
            error: self.error,
            created_at: DateTime::parse_from_rfc3339(&self.created_at)?.with_timezone(&Utc),
            updated_at: DateTime::parse_from_rfc3339(&self.updated_at)?.with_timezone(&Utc),
            id: self.id,
            session_id: self.session_id,
        })
    }
}
