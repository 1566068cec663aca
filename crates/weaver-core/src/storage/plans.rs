//! Plan and task records
//!
//! A plan row plus one row per task, rewritten as a unit whenever the
//! executor changes anything. Task rows are deleted with their plan.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::database::Database;
use crate::agent::AgentType;
use crate::ai::types::Usage;
use crate::plan::{Plan, PlanStatus, Task, TaskStatus};

/// SQLite-backed plan storage
pub struct PlanStore<'a> {
    db: &'a Database,
}

impl<'a> PlanStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert or replace a plan together with all of its tasks
    pub fn save_plan(&self, plan: &Plan) -> Result<()> {
        let tx = self.db.conn().unchecked_transaction()?;

        tx.execute(
            "INSERT INTO plans (id, session_id, run_id, goal, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 run_id = excluded.run_id,
                 goal = excluded.goal,
                 status = excluded.status,
                 updated_at = excluded.updated_at",
            params![
                plan.id,
                plan.session_id,
                plan.run_id,
                plan.goal,
                plan.status.as_str(),
                plan.created_at.to_rfc3339(),
                plan.updated_at.to_rfc3339(),
            ],
        )?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO tasks (id, plan_id, position, title, description, agent_type, status,
                     progress, depends_on, can_parallel, required, retry_count, max_retries,
                     error_message, prompt_tokens, completion_tokens, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
                 ON CONFLICT(id) DO UPDATE SET
                     position = excluded.position,
                     title = excluded.title,
                     description = excluded.description,
                     status = excluded.status,
                     progress = excluded.progress,
                     depends_on = excluded.depends_on,
                     can_parallel = excluded.can_parallel,
                     required = excluded.required,
                     retry_count = excluded.retry_count,
                     max_retries = excluded.max_retries,
                     error_message = excluded.error_message,
                     prompt_tokens = excluded.prompt_tokens,
                     completion_tokens = excluded.completion_tokens,
                     started_at = excluded.started_at,
                     completed_at = excluded.completed_at",
            )?;

            for (position, task) in plan.tasks.iter().enumerate() {
                stmt.execute(params![
                    task.id,
                    plan.id,
                    position as i64,
                    task.title,
                    task.description,
                    task.agent_type.as_str(),
                    task.status.as_str(),
                    task.progress,
                    serde_json::to_string(&task.depends_on)?,
                    task.can_parallel,
                    task.required,
                    task.retry_count,
                    task.max_retries,
                    task.error_message,
                    task.token_usage.prompt_tokens as i64,
                    task.token_usage.completion_tokens as i64,
                    task.started_at.map(|t| t.to_rfc3339()),
                    task.completed_at.map(|t| t.to_rfc3339()),
                ])?;
            }
        }

        tx.commit()?;

        tracing::debug!(
            plan_id = %plan.id,
            status = %plan.status,
            tasks = plan.tasks.len(),
            "Saved plan"
        );
        Ok(())
    }

    pub fn get_plan(&self, plan_id: &str) -> Result<Option<Plan>> {
        let conn = self.db.conn();
        let plan = conn
            .query_row(
                "SELECT id, session_id, run_id, goal, status, created_at, updated_at
                 FROM plans WHERE id = ?1",
                [plan_id],
                plan_from_row,
            )
            .optional()?;

        match plan {
            Some(plan) => {
                let mut plan = plan?;
                plan.tasks = load_tasks(conn, &plan.id)?;
                Ok(Some(plan))
            }
            None => Ok(None),
        }
    }

    /// Plans of a session, oldest first
    pub fn list_for_session(&self, session_id: &str) -> Result<Vec<Plan>> {
        self.list_where("session_id = ?1", session_id)
    }

    /// Plans belonging to a run, oldest first
    pub fn list_for_run(&self, run_id: &str) -> Result<Vec<Plan>> {
        self.list_where("run_id = ?1", run_id)
    }

    /// Plan that owns a task
    pub fn plan_id_for_task(&self, task_id: &str) -> Result<Option<String>> {
        let plan_id = self
            .db
            .conn()
            .query_row("SELECT plan_id FROM tasks WHERE id = ?1", [task_id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(plan_id)
    }

    pub fn delete_plan(&self, plan_id: &str) -> Result<bool> {
        let rows = self
            .db
            .conn()
            .execute("DELETE FROM plans WHERE id = ?1", [plan_id])?;
        if rows > 0 {
            tracing::info!(plan_id = %plan_id, "Deleted plan");
        }
        Ok(rows > 0)
    }

    fn list_where(&self, condition: &str, value: &str) -> Result<Vec<Plan>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, session_id, run_id, goal, status, created_at, updated_at
             FROM plans WHERE {condition} ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map([value], plan_from_row)?;

        let mut plans = Vec::new();
        for row in rows {
            let mut plan = row??;
            plan.tasks = load_tasks(conn, &plan.id)?;
            plans.push(plan);
        }
        Ok(plans)
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn parse_optional_time(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_time).transpose()
}

/// Outer error is the row read, inner error is decoding the stored text
fn plan_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Plan>> {
    let id: String = row.get(0)?;
    let session_id: String = row.get(1)?;
    let run_id: Option<String> = row.get(2)?;
    let goal: String = row.get(3)?;
    let status: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;

    Ok((move || -> Result<Plan> {
        Ok(Plan {
            status: PlanStatus::parse(&status)
                .ok_or_else(|| anyhow!("Unknown plan status '{}' for plan {}", status, id))?,
            created_at: parse_time(&created_at)?,
            updated_at: parse_time(&updated_at)?,
            id,
            session_id,
            run_id,
            goal,
            tasks: Vec::new(),
        })
    })())
}

fn load_tasks(conn: &Connection, plan_id: &str) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, title, description, agent_type, status, progress, depends_on, can_parallel,
                required, retry_count, max_retries, error_message, prompt_tokens,
                completion_tokens, started_at, completed_at
         FROM tasks WHERE plan_id = ?1 ORDER BY position",
    )?;

    let rows = stmt.query_map([plan_id], |row| {
        Ok(TaskRow {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            agent_type: row.get(3)?,
            status: row.get(4)?,
            progress: row.get(5)?,
            depends_on: row.get(6)?,
            can_parallel: row.get(7)?,
            required: row.get(8)?,
            retry_count: row.get(9)?,
            max_retries: row.get(10)?,
            error_message: row.get(11)?,
            prompt_tokens: row.get(12)?,
            completion_tokens: row.get(13)?,
            started_at: row.get(14)?,
            completed_at: row.get(15)?,
        })
    })?;

    rows.map(|row| row?.into_task()).collect()
}

struct TaskRow {
    id: String,
    title: String,
    description: String,
    agent_type: String,
    status: String,
    progress: u8,
    depends_on: String,
    can_parallel: bool,
    required: bool,
    retry_count: u32,
    max_retries: u32,
    error_message: Option<String>,
    prompt_tokens: i64,
    completion_tokens: i64,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let agent_type = AgentType::parse(&self.agent_type)
            .ok_or_else(|| anyhow!("Unknown agent type '{}'", self.agent_type))?;
        let status = TaskStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("Unknown task status '{}'", self.status))?;

        Ok(Task {
            id: self.id,
            title: self.title,
            description: self.description,
            agent_type,
            status,
            progress: self.progress,
            depends_on: serde_json::from_str(&self.depends_on)?,
            can_parallel: self.can_parallel,
            required: self.required,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            error_message: self.error_message,
            token_usage: Usage::new(self.prompt_tokens as usize, self.completion_tokens as usize),
            started_at: parse_optional_time(self.started_at)?,
            completed_at: parse_optional_time(self.completed_at)?,
        })
    }
}
