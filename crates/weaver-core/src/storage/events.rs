//! Append-only session event log
//!
//! Sequence numbers are assigned here and nowhere else. Within a process the
//! per-session lock serializes writers; across processes the IMMEDIATE
//! transaction plus the UNIQUE(session_id, seq) constraint does, with a
//! bounded retry when a conflicting insert slips through.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection, ErrorCode, TransactionBehavior};
use serde_json::Value;

use super::database::Database;
use crate::constants::events::SEQ_CONFLICT_RETRIES;
use crate::events::{EventSource, SessionEvent};

/// Durable per-session event log
pub struct EventStore {
    db_path: PathBuf,
    session_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl EventStore {
    /// Open the store, creating and migrating the database if needed
    pub fn open(db_path: &Path) -> Result<Self> {
        Database::new(db_path)?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
            session_locks: DashMap::new(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Whether an event type is persisted at all
    pub fn should_store(event_type: &str) -> bool {
        crate::events::should_store(event_type)
    }

    /// Append an event and return its sequence number
    pub async fn store(
        &self,
        session_id: &str,
        event_type: &str,
        payload: &Value,
        source: EventSource,
    ) -> Result<i64> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let db_path = self.db_path.clone();
        let session_id = session_id.to_string();
        let event_type = event_type.to_string();
        let payload = serde_json::to_string(payload)?;

        tokio::task::spawn_blocking(move || {
            let mut db = Database::new(&db_path)?;
            insert_with_next_seq(db.conn_mut(), &session_id, &event_type, &payload, source)
        })
        .await
        .context("Event store task panicked")?
    }

    /// Events after `since_seq` (all events when `None`), in seq order
    pub async fn get_events(
        &self,
        session_id: &str,
        since_seq: Option<i64>,
    ) -> Result<Vec<SessionEvent>> {
        self.get_events_filtered(session_id, since_seq, &[]).await
    }

    /// Like `get_events`, restricted to the given types (no restriction when empty)
    pub async fn get_events_filtered(
        &self,
        session_id: &str,
        since_seq: Option<i64>,
        types: &[&str],
    ) -> Result<Vec<SessionEvent>> {
        let db_path = self.db_path.clone();
        let session_id = session_id.to_string();
        let types: Vec<String> = types.iter().map(|t| t.to_string()).collect();

        tokio::task::spawn_blocking(move || {
            let db = Database::new(&db_path)?;
            query_events(db.conn(), &session_id, since_seq.unwrap_or(0), &types)
        })
        .await
        .context("Event query task panicked")?
    }

    /// Highest assigned seq for a session, 0 when it has no events
    pub async fn latest_seq(&self, session_id: &str) -> Result<i64> {
        let db_path = self.db_path.clone();
        let session_id = session_id.to_string();

        tokio::task::spawn_blocking(move || {
            let db = Database::new(&db_path)?;
            let seq: i64 = db.conn().query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM session_events WHERE session_id = ?1",
                [&session_id],
                |row| row.get(0),
            )?;
            Ok(seq)
        })
        .await
        .context("Event query task panicked")?
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.session_locks
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }
}

fn insert_with_next_seq(
    conn: &mut Connection,
    session_id: &str,
    event_type: &str,
    payload: &str,
    source: EventSource,
) -> Result<i64> {
    let id = uuid::Uuid::new_v4().to_string();
    let created_at = Utc::now().to_rfc3339();

    for attempt in 1..=SEQ_CONFLICT_RETRIES {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM session_events WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;

        let inserted = tx.execute(
            "INSERT INTO session_events (id, session_id, seq, type, payload, source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                session_id,
                seq,
                event_type,
                payload,
                source.as_str(),
                created_at
            ],
        );

        match inserted {
            Ok(_) => {
                tx.commit()?;
                return Ok(seq);
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                tracing::warn!(
                    session_id = %session_id,
                    seq,
                    attempt,
                    "Sequence conflict, retrying"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    bail!(
        "Could not assign a sequence number for session {} after {} attempts",
        session_id,
        SEQ_CONFLICT_RETRIES
    )
}

/// Raw row before payload/timestamp parsing
struct EventRow {
    id: String,
    session_id: String,
    seq: i64,
    event_type: String,
    payload: String,
    source: String,
    created_at: String,
}

fn query_events(
    conn: &Connection,
    session_id: &str,
    since_seq: i64,
    types: &[String],
) -> Result<Vec<SessionEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, seq, type, payload, source, created_at
         FROM session_events
         WHERE session_id = ?1 AND seq > ?2
         ORDER BY seq ASC",
    )?;

    let rows = stmt
        .query_map(params![session_id, since_seq], |row| {
            Ok(EventRow {
                id: row.get(0)?,
                session_id: row.get(1)?,
                seq: row.get(2)?,
                event_type: row.get(3)?,
                payload: row.get(4)?,
                source: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .filter(|row| types.is_empty() || types.iter().any(|t| *t == row.event_type))
        .map(|row| {
            let payload = serde_json::from_str(&row.payload)
                .with_context(|| format!("Corrupt payload for event {}", row.id))?;
            let source = EventSource::parse(&row.source)
                .ok_or_else(|| anyhow!("Unknown event source '{}'", row.source))?;
            let created_at = DateTime::parse_from_rfc3339(&row.created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .with_context(|| format!("Bad timestamp for event {}", row.id))?;
            Ok(SessionEvent {
                id: row.id,
                session_id: row.session_id,
                seq: row.seq,
                event_type: row.event_type,
                payload,
                source,
                created_at,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_store() -> (tempfile::TempDir, Arc<EventStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(&dir.path().join("events.db")).unwrap();
        (dir, Arc::new(store))
    }

    #[tokio::test]
    async fn assigns_sequential_seq_per_session() {
        let (_dir, store) = temp_store();
        let payload = json!({"k": "v"});

        assert_eq!(store.store("a", "task_started", &payload, EventSource::Task).await.unwrap(), 1);
        assert_eq!(store.store("a", "task_done", &payload, EventSource::Task).await.unwrap(), 2);
        assert_eq!(store.store("b", "run_started", &payload, EventSource::Session).await.unwrap(), 1);
        assert_eq!(store.latest_seq("a").await.unwrap(), 2);
        assert_eq!(store.latest_seq("missing").await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_stores_never_duplicate_seq() {
        let (_dir, store) = temp_store();

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .store("s1", "tool_call", &json!({"i": i}), EventSource::Task)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=50).collect::<Vec<i64>>());

        let events = store.get_events("s1", None).await.unwrap();
        let stored: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(stored, (1..=50).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn catch_up_returns_only_newer_events() {
        let (_dir, store) = temp_store();
        for i in 0..20 {
            store
                .store("s1", "task_started", &json!({"i": i}), EventSource::Task)
                .await
                .unwrap();
        }

        let events = store.get_events("s1", Some(10)).await.unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (11..=20).collect::<Vec<i64>>());
        assert_eq!(events[0].payload["i"], 10);
        assert_eq!(events[0].source, EventSource::Task);
    }

    #[tokio::test]
    async fn filters_by_type() {
        let (_dir, store) = temp_store();
        store.store("s1", "run_started", &json!({}), EventSource::Session).await.unwrap();
        store.store("s1", "task_started", &json!({}), EventSource::Task).await.unwrap();
        store.store("s1", "run_completed", &json!({}), EventSource::Session).await.unwrap();

        let runs = store
            .get_events_filtered("s1", None, &["run_started", "run_completed"])
            .await
            .unwrap();
        let seqs: Vec<i64> = runs.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 3]);
    }

    #[test]
    fn duplicate_seq_is_rejected_by_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let mut db = Database::new(&path).unwrap();

        let first = insert_with_next_seq(db.conn_mut(), "s1", "task_done", "{}", EventSource::Task).unwrap();
        let second = insert_with_next_seq(db.conn_mut(), "s1", "task_done", "{}", EventSource::Task).unwrap();
        assert_eq!((first, second), (1, 2));

        // A duplicate (session_id, seq) is rejected by the schema
        let dup = db.conn().execute(
            "INSERT INTO session_events (id, session_id, seq, type, payload, source, created_at)
             VALUES ('x', 's1', 2, 'task_done', '{}', 'task', '2024-01-01T00:00:00Z')",
            [],
        );
        assert!(dup.is_err());
    }
}
