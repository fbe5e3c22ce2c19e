//! `SQLite`-backed knowledge store with async operations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::events::PipelineEvent;
use crate::knowledge::{ChangeLogEntry, KnowledgeRecord};
use crate::pipeline::{Directive, EntityStatus, Run, RunStatus, RunSummary};

use super::error::StoreError;
use super::schema::SCHEMA;

/// Returns the default path for the knowledge database.
///
/// This is `~/.local/share/heartland-marathon/marathon.db` on Unix systems.
#[must_use]
pub fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("heartland-marathon")
        .join("marathon.db")
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Persistent store for knowledge records, runs and run events.
///
/// Uses `SQLite` with blocking calls moved onto `spawn_blocking`. A record and
/// its run's completion are written in one transaction.
#[derive(Debug, Clone)]
pub struct KnowledgeStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl KnowledgeStore {
    /// Open a store at the specified path.
    ///
    /// Creates parent directories if they don't exist and initializes the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema cannot be applied.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StoreError::CreateDir {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }

        let path_clone = path.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            let conn =
                Connection::open(&path_clone).map_err(|source| StoreError::DatabaseOpen {
                    path: path_clone,
                    source,
                })?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|_| StoreError::TaskCancelled)??;

        tracing::debug!(path = %path.display(), "Knowledge store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Open an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created or the schema cannot be applied.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection, StoreError> {
            let conn = Connection::open_in_memory()?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|_| StoreError::TaskCancelled)??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Returns the path to the database, if opened from a file.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut conn)
        })
        .await
        .map_err(|_| StoreError::TaskCancelled)?
    }

    /// Load the knowledge record for an entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the stored record is corrupt.
    pub async fn load_record(&self, entity: &str) -> Result<Option<KnowledgeRecord>, StoreError> {
        let entity = entity.to_string();
        self.blocking(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT record_json FROM knowledge_records WHERE entity = ?1",
                    params![entity],
                    |row| row.get(0),
                )
                .optional()?;
            json.map(|j| serde_json::from_str(&j).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    /// The change log of an entity, oldest first. Empty if there is no record.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the stored record is corrupt.
    pub async fn change_log(&self, entity: &str) -> Result<Vec<ChangeLogEntry>, StoreError> {
        Ok(self
            .load_record(entity)
            .await?
            .map(|record| record.change_log)
            .unwrap_or_default())
    }

    /// Register a new run for an entity and assign its run number.
    ///
    /// # Errors
    ///
    /// Returns an error if the run cannot be inserted.
    pub async fn begin_run(
        &self,
        entity: &str,
        directive: Directive,
        started_at: DateTime<Utc>,
    ) -> Result<Run, StoreError> {
        let entity = entity.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let last: i64 = tx.query_row(
                "SELECT COALESCE(MAX(run_number), 0) FROM runs WHERE entity = ?1",
                params![entity],
                |row| row.get(0),
            )?;
            let run = Run::new(entity, last.unsigned_abs() + 1, directive, started_at);
            tx.execute(
                "INSERT INTO runs (run_id, entity, run_number, status, directive, started_at, run_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run.run_id.to_string(),
                    run.entity,
                    to_i64(run.run_number),
                    run.status.as_str(),
                    run.directive.as_str(),
                    timestamp(run.started_at),
                    serde_json::to_string(&run)?,
                ],
            )?;
            tx.commit()?;
            Ok(run)
        })
        .await
    }

    /// Append one event to a run's log.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be inserted.
    pub async fn append_event(&self, event: &PipelineEvent) -> Result<(), StoreError> {
        let run_id = event.run_id.to_string();
        let seq = to_i64(event.seq);
        let at = timestamp(event.timestamp);
        let event_type = event.event_type();
        let node = event.node.clone();
        let json = serde_json::to_string(event)?;

        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO run_events (run_id, seq, timestamp, event_type, node, event_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![run_id, seq, at, event_type, node, json],
            )?;
            Ok(())
        })
        .await
    }

    /// Rewrite an open run with what it has gathered so far.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::RunClosed` if the run is not open, or a database error.
    pub async fn save_run_progress(&self, run: &Run) -> Result<(), StoreError> {
        let run_id = run.run_id;
        let json = serde_json::to_string(run)?;
        self.blocking(move |conn| {
            let updated = conn.execute(
                "UPDATE runs SET run_json = ?1 WHERE run_id = ?2 AND status = 'running'",
                params![json, run_id.to_string()],
            )?;
            if updated == 0 {
                return Err(StoreError::RunClosed(run_id));
            }
            Ok(())
        })
        .await
    }

    /// Persist the merged record and close the run, atomically.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::RunClosed` if the run is not open, or a database
    /// error. Nothing is written on error.
    pub async fn commit_run(&self, record: &KnowledgeRecord, run: &Run) -> Result<(), StoreError> {
        let entity = record.entity.clone();
        let record_json = serde_json::to_string(record)?;
        let total_runs = to_i64(record.total_runs);
        let last_run_id = record.last_run_id.map(|id| id.to_string());
        let updated_at = timestamp(record.last_run_at);
        let run = run.clone();

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO knowledge_records (entity, record_json, total_runs, last_run_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![entity, record_json, total_runs, last_run_id, updated_at],
            )?;
            close_run(&tx, &run)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Close a run as failed without touching its entity's record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::RunClosed` if the run is not open, or a database error.
    pub async fn fail_run(&self, run: &Run) -> Result<(), StoreError> {
        let run = run.clone();
        self.blocking(move |conn| close_run(conn, &run)).await
    }

    /// Fetch one run.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the stored run is corrupt.
    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        let run_id = run_id.to_string();
        self.blocking(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT run_json FROM runs WHERE run_id = ?1",
                    params![run_id],
                    |row| row.get(0),
                )
                .optional()?;
            json.map(|j| serde_json::from_str(&j).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    /// List runs newest first, optionally for one entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_runs(
        &self,
        entity: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RunSummary>, StoreError> {
        let entity = entity.map(String::from);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT run_json FROM runs
                 WHERE (?1 IS NULL OR entity = ?1)
                 ORDER BY started_at DESC, run_number DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![entity, limit], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            rows.iter()
                .map(|json| {
                    serde_json::from_str::<Run>(json)
                        .map(|run| run.summary_view())
                        .map_err(StoreError::from)
                })
                .collect()
        })
        .await
    }

    /// Events of a run with `seq > after_seq`, in sequence order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn events_for_run(
        &self,
        run_id: Uuid,
        after_seq: u64,
    ) -> Result<Vec<PipelineEvent>, StoreError> {
        let run_id = run_id.to_string();
        let after_seq = to_i64(after_seq);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT event_json FROM run_events WHERE run_id = ?1 AND seq > ?2 ORDER BY seq ASC",
            )?;
            let rows = stmt
                .query_map(params![run_id, after_seq], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.iter()
                .map(|json| serde_json::from_str(json).map_err(StoreError::from))
                .collect()
        })
        .await
    }

    /// Every entity with a record or at least one run.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_entities(&self) -> Result<Vec<EntityStatus>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT e.entity, k.total_runs, k.updated_at
                 FROM (SELECT entity FROM knowledge_records UNION SELECT entity FROM runs) e
                 LEFT JOIN knowledge_records k ON k.entity = e.entity
                 ORDER BY e.entity",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    let entity: String = row.get(0)?;
                    let total_runs: Option<i64> = row.get(1)?;
                    let updated_at: Option<String> = row.get(2)?;
                    Ok((entity, total_runs, updated_at))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(rows
                .into_iter()
                .map(|(entity, total_runs, updated_at)| EntityStatus {
                    entity,
                    has_record: total_runs.is_some(),
                    total_runs: total_runs.map_or(0, i64::unsigned_abs),
                    last_run_at: updated_at.and_then(|s| {
                        DateTime::parse_from_rfc3339(&s)
                            .ok()
                            .map(|dt| dt.with_timezone(&Utc))
                    }),
                    running: false,
                })
                .collect())
        })
        .await
    }

    /// Delete an entity's record and run history. Returns whether anything
    /// was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion fails.
    pub async fn clear_entity(&self, entity: &str) -> Result<bool, StoreError> {
        let entity = entity.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let records = tx.execute(
                "DELETE FROM knowledge_records WHERE entity = ?1",
                params![entity],
            )?;
            let runs = tx.execute("DELETE FROM runs WHERE entity = ?1", params![entity])?;
            tx.commit()?;
            Ok(records + runs > 0)
        })
        .await
    }

    /// Mark runs left open by a previous process as failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn fail_interrupted_runs(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let open = {
                let mut stmt = tx.prepare("SELECT run_json FROM runs WHERE status = 'running'")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };

            let mut closed = 0;
            for json in open {
                let mut run: Run = serde_json::from_str(&json)?;
                run.status = RunStatus::Failed;
                run.completed_at = Some(now);
                run.error = Some("interrupted by shutdown".to_string());
                close_run(&tx, &run)?;
                closed += 1;
            }
            tx.commit()?;
            Ok(closed)
        })
        .await
    }
}

/// Write a terminal run. Only open runs may be closed.
fn close_run(conn: &Connection, run: &Run) -> Result<(), StoreError> {
    let updated = conn.execute(
        "UPDATE runs SET status = ?1, completed_at = ?2, run_json = ?3
         WHERE run_id = ?4 AND status = 'running'",
        params![
            run.status.as_str(),
            run.completed_at.map(timestamp),
            serde_json::to_string(run)?,
            run.run_id.to_string(),
        ],
    )?;
    if updated == 0 {
        return Err(StoreError::RunClosed(run.run_id));
    }
    Ok(())
}
