//! Job queue storage and persistence.

use super::models::*;
use super::schema::JOB_QUEUE_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::BASE_DB_VERSION;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Trait for job queue storage operations.
pub trait JobQueueStore: Send + Sync {
    /// Insert a new pending ticket.
    fn enqueue(&self, ticket: &JobTicket) -> Result<()>;

    fn get_ticket(&self, id: &str) -> Result<Option<JobTicket>>;

    /// Atomically claim the next pending ticket on `queue` (highest priority
    /// first, then age) and flip it to Running.
    fn claim_next(&self, queue: &str) -> Result<Option<JobTicket>>;

    /// Non-terminal ticket for this (queue, sound) pair, used to keep
    /// submission idempotent.
    fn find_active(&self, queue: &str, sound_id: i64) -> Result<Option<JobTicket>>;

    /// Number of non-terminal tickets on `queue`. This is the depth the
    /// orchestrator budgets against.
    fn queue_depth(&self, queue: &str) -> Result<usize>;

    /// Flip a ticket to a terminal status. Returns false when the ticket was
    /// already terminal, in which case nothing changed.
    fn mark_terminal(&self, id: &str, status: JobStatus, error: Option<&str>) -> Result<bool>;

    /// Remove terminal tickets older than `cutoff` (unix seconds). Returns
    /// the number purged.
    fn purge_terminal_before(&self, cutoff: i64) -> Result<usize>;
}

/// SQLite-backed job queue.
pub struct SqliteJobQueueStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobQueueStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = if db_path.as_ref().exists() {
            Connection::open_with_flags(
                &db_path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            let conn = Connection::open(&db_path)?;
            JOB_QUEUE_VERSIONED_SCHEMAS
                .last()
                .context("No schemas defined")?
                .create(&conn)?;
            info!("Created new job queue database at {:?}", db_path.as_ref());
            conn
        };

        let db_version = conn
            .query_row("PRAGMA user_version;", [], |row| row.get::<usize, i64>(0))
            .context("Failed to read database version")?
            - BASE_DB_VERSION as i64;
        if db_version < 0 {
            bail!("Job queue database predates the base db version");
        }
        let version = db_version as usize;
        if version >= JOB_QUEUE_VERSIONED_SCHEMAS.len() {
            bail!(
                "Job queue database version {} is too new (max supported: {})",
                version,
                JOB_QUEUE_VERSIONED_SCHEMAS.len() - 1
            );
        }
        JOB_QUEUE_VERSIONED_SCHEMAS
            .get(version)
            .context("Failed to get schema")?
            .validate(&conn)?;

        Ok(SqliteJobQueueStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory queue for testing.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        JOB_QUEUE_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;
        Ok(SqliteJobQueueStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    fn row_to_ticket(row: &rusqlite::Row) -> rusqlite::Result<JobTicket> {
        let payload_json: String = row.get("payload")?;
        let payload = serde_json::from_str(&payload_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?;
        Ok(JobTicket {
            id: row.get("id")?,
            queue: row.get("queue")?,
            sound_id: row.get("sound_id")?,
            payload,
            priority: row.get("priority")?,
            status: JobStatus::from_str(&row.get::<_, String>("status")?)
                .unwrap_or(JobStatus::Pending),
            error: row.get("error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

impl JobQueueStore for SqliteJobQueueStore {
    fn enqueue(&self, ticket: &JobTicket) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO job_queue (id, queue, sound_id, payload, priority, status)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                ticket.id,
                ticket.queue,
                ticket.sound_id,
                serde_json::to_string(&ticket.payload)?,
                ticket.priority,
                ticket.status.as_str(),
            ],
        )?;
        Ok(())
    }

    fn get_ticket(&self, id: &str) -> Result<Option<JobTicket>> {
        let conn = self.conn.lock().unwrap();
        let ticket = conn
            .query_row(
                "SELECT * FROM job_queue WHERE id = ?1",
                params![id],
                |row| Self::row_to_ticket(row),
            )
            .optional()?;
        Ok(ticket)
    }

    fn claim_next(&self, queue: &str) -> Result<Option<JobTicket>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let ticket = tx
            .query_row(
                "SELECT * FROM job_queue WHERE queue = ?1 AND status = 'PE'
                 ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1",
                params![queue],
                |row| Self::row_to_ticket(row),
            )
            .optional()?;
        let Some(mut ticket) = ticket else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE job_queue SET status = 'RU', updated_at = ?1 WHERE id = ?2",
            params![Self::now(), ticket.id],
        )?;
        tx.commit()?;
        ticket.status = JobStatus::Running;
        Ok(Some(ticket))
    }

    fn find_active(&self, queue: &str, sound_id: i64) -> Result<Option<JobTicket>> {
        let conn = self.conn.lock().unwrap();
        let ticket = conn
            .query_row(
                "SELECT * FROM job_queue
                 WHERE queue = ?1 AND sound_id = ?2 AND status IN ('PE', 'RU')
                 LIMIT 1",
                params![queue, sound_id],
                |row| Self::row_to_ticket(row),
            )
            .optional()?;
        Ok(ticket)
    }

    fn queue_depth(&self, queue: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let depth: i64 = conn.query_row(
            "SELECT COUNT(*) FROM job_queue WHERE queue = ?1 AND status IN ('PE', 'RU')",
            params![queue],
            |row| row.get(0),
        )?;
        Ok(depth as usize)
    }

    fn mark_terminal(&self, id: &str, status: JobStatus, error: Option<&str>) -> Result<bool> {
        if !status.is_terminal() {
            bail!("{:?} is not a terminal status", status);
        }
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE job_queue SET status = ?1, error = ?2, updated_at = ?3
             WHERE id = ?4 AND status IN ('PE', 'RU')",
            params![status.as_str(), error, Self::now(), id],
        )?;
        Ok(changed > 0)
    }

    fn purge_terminal_before(&self, cutoff: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let purged = conn.execute(
            "DELETE FROM job_queue WHERE status IN ('OK', 'FA', 'SK') AND updated_at < ?1",
            params![cutoff],
        )?;
        Ok(purged)
    }
}
