//! Workflow checkpoints.
//!
//! A suspended run must survive a process restart, so its serialized state is
//! written here at the suspension boundary and read back on resume.  There is
//! one checkpoint per thread id; the workflow uses the namespace as the
//! thread id.  The payload is opaque JSON to this crate.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::store::{StoreError, now_rfc3339, open_connection, parse_ts};

#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub thread_id: String,
    pub payload: Value,
    pub saved_at: DateTime<Utc>,
}

/// Durable storage for suspended workflow runs.
pub trait CheckpointStore: Send + Sync {
    fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    /// Replace the checkpoint for `thread_id`.
    fn save(&self, thread_id: &str, payload: &Value) -> Result<(), StoreError>;

    /// Remove the checkpoint.  Returns `false` if there was none.
    fn delete(&self, thread_id: &str) -> Result<bool, StoreError>;

    /// Thread ids with a saved checkpoint, sorted.
    fn thread_ids(&self) -> Result<Vec<String>, StoreError>;
}

pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Self::from_connection(open_connection(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS workflow_checkpoints (
                thread_id TEXT PRIMARY KEY,
                payload   TEXT NOT NULL,
                saved_at  TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let row = self
            .lock()?
            .query_row(
                "SELECT payload, saved_at FROM workflow_checkpoints WHERE thread_id = ?1",
                params![thread_id],
                |row| {
                    let payload: String = row.get(0)?;
                    let saved: String = row.get(1)?;
                    Ok((payload, parse_ts(1, &saved)?))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((payload, saved_at)) => Ok(Some(Checkpoint {
                thread_id: thread_id.to_string(),
                payload: serde_json::from_str(&payload)?,
                saved_at,
            })),
        }
    }

    fn save(&self, thread_id: &str, payload: &Value) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT INTO workflow_checkpoints (thread_id, payload, saved_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(thread_id) DO UPDATE SET
                 payload = excluded.payload,
                 saved_at = excluded.saved_at",
            params![thread_id, serde_json::to_string(payload)?, now_rfc3339()],
        )?;
        Ok(())
    }

    fn delete(&self, thread_id: &str) -> Result<bool, StoreError> {
        let n = self.lock()?.execute(
            "DELETE FROM workflow_checkpoints WHERE thread_id = ?1",
            params![thread_id],
        )?;
        Ok(n > 0)
    }

    fn thread_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT thread_id FROM workflow_checkpoints ORDER BY thread_id ASC")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}
