//! Long-Term Archive.
//!
//! Receives every finalized, feedback-refined report and makes it retrievable
//! by semantic query across all namespaces.
//!
//! Documents are content-addressed: the id is a UUID v5 over the namespace
//! and the text, and inserts use `INSERT OR IGNORE`, so pushing the same
//! report twice (e.g. when a failed finalize is retried) stores it once.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use tracing::debug;
use uuid::Uuid;

use crate::store::{
    Embedder, HashingEmbedder, StoreError, bytes_to_embedding, cosine_similarity,
    embedding_to_bytes, now_rfc3339, open_connection, parse_ts,
};

/// Fixed v5 namespace for archive document ids.
const ARCHIVE_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6b1f_2c0e_93a4_4d5e_8f71_0a2b_3c4d_5e6f);

/// One archive document returned by [`LongTermArchive::query`].
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveHit {
    pub id: Uuid,
    pub namespace: String,
    pub text: String,
    pub inserted_at: DateTime<Utc>,
    pub score: f32,
}

/// Long-term semantic archive of finalized reports.
pub trait LongTermArchive: Send + Sync {
    /// Archive `text` for `namespace`.  Idempotent per `(namespace, text)`.
    fn insert(&self, namespace: &str, text: &str) -> Result<Uuid, StoreError>;

    /// Up to `limit` documents ranked by relevance to `text`.
    fn query(&self, text: &str, limit: usize) -> Result<Vec<ArchiveHit>, StoreError>;

    /// Number of archived documents.
    fn len(&self) -> Result<usize, StoreError>;

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

/// Deterministic id of an archived document.
pub fn document_id(namespace: &str, text: &str) -> Uuid {
    let mut name = Vec::with_capacity(namespace.len() + text.len() + 1);
    name.extend_from_slice(namespace.as_bytes());
    name.push(0);
    name.extend_from_slice(text.as_bytes());
    Uuid::new_v5(&ARCHIVE_ID_NAMESPACE, &name)
}

/// SQLite-backed [`LongTermArchive`].
pub struct SqliteArchive {
    conn: Mutex<Connection>,
    embedder: Box<dyn Embedder>,
}

impl SqliteArchive {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Self::from_connection(open_connection(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS archive_documents (
                id          TEXT PRIMARY KEY,
                namespace   TEXT NOT NULL,
                text        TEXT NOT NULL,
                embedding   BLOB NOT NULL,
                inserted_at TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            embedder: Box::new(HashingEmbedder::default()),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl LongTermArchive for SqliteArchive {
    fn insert(&self, namespace: &str, text: &str) -> Result<Uuid, StoreError> {
        let id = document_id(namespace, text);
        let blob = embedding_to_bytes(&self.embedder.embed(text));
        let inserted = self.lock()?.execute(
            "INSERT OR IGNORE INTO archive_documents (id, namespace, text, embedding, inserted_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id.to_string(), namespace, text, blob, now_rfc3339()],
        )?;
        debug!(namespace, document_id = %id, new = inserted > 0, "archive insert");
        Ok(id)
    }

    fn query(&self, text: &str, limit: usize) -> Result<Vec<ArchiveHit>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let query_embedding = self.embedder.embed(text);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT rowid, id, namespace, text, embedding, inserted_at
             FROM archive_documents",
        )?;
        let rows = stmt.query_map([], |row| {
            let rowid: i64 = row.get(0)?;
            let id: String = row.get(1)?;
            let namespace: String = row.get(2)?;
            let text: String = row.get(3)?;
            let blob: Vec<u8> = row.get(4)?;
            let inserted: String = row.get(5)?;
            Ok((rowid, id, namespace, text, blob, parse_ts(5, &inserted)?))
        })?;

        let mut hits: Vec<(i64, ArchiveHit)> = Vec::new();
        for row in rows {
            let (rowid, id, namespace, text, blob, inserted_at) = row?;
            let embedding = bytes_to_embedding(&blob);
            if embedding.len() != query_embedding.len() {
                continue;
            }
            let id = Uuid::parse_str(&id)
                .map_err(|e| StoreError::Corrupt(format!("archive id {id}: {e}")))?;
            hits.push((
                rowid,
                ArchiveHit {
                    id,
                    namespace,
                    text,
                    inserted_at,
                    score: cosine_similarity(&embedding, &query_embedding),
                },
            ));
        }
        hits.sort_by(|(ra, a), (rb, b)| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.inserted_at.cmp(&a.inserted_at))
                .then_with(|| rb.cmp(ra))
        });
        hits.truncate(limit);
        Ok(hits.into_iter().map(|(_, hit)| hit).collect())
    }

    fn len(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .lock()?
            .query_row("SELECT COUNT(*) FROM archive_documents", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_idempotent_per_namespace_and_text() {
        let archive = SqliteArchive::open_in_memory().unwrap();
        let a = archive.insert("n1", "report one").unwrap();
        let b = archive.insert("n1", "report one").unwrap();
        assert_eq!(a, b);
        assert_eq!(archive.len().unwrap(), 1);

        archive.insert("n2", "report one").unwrap();
        assert_eq!(archive.len().unwrap(), 2);
    }

    #[test]
    fn query_ranks_relevant_documents_first() {
        let archive = SqliteArchive::open_in_memory().unwrap();
        archive.insert("n1", "database replication lag on the primary").unwrap();
        archive.insert("n1", "marketing campaign click-through rates").unwrap();
        let hits = archive.query("replication lag", 5).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].text.contains("replication"));
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn query_on_empty_archive_and_zero_limit() {
        let archive = SqliteArchive::open_in_memory().unwrap();
        assert!(archive.is_empty().unwrap());
        assert!(archive.query("anything", 5).unwrap().is_empty());
        archive.insert("n1", "x").unwrap();
        assert!(archive.query("x", 0).unwrap().is_empty());
    }

    #[test]
    fn document_id_is_stable() {
        assert_eq!(document_id("n1", "t"), document_id("n1", "t"));
        assert_ne!(document_id("n1", "t"), document_id("n2", "t"));
        assert_eq!(document_id("n1", "t").get_version_num(), 5);
    }

    #[test]
    fn archive_persists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        let path = path.to_str().unwrap();
        {
            let archive = SqliteArchive::open(path).unwrap();
            archive.insert("n1", "kept across reopen").unwrap();
        }
        let archive = SqliteArchive::open(path).unwrap();
        assert_eq!(archive.query("kept", 1).unwrap()[0].text, "kept across reopen");
    }
}
