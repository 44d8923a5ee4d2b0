//! Namespaced Keyed Store.
//!
//! The memory tiers never talk to a database directly; they go through the
//! [`KeyedStore`] contract: point lookups and writes addressed by a
//! hierarchical namespace path plus a key, and a similarity search scoped to
//! one namespace path.
//!
//! [`SqliteStore`] is the bundled implementation.  Every value is indexed at
//! write time with an [`Embedder`] and search ranks hits by cosine
//! similarity, breaking ties by recency (most recently written first).
//!
//! # Storage layout
//!
//! | column      | type | description                                      |
//! |-------------|------|--------------------------------------------------|
//! | namespace   | TEXT | JSON-encoded namespace path, e.g. `["stm"]`      |
//! | key         | TEXT | Item key within the namespace                    |
//! | value       | TEXT | JSON document                                    |
//! | embedding   | BLOB | Little-endian f32 vector of the value's text     |
//! | created_at  | TEXT | RFC-3339 first-write time (UTC)                  |
//! | updated_at  | TEXT | RFC-3339 last-write time (UTC)                   |
//!
//! # Example
//!
//! ```rust
//! use intellindex_memory::store::{KeyedStore, SqliteStore};
//! use serde_json::json;
//!
//! let store = SqliteStore::open_in_memory().unwrap();
//! store.put(&["stm"], "n1", &json!({"report": "all quiet"})).unwrap();
//!
//! let item = store.get(&["stm"], "n1").unwrap().unwrap();
//! assert_eq!(item.value["report"], "all quiet");
//! ```

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use intellindex_types::IndexError;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Store connection lock poisoned")]
    Poisoned,
}

impl From<StoreError> for IndexError {
    fn from(e: StoreError) -> Self {
        IndexError::StoreFailure(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Items
// ─────────────────────────────────────────────────────────────────────────────

/// A stored value together with its bookkeeping metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreItem {
    pub namespace: Vec<String>,
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A search result: the matched item and its similarity to the query.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub item: StoreItem,
    pub score: f32,
}

/// One write in a [`KeyedStore::put_batch`] call.
#[derive(Debug, Clone)]
pub struct StoreWrite {
    pub namespace: Vec<String>,
    pub key: String,
    pub value: Value,
}

impl StoreWrite {
    pub fn new(namespace: &[&str], key: impl Into<String>, value: Value) -> Self {
        Self {
            namespace: namespace.iter().map(|s| s.to_string()).collect(),
            key: key.into(),
            value,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// KeyedStore contract
// ─────────────────────────────────────────────────────────────────────────────

/// Durable, namespaced key→value storage with similarity search.
pub trait KeyedStore: Send + Sync {
    /// Point lookup.  `Ok(None)` when the key has never been written.
    fn get(&self, namespace: &[&str], key: &str) -> Result<Option<StoreItem>, StoreError>;

    /// Insert or overwrite a single value.
    fn put(&self, namespace: &[&str], key: &str, value: &Value) -> Result<(), StoreError>;

    /// Apply several writes as one unit: either all land or none do.
    fn put_batch(&self, writes: &[StoreWrite]) -> Result<(), StoreError>;

    /// Return up to `limit` items under `namespace` ranked by similarity to
    /// `query` (best first, ties broken newest first).
    ///
    /// An unknown namespace yields an empty vector, not an error.
    fn search(&self, namespace: &[&str], query: &str, limit: usize)
    -> Result<Vec<SearchHit>, StoreError>;

    /// Every item under `namespace`, oldest first.
    fn list(&self, namespace: &[&str]) -> Result<Vec<StoreItem>, StoreError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Embeddings
// ─────────────────────────────────────────────────────────────────────────────

/// Turns text into a dense vector for similarity ranking.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Feature-hashing bag-of-words embedder.
///
/// Lower-cased alphanumeric tokens are hashed with FNV-1a into `dims`
/// buckets.  The hash is stable across builds, so vectors persisted by one
/// process remain comparable in the next.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMS: usize = 256;

    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMS)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            let slot = (fnv1a(token.as_bytes()) % self.dims as u64) as usize;
            v[slot] += 1.0;
        }
        v
    }
}

/// Compute the cosine similarity between two equal-length vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` if either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

pub(crate) fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub(crate) fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Concatenate every string leaf of a JSON document.  This is the text a
/// value is indexed under.
pub fn value_text(value: &Value) -> String {
    fn walk(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => out.push(s.clone()),
            Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            Value::Object(map) => map.values().for_each(|v| walk(v, out)),
            Value::Number(n) => out.push(n.to_string()),
            Value::Bool(_) | Value::Null => {}
        }
    }
    let mut parts = Vec::new();
    walk(value, &mut parts);
    parts.join("\n")
}

/// Open a file-backed connection that waits on a busy database instead of
/// failing, so several handles can share one file.
pub(crate) fn open_connection(path: &str) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(col: usize, raw: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    raw.parse::<DateTime<Utc>>().map_err(|e| {
        rusqlite::Error::InvalidColumnType(col, e.to_string(), rusqlite::types::Type::Text)
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// SqliteStore
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed [`KeyedStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
    embedder: Box<dyn Embedder>,
}

impl SqliteStore {
    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Self::from_connection(open_connection(path)?)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Replace the default [`HashingEmbedder`] (builder-style).
    pub fn with_embedder(mut self, embedder: Box<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(conn),
            embedder: Box::new(HashingEmbedder::default()),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.lock()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS store_items (
                namespace  TEXT NOT NULL,
                key        TEXT NOT NULL,
                value      TEXT NOT NULL,
                embedding  BLOB NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn encode_namespace<S: AsRef<str>>(namespace: &[S]) -> Result<String, StoreError> {
        let parts: Vec<&str> = namespace.iter().map(|s| s.as_ref()).collect();
        Ok(serde_json::to_string(&parts)?)
    }

    fn upsert(
        conn: &Connection,
        embedder: &dyn Embedder,
        namespace: &str,
        key: &str,
        value: &Value,
    ) -> Result<(), StoreError> {
        let blob = embedding_to_bytes(&embedder.embed(&value_text(value)));
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO store_items (namespace, key, value, embedding, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(namespace, key) DO UPDATE SET
                 value = excluded.value,
                 embedding = excluded.embedding,
                 updated_at = excluded.updated_at",
            params![namespace, key, serde_json::to_string(value)?, blob, now],
        )?;
        Ok(())
    }

    /// Rows under `namespace` as `(rowid, item, embedding)`, oldest first.
    fn rows(&self, namespace: &[&str]) -> Result<Vec<(i64, StoreItem, Vec<f32>)>, StoreError> {
        let ns = Self::encode_namespace(namespace)?;
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT rowid, key, value, embedding, created_at, updated_at
             FROM store_items
             WHERE namespace = ?1
             ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![ns], |row| {
            let rowid: i64 = row.get(0)?;
            let key: String = row.get(1)?;
            let value: String = row.get(2)?;
            let blob: Vec<u8> = row.get(3)?;
            let created: String = row.get(4)?;
            let updated: String = row.get(5)?;
            Ok((rowid, key, value, blob, parse_ts(4, &created)?, parse_ts(5, &updated)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (rowid, key, value, blob, created_at, updated_at) = row?;
            let item = StoreItem {
                namespace: namespace.iter().map(|s| s.to_string()).collect(),
                key,
                value: serde_json::from_str(&value)?,
                created_at,
                updated_at,
            };
            out.push((rowid, item, bytes_to_embedding(&blob)));
        }
        Ok(out)
    }
}

impl KeyedStore for SqliteStore {
    fn get(&self, namespace: &[&str], key: &str) -> Result<Option<StoreItem>, StoreError> {
        let ns = Self::encode_namespace(namespace)?;
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT value, created_at, updated_at FROM store_items
                 WHERE namespace = ?1 AND key = ?2",
                params![ns, key],
                |row| {
                    let value: String = row.get(0)?;
                    let created: String = row.get(1)?;
                    let updated: String = row.get(2)?;
                    Ok((value, parse_ts(1, &created)?, parse_ts(2, &updated)?))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((value, created_at, updated_at)) => Ok(Some(StoreItem {
                namespace: namespace.iter().map(|s| s.to_string()).collect(),
                key: key.to_string(),
                value: serde_json::from_str(&value)?,
                created_at,
                updated_at,
            })),
        }
    }

    fn put(&self, namespace: &[&str], key: &str, value: &Value) -> Result<(), StoreError> {
        let ns = Self::encode_namespace(namespace)?;
        let conn = self.lock()?;
        Self::upsert(&conn, self.embedder.as_ref(), &ns, key, value)
    }

    fn put_batch(&self, writes: &[StoreWrite]) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for w in writes {
            let ns = Self::encode_namespace(w.namespace.as_slice())?;
            Self::upsert(&tx, self.embedder.as_ref(), &ns, &w.key, &w.value)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn search(
        &self,
        namespace: &[&str],
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let query_embedding = self.embedder.embed(query);
        let mut scored: Vec<(i64, SearchHit)> = self
            .rows(namespace)?
            .into_iter()
            .filter(|(_, _, emb)| emb.len() == query_embedding.len())
            .map(|(rowid, item, emb)| {
                let score = cosine_similarity(&emb, &query_embedding);
                (rowid, SearchHit { item, score })
            })
            .collect();
        scored.sort_by(|(ra, a), (rb, b)| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.item.updated_at.cmp(&a.item.updated_at))
                .then_with(|| rb.cmp(ra))
        });
        scored.truncate(limit);
        Ok(scored.into_iter().map(|(_, hit)| hit).collect())
    }

    fn list(&self, namespace: &[&str]) -> Result<Vec<StoreItem>, StoreError> {
        Ok(self.rows(namespace)?.into_iter().map(|(_, item, _)| item).collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── cosine_similarity ────────────────────────────────────────────────────

    #[test]
    fn cosine_identical_vectors_is_one() {
        let v = vec![1.0f32, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_zero_vector_returns_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn embedding_bytes_roundtrip() {
        let original = vec![1.5f32, -0.25, 0.0, 42.0];
        assert_eq!(bytes_to_embedding(&embedding_to_bytes(&original)), original);
    }

    // ── HashingEmbedder ──────────────────────────────────────────────────────

    #[test]
    fn hashing_embedder_is_case_insensitive_and_stable() {
        let e = HashingEmbedder::default();
        assert_eq!(e.embed("Disk Latency"), e.embed("disk latency"));
        assert_eq!(e.embed("x").len(), HashingEmbedder::DEFAULT_DIMS);
    }

    #[test]
    fn hashing_embedder_related_text_scores_higher() {
        let e = HashingEmbedder::default();
        let q = e.embed("login spike in the evening");
        let near = e.embed("evening login spike observed");
        let far = e.embed("battery temperature nominal");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[test]
    fn value_text_collects_string_leaves() {
        let v = json!({"content": {"observation": "a", "result": "b"}, "n": 3});
        let text = value_text(&v);
        assert!(text.contains('a') && text.contains('b') && text.contains('3'));
    }

    // ── SqliteStore ──────────────────────────────────────────────────────────

    #[test]
    fn get_missing_returns_none() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get(&["instructions"], "nobody").unwrap().is_none());
    }

    #[test]
    fn put_overwrites_and_keeps_created_at() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(&["stm"], "n1", &json!({"report": "v1"})).unwrap();
        let first = store.get(&["stm"], "n1").unwrap().unwrap();
        store.put(&["stm"], "n1", &json!({"report": "v2"})).unwrap();
        let second = store.get(&["stm"], "n1").unwrap().unwrap();
        assert_eq!(second.value["report"], "v2");
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[test]
    fn namespaces_are_isolated() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(&["episodes", "a"], "k", &json!({"x": 1})).unwrap();
        assert!(store.get(&["episodes", "b"], "k").unwrap().is_none());
        assert!(store.search(&["episodes", "b"], "x", 5).unwrap().is_empty());
        assert_eq!(store.list(&["episodes", "a"]).unwrap().len(), 1);
    }

    #[test]
    fn search_ranks_by_similarity() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(&["docs"], "near", &json!({"t": "login spike evening"})).unwrap();
        store.put(&["docs"], "far", &json!({"t": "battery nominal"})).unwrap();
        let hits = store.search(&["docs"], "evening login spike", 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].item.key, "near");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn search_ties_prefer_most_recent() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(&["docs"], "older", &json!({"t": "same text"})).unwrap();
        store.put(&["docs"], "newer", &json!({"t": "same text"})).unwrap();
        let hits = store.search(&["docs"], "same text", 1).unwrap();
        assert_eq!(hits[0].item.key, "newer");
    }

    #[test]
    fn search_limit_zero_is_empty() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(&["docs"], "a", &json!({"t": "x"})).unwrap();
        assert!(store.search(&["docs"], "x", 0).unwrap().is_empty());
    }

    #[test]
    fn put_batch_writes_all_items() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .put_batch(&[
                StoreWrite::new(&["instructions"], "n1", json!({"prompt": "p"})),
                StoreWrite::new(&["stm"], "n1", json!({"report": "r"})),
            ])
            .unwrap();
        assert!(store.get(&["instructions"], "n1").unwrap().is_some());
        assert!(store.get(&["stm"], "n1").unwrap().is_some());
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let path = path.to_string_lossy();
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put(&["stm"], "n1", &json!({"report": "kept"})).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let item = store.get(&["stm"], "n1").unwrap().unwrap();
        assert_eq!(item.value["report"], "kept");
    }
}
