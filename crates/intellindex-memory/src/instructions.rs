//! Instruction Store.
//!
//! One system-instructions text per namespace, stored under
//! `("instructions",)` keyed by the namespace as `{"prompt": <text>}`.  The
//! row is created lazily with a default on first use and later replaced by
//! the instruction optimizer.  Last writer wins.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::store::{KeyedStore, StoreError, StoreWrite};

/// Top-level namespace segment for instructions.
pub const INSTRUCTIONS: &str = "instructions";

/// Instructions a namespace starts with before any optimization.
pub const DEFAULT_INSTRUCTIONS: &str = "\
You are an information extraction analyst. You receive batches of dated \
records for a single subject and write a concise report of what they show.
- Lead with the most important findings.
- Call out anomalies, changes against prior context, and emerging trends.
- Keep facts tied to their dates; do not invent data that is not present.";

#[derive(Clone)]
pub struct InstructionStore {
    store: Arc<dyn KeyedStore>,
}

impl InstructionStore {
    pub fn new(store: Arc<dyn KeyedStore>) -> Self {
        Self { store }
    }

    /// Current instructions, or `None` if the namespace has none yet.
    pub fn get(&self, namespace: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .get(&[INSTRUCTIONS], namespace)?
            .and_then(|item| item.value.get("prompt").and_then(|p| p.as_str()).map(str::to_string)))
    }

    /// Current instructions, writing `default_text` through on first access.
    pub fn get_or_default(&self, namespace: &str, default_text: &str) -> Result<String, StoreError> {
        if let Some(text) = self.get(namespace)? {
            return Ok(text);
        }
        self.set(namespace, default_text)?;
        info!(namespace, "initialised default instructions");
        Ok(default_text.to_string())
    }

    /// Unconditional overwrite.
    pub fn set(&self, namespace: &str, text: &str) -> Result<(), StoreError> {
        self.store.put(&[INSTRUCTIONS], namespace, &json!({ "prompt": text }))
    }

    /// The store write equivalent to [`set`][Self::set], for batched commits.
    pub fn write(namespace: &str, text: &str) -> StoreWrite {
        StoreWrite::new(&[INSTRUCTIONS], namespace, json!({ "prompt": text }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn instructions() -> (Arc<SqliteStore>, InstructionStore) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        (store.clone(), InstructionStore::new(store))
    }

    #[test]
    fn get_on_unknown_namespace_is_none() {
        let (_, s) = instructions();
        assert!(s.get("n1").unwrap().is_none());
    }

    #[test]
    fn get_or_default_returns_default_twice_and_persists_it() {
        let (raw, s) = instructions();
        assert_eq!(s.get_or_default("n1", "D").unwrap(), "D");
        let first = raw.get(&[INSTRUCTIONS], "n1").unwrap().unwrap();
        assert_eq!(s.get_or_default("n1", "other default").unwrap(), "D");
        let second = raw.get(&[INSTRUCTIONS], "n1").unwrap().unwrap();
        // The second call reads; it does not write again.
        assert_eq!(first.updated_at, second.updated_at);
    }

    #[test]
    fn set_overwrites() {
        let (_, s) = instructions();
        s.get_or_default("n1", "D").unwrap();
        s.set("n1", "better").unwrap();
        assert_eq!(s.get("n1").unwrap().as_deref(), Some("better"));
        assert_eq!(s.get_or_default("n1", "D").unwrap(), "better");
    }

    #[test]
    fn namespaces_do_not_share_instructions() {
        let (_, s) = instructions();
        s.set("a", "for a").unwrap();
        assert!(s.get("b").unwrap().is_none());
    }

    #[test]
    fn value_without_prompt_field_reads_as_absent() {
        let (raw, s) = instructions();
        raw.put(&[INSTRUCTIONS], "n1", &json!({"other": "x"})).unwrap();
        assert!(s.get("n1").unwrap().is_none());
    }
}
