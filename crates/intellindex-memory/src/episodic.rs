//! Episodic Memory Index.
//!
//! Records one [`Episode`] per finalized, feedback-driven workflow run and
//! retrieves the episodes most relevant to a new generation request.
//!
//! Episodes live in the keyed store under `("episodes", <namespace>)`, keyed
//! by a fresh UUID, as `{"content": <Episode>}`.  They are append-only: never
//! mutated, never deleted.
//!
//! [`EpisodeExtractor`] turns a finished message log into an [`Episode`] with
//! the memory model, falling back to a deterministic reading of the log when
//! the model's reply is not a valid episode.

use std::sync::Arc;

use intellindex_types::{ChatMessage, Episode, Generator, IndexError, Role, StoredEpisode};
use schemars::schema_for;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{KeyedStore, StoreError, StoreItem, StoreWrite};

/// Top-level namespace segment for episodes.
pub const EPISODES: &str = "episodes";

/// Header that introduces retrieved episodes inside the generation context.
pub const EPISODIC_HEADER: &str = "### EPISODIC MEMORY:";

const EXTRACTION_INSTRUCTIONS: &str = "Extract exceptional examples of noteworthy \
information gathering and analysis scenarios, including what made them effective.";

// ─────────────────────────────────────────────────────────────────────────────
// EpisodicMemory
// ─────────────────────────────────────────────────────────────────────────────

/// Thin episode log over a [`KeyedStore`].
#[derive(Clone)]
pub struct EpisodicMemory {
    store: Arc<dyn KeyedStore>,
}

impl EpisodicMemory {
    pub fn new(store: Arc<dyn KeyedStore>) -> Self {
        Self { store }
    }

    /// The store write that records `episode` for `namespace`.
    ///
    /// Returned rather than applied so callers can commit it together with
    /// other memory-tier writes.
    pub fn record_write(namespace: &str, episode: &Episode) -> (Uuid, StoreWrite) {
        let id = Uuid::new_v4();
        let write = StoreWrite::new(
            &[EPISODES, namespace],
            id.to_string(),
            json!({ "content": episode }),
        );
        (id, write)
    }

    /// Append `episode` under `namespace`.
    pub fn record(&self, namespace: &str, episode: &Episode) -> Result<Uuid, StoreError> {
        let (id, write) = Self::record_write(namespace, episode);
        self.store.put(&[EPISODES, namespace], &write.key, &write.value)?;
        debug!(namespace, episode_id = %id, "episode recorded");
        Ok(id)
    }

    /// Up to `limit` episodes ranked by relevance to `query`.
    ///
    /// An empty vector is the normal outcome for a namespace with no
    /// episodes yet.
    pub fn retrieve(
        &self,
        namespace: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<StoredEpisode>, StoreError> {
        self.store
            .search(&[EPISODES, namespace], query, limit)?
            .into_iter()
            .map(|hit| Self::decode(namespace, hit.item))
            .collect()
    }

    /// Every episode recorded for `namespace`, oldest first.
    pub fn all(&self, namespace: &str) -> Result<Vec<StoredEpisode>, StoreError> {
        self.store
            .list(&[EPISODES, namespace])?
            .into_iter()
            .map(|item| Self::decode(namespace, item))
            .collect()
    }

    pub fn count(&self, namespace: &str) -> Result<usize, StoreError> {
        Ok(self.store.list(&[EPISODES, namespace])?.len())
    }

    fn decode(namespace: &str, item: StoreItem) -> Result<StoredEpisode, StoreError> {
        let id = Uuid::parse_str(&item.key)
            .map_err(|e| StoreError::Corrupt(format!("episode key {}: {e}", item.key)))?;
        let content = item
            .value
            .get("content")
            .cloned()
            .ok_or_else(|| StoreError::Corrupt(format!("episode {id} has no content")))?;
        Ok(StoredEpisode {
            id,
            namespace: namespace.to_string(),
            recorded_at: item.created_at,
            episode: serde_json::from_value(content)?,
        })
    }
}

/// Render retrieved episodes as the context block appended to the report
/// instructions.  Returns an empty string when there is nothing to add.
pub fn render_episodic_context(episodes: &[StoredEpisode]) -> String {
    if episodes.is_empty() {
        return String::new();
    }
    let mut out = format!("\n\n{EPISODIC_HEADER}");
    for (i, stored) in episodes.iter().enumerate() {
        let e = &stored.episode;
        out.push_str(&format!(
            "\nEpisode {}:\nWhen: {}\nThought: {}\nDid: {}\nResult: {}\n",
            i + 1,
            e.observation,
            e.thoughts,
            e.action,
            e.result
        ));
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// EpisodeExtractor
// ─────────────────────────────────────────────────────────────────────────────

/// Distils a workflow's message log into an [`Episode`].
pub struct EpisodeExtractor {
    llm: Arc<dyn Generator>,
}

impl EpisodeExtractor {
    pub fn new(llm: Arc<dyn Generator>) -> Self {
        Self { llm }
    }

    /// Ask the memory model for an episode.
    ///
    /// # Errors
    ///
    /// Propagates [`IndexError::GenerationFailure`] from the model.  A reply
    /// that is not a valid episode is not an error: the deterministic
    /// [`episode_from_log`] reading is used instead.
    pub async fn extract(&self, messages: &[ChatMessage]) -> Result<Episode, IndexError> {
        let schema = serde_json::to_string_pretty(&schema_for!(Episode))
            .map_err(|e| IndexError::GenerationFailure(format!("episode schema: {e}")))?;
        let system = format!(
            "{EXTRACTION_INSTRUCTIONS}\n\n\
             Read the conversation below and record it as a single episode.\n\
             Output ONLY a JSON object matching this schema:\n{schema}"
        );
        let raw = self.llm.generate(&system, messages).await?;
        match parse_episode(&raw) {
            Some(episode) => Ok(episode),
            None => {
                warn!("episode extraction reply was not valid JSON; using log-derived episode");
                Ok(episode_from_log(messages))
            }
        }
    }
}

/// Parse an [`Episode`] out of a model reply, tolerating code fences and
/// surrounding prose.
pub fn parse_episode(raw: &str) -> Option<Episode> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}

/// Deterministic episode built directly from the message log.
pub fn episode_from_log(messages: &[ChatMessage]) -> Episode {
    let observation = messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default();
    let feedback: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::User)
        .skip(1)
        .map(|m| m.content.as_str())
        .collect();
    let action = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .map(|m| m.content.clone())
        .unwrap_or_default();
    Episode {
        observation,
        thoughts: if feedback.is_empty() {
            "I produced the report without reviewer corrections.".to_string()
        } else {
            format!("I revised the report after the reviewer said: {}", feedback.join(" | "))
        },
        action,
        result: format!("Approved after {} refinement(s).", feedback.len()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
