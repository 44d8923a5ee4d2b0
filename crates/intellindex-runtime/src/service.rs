//! [`IntelligentIndex`] – the service facade.
//!
//! The surface a transport layer (or the CLI) calls.  It owns the
//! [`WorkflowEngine`], the checkpoint store, and a lock per namespace:
//!
//! - `submit` starts a run and drives it to its first suspension.
//! - `resume` loads the suspended run, applies the reviewer's decision, and
//!   drives it to the next suspension or to completion.
//! - The accessors read and overwrite the instruction and STM tiers directly
//!   and query the archive.
//!
//! A checkpoint is written only after a transition sequence succeeds, and is
//! deleted when the run finishes.  Calls for the same namespace are
//! serialized; calls for different namespaces run concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use intellindex_memory::archive::{ArchiveHit, LongTermArchive, SqliteArchive};
use intellindex_memory::checkpoint::{CheckpointStore, SqliteCheckpointStore};
use intellindex_memory::episodic::EpisodicMemory;
use intellindex_memory::instructions::{DEFAULT_INSTRUCTIONS, InstructionStore};
use intellindex_memory::stm::{RollupPolicy, ShortTermMemory};
use intellindex_memory::store::{KeyedStore, SqliteStore, StoreError};
use intellindex_types::{
    Generator, IndexError, ResumeInput, ReviewRequest, RunOutcome, StoredEpisode, WorkItem,
};
use tracing::{info, warn};

use crate::llm_driver::LlmDriver;
use crate::optimizer::MetapromptOptimizer;
use crate::workflow::{EngineDeps, EngineSettings, WorkflowEngine, WorkflowRun};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration bundle for [`IntelligentIndex`].
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Base URL of the OpenAI-compatible model server.
    pub llm_base_url: String,
    /// Model for report generation and refinement.
    pub report_model: String,
    /// Model for STM condensation, episode extraction and optimization.
    pub memory_model: String,
    /// Bearer token for hosted model servers.
    pub api_key: Option<String>,
    /// SQLite database path.  If `None`, in-memory stores are used (data lost
    /// on exit).
    pub db_path: Option<String>,
    pub default_instructions: String,
    /// Prior episodes inlined into the generation context.
    pub episodic_limit: usize,
    /// Default number of hits for [`IntelligentIndex::query_archive`].
    pub archive_top_k: usize,
    pub reflection_steps: usize,
    /// Pending runs older than this are discarded.  `None` keeps them forever.
    pub run_ttl_hours: Option<u64>,
    pub rollup: RollupPolicy,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            llm_base_url: "http://localhost:11434".to_string(),
            report_model: "llama3".to_string(),
            memory_model: "llama3".to_string(),
            api_key: None,
            db_path: None,
            default_instructions: DEFAULT_INSTRUCTIONS.to_string(),
            episodic_limit: 1,
            archive_top_k: 5,
            reflection_steps: MetapromptOptimizer::DEFAULT_REFLECTION_STEPS,
            run_ttl_hours: None,
            rollup: RollupPolicy::default(),
        }
    }
}

impl IndexConfig {
    fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            default_instructions: self.default_instructions.clone(),
            episodic_limit: self.episodic_limit,
            reflection_steps: self.reflection_steps,
            rollup: self.rollup.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backends
// ─────────────────────────────────────────────────────────────────────────────

/// Storage handles behind the facade.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn KeyedStore>,
    pub archive: Arc<dyn LongTermArchive>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

impl Backends {
    /// SQLite backends sharing the database file at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        info!("opening persistent index database at: {}", path);
        Ok(Self {
            store: Arc::new(SqliteStore::open(path)?),
            archive: Arc::new(SqliteArchive::open(path)?),
            checkpoints: Arc::new(SqliteCheckpointStore::open(path)?),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            store: Arc::new(SqliteStore::open_in_memory()?),
            archive: Arc::new(SqliteArchive::open_in_memory()?),
            checkpoints: Arc::new(SqliteCheckpointStore::open_in_memory()?),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// IntelligentIndex
// ─────────────────────────────────────────────────────────────────────────────

pub struct IntelligentIndex {
    engine: WorkflowEngine,
    backends: Backends,
    instructions: InstructionStore,
    stm: ShortTermMemory,
    episodic: EpisodicMemory,
    archive_top_k: usize,
    run_ttl: Option<Duration>,
    locks: LockMap,
}

type LockMap = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Holds a namespace's lock.  On drop the map entry is removed when no other
/// call is holding or waiting for it.
struct NamespaceGuard<'a> {
    locks: &'a LockMap,
    namespace: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for NamespaceGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map and one here means nobody else wants it.
        if Arc::strong_count(&self.lock) == 2
            && locks.get(&self.namespace).is_some_and(|l| Arc::ptr_eq(l, &self.lock))
        {
            locks.remove(&self.namespace);
        }
    }
}

fn require_namespace(namespace: &str) -> Result<&str, IndexError> {
    let ns = namespace.trim();
    if ns.is_empty() {
        return Err(IndexError::InvalidRequest("namespace is required".into()));
    }
    Ok(ns)
}

impl IntelligentIndex {
    /// Build the index from configuration: two [`LlmDriver`]s and SQLite
    /// backends at `config.db_path`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::StoreFailure`] if the database cannot be opened.
    pub fn new(config: IndexConfig) -> Result<Self, IndexError> {
        let backends = match &config.db_path {
            Some(path) => Backends::open(path)?,
            None => {
                warn!("no db_path configured; using in-memory stores (data will be lost)");
                Backends::in_memory()?
            }
        };
        let report_llm = LlmDriver::new(&config.llm_base_url, &config.report_model)
            .with_api_key(config.api_key.clone());
        let memory_llm = LlmDriver::new(&config.llm_base_url, &config.memory_model)
            .with_api_key(config.api_key.clone());
        Ok(Self::with_generators(config, backends, Arc::new(report_llm), Arc::new(memory_llm)))
    }

    /// Build the index over explicit backends and generation capabilities.
    pub fn with_generators(
        config: IndexConfig,
        backends: Backends,
        report_llm: Arc<dyn Generator>,
        memory_llm: Arc<dyn Generator>,
    ) -> Self {
        let deps = EngineDeps {
            report_llm,
            memory_llm,
            store: Arc::clone(&backends.store),
            archive: Arc::clone(&backends.archive),
        };
        Self::with_engine(config, backends, |settings| WorkflowEngine::new(deps, settings))
    }

    /// Build the index around an engine produced by `build` from the
    /// configured settings.
    pub fn with_engine(
        config: IndexConfig,
        backends: Backends,
        build: impl FnOnce(EngineSettings) -> WorkflowEngine,
    ) -> Self {
        let engine = build(config.engine_settings());
        let run_ttl = config
            .run_ttl_hours
            .map(|h| i64::try_from(h).ok().and_then(Duration::try_hours).unwrap_or(Duration::MAX));
        Self {
            engine,
            instructions: InstructionStore::new(Arc::clone(&backends.store)),
            stm: ShortTermMemory::new(Arc::clone(&backends.store)),
            episodic: EpisodicMemory::new(Arc::clone(&backends.store)),
            backends,
            archive_top_k: config.archive_top_k,
            run_ttl,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_namespace(&self, namespace: &str) -> NamespaceGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(namespace.to_string()).or_default())
        };
        let guard = Arc::clone(&lock).lock_owned().await;
        NamespaceGuard { locks: &self.locks, namespace: namespace.to_string(), lock, guard: Some(guard) }
    }

    /// The suspended run for `namespace`, discarding it if it has expired.
    fn load_pending(&self, namespace: &str) -> Result<Option<WorkflowRun>, IndexError> {
        let Some(checkpoint) = self.backends.checkpoints.load(namespace)? else {
            return Ok(None);
        };
        let run: WorkflowRun = serde_json::from_value(checkpoint.payload)
            .map_err(|e| IndexError::StoreFailure(format!("checkpoint for {namespace}: {e}")))?;
        if let Some(ttl) = self.run_ttl {
            if Utc::now() - run.updated_at > ttl {
                self.backends.checkpoints.delete(namespace)?;
                info!(namespace, run_id = %run.id, "pending run expired and was discarded");
                return Ok(None);
            }
        }
        Ok(Some(run))
    }

    /// Persist `run` if it is suspended, or clear the checkpoint if it has
    /// finished.
    fn persist(&self, namespace: &str, run: &WorkflowRun) -> Result<(), IndexError> {
        if run.is_finished() {
            self.backends.checkpoints.delete(namespace)?;
            info!(namespace, run_id = %run.id, refinements = run.refinements, "run finished");
        } else {
            let payload = serde_json::to_value(run)
                .map_err(|e| IndexError::StoreFailure(format!("serialize run: {e}")))?;
            self.backends.checkpoints.save(namespace, &payload)?;
            info!(namespace, run_id = %run.id, step = ?run.next, "run suspended for review");
        }
        Ok(())
    }

    /// Start a run for `namespace` over `data` and drive it to review.
    ///
    /// # Errors
    ///
    /// - [`IndexError::InvalidRequest`] if the namespace or data is empty, or
    ///   a run for the namespace is already awaiting review.
    /// - [`IndexError::GenerationFailure`] / [`IndexError::StoreFailure`]
    ///   from the generation transition; nothing is persisted in that case.
    pub async fn submit(&self, namespace: &str, data: Vec<WorkItem>) -> Result<RunOutcome, IndexError> {
        let ns = require_namespace(namespace)?;
        if data.is_empty() {
            return Err(IndexError::InvalidRequest("data batch is empty".into()));
        }
        let _guard = self.lock_namespace(ns).await;

        if let Some(pending) = self.load_pending(ns)? {
            return Err(IndexError::InvalidRequest(format!(
                "namespace {ns} already has run {} awaiting review",
                pending.id
            )));
        }

        let run = WorkflowRun::new(Some(ns.to_string()), Some(data));
        info!(namespace = ns, run_id = %run.id, items = run.state.data.as_ref().map_or(0, Vec::len), "run submitted");
        let run = self.engine.advance(run, None).await?;
        self.persist(ns, &run)?;
        Ok(run.outcome())
    }

    /// Apply the reviewer's decision to the suspended run for `namespace`.
    ///
    /// # Errors
    ///
    /// - [`IndexError::InvalidRequest`] if the payload has neither `approve`
    ///   nor `feedback`.
    /// - [`IndexError::NotFound`] if no run is awaiting review.
    /// - Transition failures; the checkpoint keeps the pre-resume state so the
    ///   same decision can be retried.
    pub async fn resume(&self, namespace: &str, input: ResumeInput) -> Result<RunOutcome, IndexError> {
        let ns = require_namespace(namespace)?;
        if input.is_empty() {
            return Err(IndexError::InvalidRequest(
                "resume requires `approve` or `feedback`".into(),
            ));
        }
        let _guard = self.lock_namespace(ns).await;

        let run = self
            .load_pending(ns)?
            .ok_or_else(|| IndexError::NotFound(format!("no run awaiting review for {ns}")))?;
        info!(namespace = ns, run_id = %run.id, approve = input.is_approval(), "run resumed");
        let run = self.engine.advance(run, Some(input)).await?;
        self.persist(ns, &run)?;
        Ok(run.outcome())
    }

    /// The review awaiting a decision for `namespace`, if any.
    pub async fn pending(&self, namespace: &str) -> Result<Option<ReviewRequest>, IndexError> {
        let ns = require_namespace(namespace)?;
        let _guard = self.lock_namespace(ns).await;
        Ok(self.load_pending(ns)?.and_then(|run| run.review_request()))
    }

    /// Namespaces that currently have a checkpointed run.
    pub fn pending_namespaces(&self) -> Result<Vec<String>, IndexError> {
        Ok(self.backends.checkpoints.thread_ids()?)
    }

    /// Discard the suspended run for `namespace`.  Returns `false` if there
    /// was none.
    pub async fn cancel(&self, namespace: &str) -> Result<bool, IndexError> {
        let ns = require_namespace(namespace)?;
        let _guard = self.lock_namespace(ns).await;
        let removed = self.backends.checkpoints.delete(ns)?;
        if removed {
            info!(namespace = ns, "pending run cancelled");
        }
        Ok(removed)
    }

    /// # Errors
    ///
    /// [`IndexError::NotFound`] if the namespace has no instructions yet.
    pub fn get_instructions(&self, namespace: &str) -> Result<String, IndexError> {
        let ns = require_namespace(namespace)?;
        self.instructions
            .get(ns)?
            .ok_or_else(|| IndexError::NotFound(format!("no instructions for {ns}")))
    }

    pub fn set_instructions(&self, namespace: &str, text: &str) -> Result<(), IndexError> {
        let ns = require_namespace(namespace)?;
        self.instructions.set(ns, text)?;
        info!(namespace = ns, chars = text.len(), "instructions overwritten");
        Ok(())
    }

    /// # Errors
    ///
    /// [`IndexError::NotFound`] if the namespace has no STM report yet.
    pub fn get_stm(&self, namespace: &str) -> Result<String, IndexError> {
        let ns = require_namespace(namespace)?;
        self.stm
            .get(ns)?
            .ok_or_else(|| IndexError::NotFound(format!("no STM report for {ns}")))
    }

    pub fn set_stm(&self, namespace: &str, text: &str) -> Result<(), IndexError> {
        let ns = require_namespace(namespace)?;
        self.stm.set(ns, text)?;
        info!(namespace = ns, chars = text.len(), "STM report overwritten");
        Ok(())
    }

    /// Episodes recorded for `namespace`, oldest first.
    pub fn episodes(&self, namespace: &str) -> Result<Vec<StoredEpisode>, IndexError> {
        let ns = require_namespace(namespace)?;
        Ok(self.episodic.all(ns)?)
    }

    /// Archive documents most relevant to `text`.  `limit` defaults to the
    /// configured top-k.
    pub fn query_archive(&self, text: &str, limit: Option<usize>) -> Result<Vec<ArchiveHit>, IndexError> {
        if text.trim().is_empty() {
            return Err(IndexError::InvalidRequest("archive query is empty".into()));
        }
        Ok(self.backends.archive.query(text, limit.unwrap_or(self.archive_top_k))?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use intellindex_memory::stm::SalienceCondenser;
    use intellindex_types::{ChatMessage, RunStatus};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FakeModel {
        fail: AtomicBool,
    }

    #[async_trait]
    impl Generator for FakeModel {
        async fn generate(&self, system: &str, history: &[ChatMessage]) -> Result<String, IndexError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(IndexError::GenerationFailure("model offline".into()));
            }
            if system.contains("matching this schema") {
                return Ok(r#"{"observation":"o","thoughts":"t","action":"a","result":"r"}"#.into());
            }
            if system.contains("<improved_prompt>") {
                return Ok("<improved_prompt>Be brief.</improved_prompt>".into());
            }
            Ok(format!("report after {} messages", history.len()))
        }
    }

    fn index_with(config: IndexConfig) -> (Arc<FakeModel>, IntelligentIndex) {
        let model = Arc::new(FakeModel::default());
        let backends = Backends::in_memory().unwrap();
        let deps = EngineDeps {
            report_llm: model.clone(),
            memory_llm: model.clone(),
            store: Arc::clone(&backends.store),
            archive: Arc::clone(&backends.archive),
        };
        let index = IntelligentIndex::with_engine(config, backends, |settings| {
            WorkflowEngine::new(deps, settings).with_condenser(Arc::new(SalienceCondenser))
        });
        (model, index)
    }

    fn index() -> (Arc<FakeModel>, IntelligentIndex) {
        index_with(IndexConfig::default())
    }

    fn batch() -> Vec<WorkItem> {
        vec![WorkItem::new("n1", "2025-05-01", "A")]
    }

    #[test]
    fn config_defaults() {
        let c = IndexConfig::default();
        assert_eq!(c.episodic_limit, 1);
        assert_eq!(c.archive_top_k, 5);
        assert_eq!(c.reflection_steps, 3);
        assert!(c.run_ttl_hours.is_none());
        assert!(c.db_path.is_none());
    }

    #[tokio::test]
    async fn submit_validates_inputs() {
        let (_, index) = index();
        let err = index.submit("  ", batch()).await.unwrap_err();
        assert!(matches!(err, IndexError::InvalidRequest(_)));
        let err = index.submit("n1", vec![]).await.unwrap_err();
        assert!(matches!(err, IndexError::InvalidRequest(_)));
        assert!(index.pending_namespaces().unwrap().is_empty());
    }

    #[tokio::test]
    async fn submit_suspends_and_checkpoints() {
        let (_, index) = index();
        let out = index.submit("n1", batch()).await.unwrap();
        assert_eq!(out.status, RunStatus::Waiting);
        assert_eq!(out.report(), Some("report after 1 messages"));
        assert_eq!(index.pending_namespaces().unwrap(), vec!["n1".to_string()]);
        let review = index.pending("n1").await.unwrap().unwrap();
        assert_eq!(review.report, "report after 1 messages");
    }

    #[tokio::test]
    async fn second_submit_while_pending_is_rejected() {
        let (_, index) = index();
        index.submit("n1", batch()).await.unwrap();
        let err = index.submit("n1", batch()).await.unwrap_err();
        assert!(matches!(err, IndexError::InvalidRequest(_)));
        // Other namespaces are unaffected.
        assert!(index.submit("n2", batch()).await.is_ok());
    }

    #[tokio::test]
    async fn resume_without_pending_run_is_not_found() {
        let (_, index) = index();
        let err = index.resume("n1", ResumeInput::approve()).await.unwrap_err();
        assert!(matches!(err, IndexError::NotFound(_)));
    }

    #[tokio::test]
    async fn empty_resume_payload_is_invalid() {
        let (_, index) = index();
        index.submit("n1", batch()).await.unwrap();
        let err = index.resume("n1", ResumeInput::default()).await.unwrap_err();
        assert!(err.is_client_error());
        assert!(index.pending("n1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn approval_finishes_run_and_clears_checkpoint() {
        let (_, index) = index();
        index.submit("n1", batch()).await.unwrap();
        let out = index.resume("n1", ResumeInput::approve()).await.unwrap();
        assert!(out.is_final());
        assert!(index.pending("n1").await.unwrap().is_none());
        assert!(matches!(index.get_stm("n1"), Err(IndexError::NotFound(_))));
        // A new run can start once the previous one is done.
        assert!(index.submit("n1", batch()).await.is_ok());
    }

    #[tokio::test]
    async fn failed_resume_keeps_checkpoint_for_retry() {
        let (model, index) = index();
        index.submit("n1", batch()).await.unwrap();
        index.resume("n1", ResumeInput::feedback("shorter")).await.unwrap();

        model.fail.store(true, Ordering::SeqCst);
        let err = index.resume("n1", ResumeInput::approve()).await.unwrap_err();
        assert_eq!(err.kind(), "generation_failure");
        assert!(index.pending("n1").await.unwrap().is_some());
        assert!(index.episodes("n1").unwrap().is_empty());

        model.fail.store(false, Ordering::SeqCst);
        let out = index.resume("n1", ResumeInput::approve()).await.unwrap();
        assert!(out.is_final());
        assert_eq!(index.episodes("n1").unwrap().len(), 1);
        assert_eq!(index.get_instructions("n1").unwrap(), "Be brief.");
        assert_eq!(index.query_archive("report", None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn namespace_locks_are_released_after_each_call() {
        let (_, index) = index();
        index.submit("n1", batch()).await.unwrap();
        index.submit("n2", vec![WorkItem::new("n2", "2025-05-01", "B")]).await.unwrap();
        index.pending("n1").await.unwrap();
        assert!(index.locks.lock().unwrap().is_empty());

        let (a, b) = tokio::join!(index.pending("n1"), index.resume("n1", ResumeInput::approve()));
        a.unwrap();
        b.unwrap();
        assert!(index.cancel("n2").await.unwrap());
        assert!(index.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_discards_pending_run() {
        let (_, index) = index();
        index.submit("n1", batch()).await.unwrap();
        assert!(index.cancel("n1").await.unwrap());
        assert!(!index.cancel("n1").await.unwrap());
        assert!(index.pending("n1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_pending_run_is_treated_as_absent() {
        let config = IndexConfig { run_ttl_hours: Some(1), ..IndexConfig::default() };
        let (_, index) = index_with(config);
        index.submit("n1", batch()).await.unwrap();

        // Age the checkpoint past the TTL.
        let cp = index.backends.checkpoints.load("n1").unwrap().unwrap();
        let mut run: WorkflowRun = serde_json::from_value(cp.payload).unwrap();
        run.updated_at = Utc::now() - Duration::hours(2);
        index
            .backends
            .checkpoints
            .save("n1", &serde_json::to_value(&run).unwrap())
            .unwrap();

        let err = index.resume("n1", ResumeInput::approve()).await.unwrap_err();
        assert!(matches!(err, IndexError::NotFound(_)));
        assert!(index.submit("n1", batch()).await.is_ok());
    }

    #[tokio::test]
    async fn accessors_read_and_overwrite_tiers() {
        let (_, index) = index();
        assert!(matches!(index.get_instructions("n1"), Err(IndexError::NotFound(_))));
        index.set_instructions("n1", "custom").unwrap();
        assert_eq!(index.get_instructions("n1").unwrap(), "custom");
        index.set_stm("n1", "# Short-Term Report").unwrap();
        assert_eq!(index.get_stm("n1").unwrap(), "# Short-Term Report");
        assert!(matches!(index.query_archive(" ", None), Err(IndexError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn submit_uses_instructions_set_through_accessor() {
        let (_, index) = index();
        index.set_instructions("n1", "custom").unwrap();
        index.submit("n1", batch()).await.unwrap();
        assert_eq!(index.get_instructions("n1").unwrap(), "custom");
    }
}
