//! [`WorkflowEngine`] – the report workflow state machine.
//!
//! One run turns a batch of [`WorkItem`]s into a reviewed report:
//!
//! ```text
//!  GenerateReport ──▶ HumanApproval ──approve──▶ FinalizeReport ──▶ Done
//!                        ▲      │
//!                        │   feedback
//!                        │      ▼
//!                       RefineReport
//! ```
//!
//! 1. **GenerateReport** – reads the namespace's instructions (created with a
//!    default on first use), its STM report and the most relevant prior
//!    episode, and asks the report model for a draft.  No memory tier is
//!    written.
//! 2. **HumanApproval** – the suspension point.  Without a [`ResumeInput`]
//!    the engine stops and the caller persists the [`WorkflowRun`].
//! 3. **RefineReport** – regenerates the report from the message log under a
//!    fixed refinement prompt.  Always returns to HumanApproval.
//! 4. **FinalizeReport** – when the run went through a refinement, records an
//!    episode, re-optimizes the instructions, consolidates STM, and archives
//!    the report.  A run approved on the first pass touches nothing.
//!
//! # Persisted-state machine
//!
//! [`WorkflowEngine::step`] maps `(run, input)` to the next run without
//! mutating its argument, so a failed transition leaves the caller holding
//! the last good state.  [`WorkflowEngine::advance`] repeats `step` until the
//! run suspends or finishes.
//!
//! # Finalize commit order
//!
//! Everything is computed before anything is written.  The archive insert
//! goes first because it is idempotent, then the episode, instructions, and
//! STM report are committed in one store transaction.  A failure anywhere
//! before that transaction leaves every memory tier as it was.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use intellindex_memory::archive::LongTermArchive;
use intellindex_memory::episodic::{EpisodeExtractor, EpisodicMemory, render_episodic_context};
use intellindex_memory::instructions::{DEFAULT_INSTRUCTIONS, InstructionStore};
use intellindex_memory::stm::{Condenser, GenerativeCondenser, RollupPolicy, ShortTermMemory, StmConsolidator};
use intellindex_memory::store::KeyedStore;
use intellindex_types::{
    ChatMessage, Generator, IndexError, ResumeInput, ReviewRequest, RunOutcome, WorkItem,
    format_work_items,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::optimizer::{InstructionOptimizer, MetapromptOptimizer, Trajectory};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Question surfaced to the reviewer at every suspension.
pub const REVIEW_QUESTION: &str = "Approve to finalize or provide feedback for refinement.";

/// System prompt for refinement; independent of namespace instructions.
pub const REFINE_SYSTEM_PROMPT: &str = "The following report needs refinement based on the feedback provided.\n\
Please provide a refined version of the report.";

/// Log message recorded for reviewer feedback.
pub fn feedback_message(feedback: &str) -> String {
    format!("Report needs refinement. Feedback: {feedback}")
}

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

/// The transition a run will execute next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    GenerateReport,
    HumanApproval,
    RefineReport,
    FinalizeReport,
    /// FinalizeReport has run; nothing remains.
    Done,
}

/// Data carried by one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub namespace: Option<String>,
    pub data: Option<Vec<WorkItem>>,
    /// Append-only conversation log.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub report: Option<String>,
    pub feedback: Option<String>,
}

impl WorkflowState {
    /// `true` when the inputs GenerateReport needs are present.
    pub fn has_inputs(&self) -> bool {
        self.namespace.as_deref().is_some_and(|ns| !ns.trim().is_empty())
            && self.data.as_ref().is_some_and(|d| !d.is_empty())
    }
}

/// A run plus its position in the state machine.  This is what gets
/// checkpointed at the suspension point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub state: WorkflowState,
    pub next: Step,
    /// Number of refinement cycles completed.
    #[serde(default)]
    pub refinements: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(namespace: Option<String>, data: Option<Vec<WorkItem>>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            state: WorkflowState { namespace, data, ..WorkflowState::default() },
            next: Step::GenerateReport,
            refinements: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn namespace(&self) -> &str {
        self.state.namespace.as_deref().unwrap_or_default()
    }

    pub fn is_finished(&self) -> bool {
        self.next == Step::Done
    }

    /// `true` once the reviewer has sent the run back for at least one
    /// refinement, even with empty feedback.
    pub fn was_refined(&self) -> bool {
        self.refinements > 0 || self.state.feedback.is_some()
    }

    pub fn is_awaiting_review(&self) -> bool {
        self.next == Step::HumanApproval
    }

    /// What the reviewer sees, when the run is suspended.
    pub fn review_request(&self) -> Option<ReviewRequest> {
        self.is_awaiting_review().then(|| ReviewRequest {
            question: REVIEW_QUESTION.to_string(),
            report: self.state.report.clone().unwrap_or_default(),
        })
    }

    pub fn outcome(&self) -> RunOutcome {
        match self.review_request() {
            Some(review) => RunOutcome::waiting(review),
            None => RunOutcome::finished(self.state.report.clone().unwrap_or_default()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Tunables for [`WorkflowEngine`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Instructions written for a namespace on first use.
    pub default_instructions: String,
    /// Prior episodes inlined into the generation context.
    pub episodic_limit: usize,
    /// Reflection rounds for the default instruction optimizer.
    pub reflection_steps: usize,
    pub rollup: RollupPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_instructions: DEFAULT_INSTRUCTIONS.to_string(),
            episodic_limit: 1,
            reflection_steps: MetapromptOptimizer::DEFAULT_REFLECTION_STEPS,
            rollup: RollupPolicy::default(),
        }
    }
}

/// External handles the engine is built from.
#[derive(Clone)]
pub struct EngineDeps {
    /// Model used for GenerateReport and RefineReport.
    pub report_llm: Arc<dyn Generator>,
    /// Model used for STM condensation, episode extraction and optimization.
    pub memory_llm: Arc<dyn Generator>,
    pub store: Arc<dyn KeyedStore>,
    pub archive: Arc<dyn LongTermArchive>,
}

// ─────────────────────────────────────────────────────────────────────────────
// WorkflowEngine
// ─────────────────────────────────────────────────────────────────────────────

pub struct WorkflowEngine {
    report_llm: Arc<dyn Generator>,
    store: Arc<dyn KeyedStore>,
    archive: Arc<dyn LongTermArchive>,
    instructions: InstructionStore,
    stm: ShortTermMemory,
    episodic: EpisodicMemory,
    extractor: EpisodeExtractor,
    optimizer: Arc<dyn InstructionOptimizer>,
    consolidator: StmConsolidator,
    settings: EngineSettings,
}

impl WorkflowEngine {
    pub fn new(deps: EngineDeps, settings: EngineSettings) -> Self {
        let optimizer = MetapromptOptimizer::new(Arc::clone(&deps.memory_llm))
            .with_reflection_steps(settings.reflection_steps);
        let condenser: Arc<dyn Condenser> = Arc::new(GenerativeCondenser::new(Arc::clone(&deps.memory_llm)));
        Self {
            instructions: InstructionStore::new(Arc::clone(&deps.store)),
            stm: ShortTermMemory::new(Arc::clone(&deps.store)),
            episodic: EpisodicMemory::new(Arc::clone(&deps.store)),
            extractor: EpisodeExtractor::new(deps.memory_llm),
            optimizer: Arc::new(optimizer),
            consolidator: StmConsolidator::new(settings.rollup.clone(), condenser),
            report_llm: deps.report_llm,
            store: deps.store,
            archive: deps.archive,
            settings,
        }
    }

    /// Replace the instruction optimizer (builder-style).
    pub fn with_optimizer(mut self, optimizer: Arc<dyn InstructionOptimizer>) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Replace the STM condenser (builder-style).
    pub fn with_condenser(mut self, condenser: Arc<dyn Condenser>) -> Self {
        self.consolidator = StmConsolidator::new(self.settings.rollup.clone(), condenser);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Run transitions until the run suspends at HumanApproval or finishes.
    ///
    /// `input` is consumed by the first HumanApproval reached; the next one
    /// suspends.  A run whose GenerateReport inputs are missing is returned
    /// unchanged.
    pub async fn advance(
        &self,
        mut run: WorkflowRun,
        mut input: Option<ResumeInput>,
    ) -> Result<WorkflowRun, IndexError> {
        loop {
            match run.next {
                Step::Done => return Ok(run),
                Step::HumanApproval if input.is_none() => return Ok(run),
                Step::GenerateReport if !run.state.has_inputs() => {
                    warn!(run_id = %run.id, "generate requested without namespace or data; run left unchanged");
                    return Ok(run);
                }
                _ => {}
            }
            let resume = if run.next == Step::HumanApproval { input.take() } else { None };
            run = self.step(&run, resume.as_ref()).await?;
        }
    }

    /// Execute the single transition `run.next`, returning the resulting run.
    ///
    /// HumanApproval without `input` and a finished run are returned
    /// unchanged.
    #[instrument(skip_all, fields(run_id = %run.id, namespace = %run.namespace(), step = ?run.next))]
    pub async fn step(
        &self,
        run: &WorkflowRun,
        input: Option<&ResumeInput>,
    ) -> Result<WorkflowRun, IndexError> {
        let mut next = run.clone();
        match run.next {
            Step::GenerateReport => self.generate_report(&mut next).await?,
            Step::HumanApproval => match input {
                Some(input) => Self::human_approval(&mut next, input),
                None => return Ok(next),
            },
            Step::RefineReport => self.refine_report(&mut next).await?,
            Step::FinalizeReport => self.finalize_report(&mut next).await?,
            Step::Done => return Ok(next),
        }
        next.updated_at = Utc::now();
        info!(from = ?run.next, to = ?next.next, "workflow transition");
        Ok(next)
    }

    async fn generate_report(&self, run: &mut WorkflowRun) -> Result<(), IndexError> {
        if !run.state.has_inputs() {
            return Ok(());
        }
        let namespace = run.namespace().to_string();
        let data = run.state.data.clone().unwrap_or_default();

        let instructions = self
            .instructions
            .get_or_default(&namespace, &self.settings.default_instructions)?;
        let stm = self.stm.get_or_empty(&namespace)?;
        let formatted = format_work_items(&data);

        let query = format!("Instructions: {instructions}\n\nData:\n{formatted}");
        let episodes = self.episodic.retrieve(&namespace, &query, self.settings.episodic_limit)?;
        debug!(namespace = %namespace, episodes = episodes.len(), stm_chars = stm.len(), "generation context loaded");

        let mut system = instructions;
        if !stm.is_empty() {
            system.push_str("\n\nShort Term Memory: ");
            system.push_str(&stm);
        }
        system.push_str(&render_episodic_context(&episodes));

        let user = ChatMessage::user(formatted);
        let report = self.report_llm.generate(&system, std::slice::from_ref(&user)).await?;

        run.state.messages.push(user);
        run.state.messages.push(ChatMessage::assistant(report.clone()));
        run.state.report = Some(report);
        run.next = Step::HumanApproval;
        Ok(())
    }

    fn human_approval(run: &mut WorkflowRun, input: &ResumeInput) {
        if input.is_approval() {
            run.next = Step::FinalizeReport;
            return;
        }
        let feedback = input.feedback.clone().unwrap_or_default();
        run.state.messages.push(ChatMessage::user(feedback_message(&feedback)));
        run.state.feedback = Some(feedback);
        run.next = Step::RefineReport;
    }

    async fn refine_report(&self, run: &mut WorkflowRun) -> Result<(), IndexError> {
        let report = self
            .report_llm
            .generate(REFINE_SYSTEM_PROMPT, &run.state.messages)
            .await?;
        run.state.messages.push(ChatMessage::assistant(report.clone()));
        run.state.report = Some(report);
        run.refinements += 1;
        run.next = Step::HumanApproval;
        Ok(())
    }

    async fn finalize_report(&self, run: &mut WorkflowRun) -> Result<(), IndexError> {
        if !run.was_refined() {
            info!("approved on the first pass; memory tiers untouched");
            run.next = Step::Done;
            return Ok(());
        }
        let namespace = run.namespace().to_string();
        if namespace.trim().is_empty() {
            return Err(IndexError::InvalidRequest("finalize requires a namespace".into()));
        }
        let report = run.state.report.clone().unwrap_or_default();
        let messages = run.state.messages.clone();

        let episode = self.extractor.extract(&messages).await?;

        let current = self
            .instructions
            .get_or_default(&namespace, &self.settings.default_instructions)?;
        let trajectory = Trajectory::new(messages, run.state.feedback.clone().filter(|f| !f.is_empty()));
        let improved = self.optimizer.optimize(&current, &[trajectory]).await?;

        let current_stm = self.stm.get_or_empty(&namespace)?;
        let new_stm = self.consolidator.update(&namespace, &current_stm, &report).await?;

        let document_id = self.archive.insert(&namespace, &report)?;
        let (episode_id, episode_write) = EpisodicMemory::record_write(&namespace, &episode);
        self.store.put_batch(&[
            episode_write,
            InstructionStore::write(&namespace, &improved),
            ShortTermMemory::write(&namespace, &new_stm),
        ])?;
        info!(
            namespace = %namespace,
            episode_id = %episode_id,
            document_id = %document_id,
            instructions_changed = improved != current,
            stm_chars = new_stm.len(),
            "memory tiers committed"
        );

        run.state.messages.push(ChatMessage::assistant(format!("New STM:\n{new_stm}")));
        run.next = Step::Done;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
