//! Instruction optimization.
//!
//! After a feedback-driven run is approved, the namespace's instructions are
//! revised so the next first draft needs fewer corrections.
//! [`MetapromptOptimizer`] asks the memory model to reflect on the accepted
//! trajectory and propose a rewritten prompt, repeating for a bounded number
//! of rounds until the proposal stops changing.

use std::sync::Arc;

use async_trait::async_trait;
use intellindex_types::{ChatMessage, Generator, IndexError, Role};
use tracing::{debug, info, warn};

const IMPROVED_OPEN: &str = "<improved_prompt>";
const IMPROVED_CLOSE: &str = "</improved_prompt>";

const METAPROMPT_SYSTEM: &str = "\
You are helping an AI assistant learn by optimizing its system prompt.
You will be given the current prompt, one or more conversations produced \
under it, and the reviewer feedback each conversation received.
Analyse what the reviewer had to correct and why. Then write an improved \
prompt that would have produced the accepted result on the first attempt.
Keep everything in the current prompt that still applies; do not add rules \
that are specific to a single data batch.
Return the complete improved prompt between <improved_prompt> and \
</improved_prompt> tags.";

/// One accepted message log together with the feedback that shaped it.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    pub messages: Vec<ChatMessage>,
    pub feedback: Option<String>,
}

impl Trajectory {
    pub fn new(messages: Vec<ChatMessage>, feedback: Option<String>) -> Self {
        Self { messages, feedback }
    }
}

/// Rewrites instructions in light of accepted trajectories.
#[async_trait]
pub trait InstructionOptimizer: Send + Sync {
    /// Return the instructions to store next.  Returning `current` unchanged
    /// is a valid outcome.
    async fn optimize(&self, current: &str, trajectories: &[Trajectory]) -> Result<String, IndexError>;
}

/// Reflection-loop optimizer driven by a [`Generator`].
pub struct MetapromptOptimizer {
    llm: Arc<dyn Generator>,
    max_reflection_steps: usize,
}

impl MetapromptOptimizer {
    pub const DEFAULT_REFLECTION_STEPS: usize = 3;

    pub fn new(llm: Arc<dyn Generator>) -> Self {
        Self { llm, max_reflection_steps: Self::DEFAULT_REFLECTION_STEPS }
    }

    pub fn with_reflection_steps(mut self, steps: usize) -> Self {
        self.max_reflection_steps = steps.max(1);
        self
    }

    fn render_request(current: &str, trajectories: &[Trajectory], previous: Option<&str>) -> String {
        let mut out = format!("## Current prompt\n{current}\n");
        for (i, t) in trajectories.iter().enumerate() {
            out.push_str(&format!("\n## Conversation {}\n", i + 1));
            for m in &t.messages {
                let who = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                out.push_str(&format!("[{who}] {}\n", m.content));
            }
            if let Some(feedback) = t.feedback.as_deref().filter(|f| !f.is_empty()) {
                out.push_str(&format!("Feedback: {feedback}\n"));
            }
        }
        if let Some(candidate) = previous {
            out.push_str(&format!(
                "\n## Your previous proposal\n{candidate}\n\n\
                 Reflect on the proposal. If it can be improved, return a better one; \
                 otherwise return it unchanged."
            ));
        }
        out
    }
}

/// Text between the first `<improved_prompt>` and the following close tag,
/// trimmed.  `None` if the tags are missing or the content is blank.
pub fn extract_improved_prompt(reply: &str) -> Option<String> {
    let start = reply.find(IMPROVED_OPEN)? + IMPROVED_OPEN.len();
    let rest = &reply[start..];
    let end = rest.find(IMPROVED_CLOSE)?;
    let text = rest[..end].trim();
    (!text.is_empty()).then(|| text.to_string())
}

#[async_trait]
impl InstructionOptimizer for MetapromptOptimizer {
    async fn optimize(&self, current: &str, trajectories: &[Trajectory]) -> Result<String, IndexError> {
        if trajectories.is_empty() {
            return Ok(current.to_string());
        }
        let mut candidate: Option<String> = None;
        for step in 0..self.max_reflection_steps {
            let request = Self::render_request(current, trajectories, candidate.as_deref());
            let reply = self
                .llm
                .generate(METAPROMPT_SYSTEM, &[ChatMessage::user(request)])
                .await?;
            match extract_improved_prompt(&reply) {
                None => {
                    warn!(step, "optimizer reply had no improved prompt");
                    break;
                }
                Some(next) if candidate.as_deref() == Some(next.as_str()) => {
                    debug!(step, "optimizer converged");
                    break;
                }
                Some(next) => candidate = Some(next),
            }
        }
        let result = candidate.unwrap_or_else(|| current.to_string());
        info!(changed = result != current, "instruction optimization finished");
        Ok(result)
    }
}
