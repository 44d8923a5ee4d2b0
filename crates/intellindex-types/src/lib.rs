//! `intellindex-types` – shared vocabulary for the Intelligent Index.
//!
//! Every other crate in the workspace speaks in these types:
//!
//! - [`WorkItem`] – one dated record of raw event data submitted for a
//!   generation cycle.
//! - [`ChatMessage`] / [`Role`] – the append-only conversation log carried by
//!   a workflow run.
//! - [`Episode`] – the hindsight record of a feedback-driven run, used to
//!   condition future report generation.
//! - [`ResumeInput`] – the reviewer's decision that resumes a suspended run.
//! - [`RunOutcome`] / [`ReviewRequest`] – what `submit` and `resume` return.
//! - [`Generator`] – the opaque language-generation capability.
//! - [`IndexError`] – the workspace-wide error type.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Partition key isolating one workflow lineage's data and memory.
pub type Namespace = String;

// ─────────────────────────────────────────────────────────────────────────────
// Work items
// ─────────────────────────────────────────────────────────────────────────────

/// A single dated record of raw event data.
///
/// All fields are optional on the wire; missing ones render as `N/A` when the
/// batch is formatted for the model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl WorkItem {
    pub fn new(
        namespace: impl Into<String>,
        date: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            namespace: Some(namespace.into()),
            date: Some(date.into()),
            content: Some(content.into()),
        }
    }
}

/// Render a batch of work items into the structured block layout the report
/// model is prompted with.
pub fn format_work_items(items: &[WorkItem]) -> String {
    items
        .iter()
        .map(|item| {
            format!(
                "Namespace: {}\nDate: {}\nContents:\n{}\n",
                item.namespace.as_deref().unwrap_or("N/A"),
                item.date.as_deref().unwrap_or("N/A"),
                item.content.as_deref().unwrap_or("N/A"),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversation log
// ─────────────────────────────────────────────────────────────────────────────

/// The role of a participant in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Episodes
// ─────────────────────────────────────────────────────────────────────────────

/// Write the episode from the perspective of the agent within it. Use the
/// benefit of hindsight to record the memory, saving the agent's key internal
/// thought process so it can learn over time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Episode {
    /// The context and setup - what happened.
    pub observation: String,
    /// Internal reasoning process and observations of the agent in the
    /// episode that let it arrive at the correct action and result. "I ..."
    pub thoughts: String,
    /// What was done, how, and in what format. (Include whatever is salient
    /// to the success of the action). "I ..."
    pub action: String,
    /// Outcome and retrospective. What did you do well? What could you do
    /// better next time? "I ..."
    pub result: String,
}

/// An [`Episode`] as persisted under a namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEpisode {
    pub id: Uuid,
    pub namespace: Namespace,
    pub recorded_at: DateTime<Utc>,
    pub episode: Episode,
}

// ─────────────────────────────────────────────────────────────────────────────
// Resume payload
// ─────────────────────────────────────────────────────────────────────────────

/// The reviewer's decision at the approval suspension point.
///
/// `approve: Some(true)` wins over any `feedback` supplied alongside it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approve: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl ResumeInput {
    pub fn approve() -> Self {
        Self { approve: Some(true), feedback: None }
    }

    pub fn feedback(text: impl Into<String>) -> Self {
        Self { approve: None, feedback: Some(text.into()) }
    }

    /// `true` when the reviewer approved the report.
    pub fn is_approval(&self) -> bool {
        self.approve.unwrap_or(false)
    }

    /// `true` when neither field was supplied.
    pub fn is_empty(&self) -> bool {
        self.approve.is_none() && self.feedback.is_none()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Run outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// Whether a run is suspended for review or has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Waiting,
    Final,
}

/// What a suspended run surfaces to the reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub question: String,
    pub report: String,
}

/// Result of a `submit` or `resume` call.
///
/// Exactly one of `pending_question` (while waiting) and `result` (once
/// final) is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_question: Option<ReviewRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl RunOutcome {
    pub fn waiting(review: ReviewRequest) -> Self {
        Self { status: RunStatus::Waiting, pending_question: Some(review), result: None }
    }

    pub fn finished(report: impl Into<String>) -> Self {
        Self { status: RunStatus::Final, pending_question: None, result: Some(report.into()) }
    }

    /// The report currently associated with the run, draft or final.
    pub fn report(&self) -> Option<&str> {
        self.result
            .as_deref()
            .or_else(|| self.pending_question.as_ref().map(|q| q.report.as_str()))
    }

    pub fn is_final(&self) -> bool {
        self.status == RunStatus::Final
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Generation capability
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque language-generation capability.
///
/// Implementations must map every transport or model failure to
/// [`IndexError::GenerationFailure`]; callers never retry.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate a reply to `history` under `system` instructions.
    async fn generate(&self, system: &str, history: &[ChatMessage]) -> Result<String, IndexError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Workspace-wide error type.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexError {
    /// The request is missing the fields its operation requires.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The generation capability failed.
    #[error("Generation failure: {0}")]
    GenerationFailure(String),

    /// A memory-tier read or write failed.
    #[error("Store failure: {0}")]
    StoreFailure(String),

    /// A directly-read item does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl IndexError {
    /// Stable machine-readable kind label.
    pub fn kind(&self) -> &'static str {
        match self {
            IndexError::InvalidRequest(_) => "invalid_request",
            IndexError::GenerationFailure(_) => "generation_failure",
            IndexError::StoreFailure(_) => "store_failure",
            IndexError::NotFound(_) => "not_found",
        }
    }

    /// `true` for errors caused by the caller (4xx), `false` for internal or
    /// upstream failures (5xx).
    pub fn is_client_error(&self) -> bool {
        matches!(self, IndexError::InvalidRequest(_) | IndexError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_work_items_renders_blocks() {
        let items = vec![
            WorkItem::new("n1", "2025-05-01", "A"),
            WorkItem::new("n1", "2025-05-02", "B"),
        ];
        let text = format_work_items(&items);
        assert_eq!(
            text,
            "Namespace: n1\nDate: 2025-05-01\nContents:\nA\n\nNamespace: n1\nDate: 2025-05-02\nContents:\nB\n"
        );
    }

    #[test]
    fn format_work_items_uses_na_for_missing_fields() {
        let text = format_work_items(&[WorkItem::default()]);
        assert!(text.contains("Namespace: N/A"));
        assert!(text.contains("Date: N/A"));
        assert!(text.contains("Contents:\nN/A"));
    }

    #[test]
    fn run_outcome_serializes_lowercase_status_and_skips_absent_fields() {
        let waiting = RunOutcome::waiting(ReviewRequest {
            question: "Approve?".to_string(),
            report: "draft".to_string(),
        });
        let json = serde_json::to_value(&waiting).unwrap();
        assert_eq!(json["status"], "waiting");
        assert_eq!(json["pending_question"]["report"], "draft");
        assert!(json.get("result").is_none());
        assert_eq!(waiting.report(), Some("draft"));

        let done = RunOutcome::finished("final text");
        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["status"], "final");
        assert!(json.get("pending_question").is_none());
        assert!(done.is_final());
    }

    #[test]
    fn work_item_deserializes_with_missing_fields() {
        let item: WorkItem = serde_json::from_str(r#"{"date":"2025-05-01","content":"A"}"#).unwrap();
        assert_eq!(item.namespace, None);
        assert_eq!(item.content.as_deref(), Some("A"));
    }

    #[test]
    fn chat_message_serializes_role_lowercase() {
        let json = serde_json::to_string(&ChatMessage::assistant("hi")).unwrap();
        assert!(json.contains("\"assistant\""));
    }

    #[test]
    fn resume_input_approval_semantics() {
        assert!(ResumeInput::approve().is_approval());
        assert!(!ResumeInput::feedback("x").is_approval());
        assert!(ResumeInput::default().is_empty());

        let both = ResumeInput { approve: Some(true), feedback: Some("ignored".into()) };
        assert!(both.is_approval());

        let declined = ResumeInput { approve: Some(false), feedback: None };
        assert!(!declined.is_approval());
        assert!(!declined.is_empty());
    }

    #[test]
    fn episode_schema_describes_all_fields() {
        let schema = serde_json::to_string(&schemars::schema_for!(Episode)).unwrap();
        for field in ["observation", "thoughts", "action", "result"] {
            assert!(schema.contains(field), "schema missing {field}");
        }
    }

    #[test]
    fn index_error_kinds_and_classes() {
        assert_eq!(IndexError::InvalidRequest("x".into()).kind(), "invalid_request");
        assert_eq!(IndexError::NotFound("x".into()).kind(), "not_found");
        assert!(IndexError::InvalidRequest("x".into()).is_client_error());
        assert!(IndexError::NotFound("x".into()).is_client_error());
        assert!(!IndexError::GenerationFailure("x".into()).is_client_error());
        assert!(!IndexError::StoreFailure("x".into()).is_client_error());
        assert!(IndexError::StoreFailure("disk full".into()).to_string().contains("disk full"));
    }
}
