//! [`LlmDriver`] – OpenAI-compatible generation client.
//!
//! Communicates with any model server that exposes an OpenAI-compatible
//! `/v1/chat/completions` endpoint, such as [Ollama](https://ollama.com)
//! (`http://localhost:11434`) or a hosted provider reached with an API key.
//!
//! The driver implements [`Generator`], so the workflow engine and the memory
//! tiers only ever see the opaque `generate(system, history)` capability.
//!
//! # Example
//!
//! ```rust,no_run
//! use intellindex_runtime::llm_driver::LlmDriver;
//! use intellindex_types::{ChatMessage, Generator};
//!
//! # async fn demo() -> Result<(), intellindex_types::IndexError> {
//! let driver = LlmDriver::new("http://localhost:11434", "llama3");
//! let reply = driver
//!     .generate("You are a concise analyst.", &[ChatMessage::user("Summarise: A")])
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use intellindex_types::{ChatMessage, Generator, IndexError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Upper bound on a single completion request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from LLM driver operations.
#[derive(Error, Debug)]
pub enum LlmError {
    /// The HTTP request to the model server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The response from the model server could not be parsed.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
}

impl From<LlmError> for IndexError {
    fn from(e: LlmError) -> Self {
        IndexError::GenerationFailure(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal request / response shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmDriver
// ─────────────────────────────────────────────────────────────────────────────

/// An async client for an OpenAI-compatible chat-completions endpoint.
///
/// Construct once per model and share behind an `Arc`.
#[derive(Clone)]
pub struct LlmDriver {
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: Option<f32>,
    client: reqwest::Client,
}

impl std::fmt::Debug for LlmDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmDriver")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[redacted]"))
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl LlmDriver {
    /// Create a new driver pointing at `base_url` (e.g. `"http://localhost:11434"`)
    /// and using `model` (e.g. `"llama3"`).
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            temperature: None,
            client,
        }
    }

    /// Send `Authorization: Bearer <key>` with every request.
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send `messages` to the model and return the assistant's reply text.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Http`] if the request fails, or
    /// [`LlmError::BadResponse`] if the response shape is unexpected.
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
            temperature: self.temperature,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        debug!(model = %self.model, messages = messages.len(), "chat completion request");
        let response: ChatResponse = request.send().await?.error_for_status()?.json().await?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::BadResponse("empty choices array".into()))
    }
}

/// Prepend `system` to `history` as a system-role message.
pub fn build_messages(system: &str, history: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ChatMessage::system(system));
    messages.extend_from_slice(history);
    messages
}

#[async_trait]
impl Generator for LlmDriver {
    async fn generate(&self, system: &str, history: &[ChatMessage]) -> Result<String, IndexError> {
        Ok(self.complete(&build_messages(system, history)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use intellindex_types::Role;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one HTTP request with a fixed status and body, returning the raw
    /// request text.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if raw.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&raw).to_string()
        });
        (url, handle)
    }

    #[test]
    fn build_messages_prepends_system() {
        let history = vec![ChatMessage::user("data"), ChatMessage::assistant("report")];
        let messages = build_messages("be brief", &history);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "be brief");
        assert_eq!(messages[2].content, "report");
    }

    #[test]
    fn request_body_omits_unset_temperature() {
        let messages = vec![ChatMessage::user("hi")];
        let body = ChatRequest { model: "m", messages: &messages, stream: false, temperature: None };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("temperature").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let driver = LlmDriver::new("http://localhost:11434/", "llama3");
        assert_eq!(driver.base_url(), "http://localhost:11434");
    }

    #[test]
    fn debug_redacts_api_key() {
        let driver = LlmDriver::new("http://x", "m").with_api_key(Some("sk-secret".into()));
        let dbg = format!("{driver:?}");
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("[redacted]"));
    }

    #[test]
    fn llm_error_maps_to_generation_failure() {
        let err: IndexError = LlmError::BadResponse("nope".into()).into();
        assert_eq!(err.kind(), "generation_failure");
    }

    #[tokio::test]
    async fn generate_returns_first_choice_and_sends_bearer_token() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"choices":[{"message":{"role":"assistant","content":"the report"}}]}"#,
        )
        .await;
        let driver = LlmDriver::new(url, "llama3").with_api_key(Some("k123".into()));
        let reply = driver.generate("sys", &[ChatMessage::user("data")]).await.unwrap();
        assert_eq!(reply, "the report");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/chat/completions"));
        assert!(request.to_lowercase().contains("authorization: bearer k123"));
        assert!(request.contains("\"model\":\"llama3\""));
    }

    #[tokio::test]
    async fn server_error_is_generation_failure() {
        let (url, server) = serve_once("500 Internal Server Error", "{}").await;
        let driver = LlmDriver::new(url, "llama3");
        let err = driver.generate("sys", &[]).await.unwrap_err();
        assert!(matches!(err, IndexError::GenerationFailure(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn empty_choices_is_bad_response() {
        let (url, server) = serve_once("200 OK", r#"{"choices":[]}"#).await;
        let driver = LlmDriver::new(url, "llama3");
        let err = driver.complete(&[ChatMessage::user("x")]).await.unwrap_err();
        assert!(matches!(err, LlmError::BadResponse(_)));
        server.await.unwrap();
    }
}
