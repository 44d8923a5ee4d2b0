//! Model discovery.
//!
//! Pings the configured model server and, if it is an Ollama instance, lists
//! the locally downloaded models from its `/api/tags` endpoint.

use serde::Deserialize;

/// A single model entry returned by Ollama's `/api/tags` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct OllamaModel {
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<OllamaModel>,
}

/// Ping the server and return the list of available models.
///
/// Returns `Err(reason)` when the server is offline, unreachable, or not an
/// Ollama instance.
pub fn fetch_models(base_url: &str) -> Result<Vec<OllamaModel>, String> {
    let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(3))
        .build()
        .map_err(|e| format!("HTTP client error: {}", e))?;
    let response = client
        .get(&url)
        .send()
        .map_err(|e| format!("Model server unreachable at {}: {}", url, e))?;

    if !response.status().is_success() {
        return Err(format!("Model server returned HTTP {}", response.status()));
    }

    parse_tags(&response.text().map_err(|e| format!("Failed to read response: {}", e))?)
}

fn parse_tags(body: &str) -> Result<Vec<OllamaModel>, String> {
    let tags: TagsResponse = serde_json::from_str(body)
        .map_err(|e| format!("Failed to parse model list: {}", e))?;
    Ok(tags.models)
}
