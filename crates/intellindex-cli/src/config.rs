//! Configuration Vault – reads/writes `~/.intellindex/config.toml`.

use intellindex_runtime::IndexConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Persisted user configuration stored in `~/.intellindex/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the OpenAI-compatible model server.
    #[serde(default = "default_llm_url")]
    pub llm_url: String,

    /// Model used to draft and refine reports.
    #[serde(default = "default_model")]
    pub report_model: String,

    /// Model used for STM condensation, episode extraction and instruction
    /// optimization.
    #[serde(default = "default_model")]
    pub memory_model: String,

    /// Bearer token for hosted model servers (stored as plain text; the file
    /// is written owner-only).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,

    /// SQLite database holding every memory tier and pending run.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_episodic_limit")]
    pub episodic_limit: usize,

    #[serde(default = "default_archive_top_k")]
    pub archive_top_k: usize,

    #[serde(default = "default_reflection_steps")]
    pub reflection_steps: usize,

    /// Discard runs left awaiting review for longer than this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_ttl_hours: Option<u64>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("llm_url", &self.llm_url)
            .field("report_model", &self.report_model)
            .field("memory_model", &self.memory_model)
            .field(
                "api_key",
                if self.api_key.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("db_path", &self.db_path)
            .field("episodic_limit", &self.episodic_limit)
            .field("archive_top_k", &self.archive_top_k)
            .field("reflection_steps", &self.reflection_steps)
            .field("run_ttl_hours", &self.run_ttl_hours)
            .finish()
    }
}

fn default_llm_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_model() -> String {
    "llama3".to_string()
}
fn default_db_path() -> String {
    config_dir().join("index.db").to_string_lossy().into_owned()
}
fn default_episodic_limit() -> usize {
    1
}
fn default_archive_top_k() -> usize {
    5
}
fn default_reflection_steps() -> usize {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm_url: default_llm_url(),
            report_model: default_model(),
            memory_model: default_model(),
            api_key: String::new(),
            db_path: default_db_path(),
            episodic_limit: default_episodic_limit(),
            archive_top_k: default_archive_top_k(),
            reflection_steps: default_reflection_steps(),
            run_ttl_hours: None,
        }
    }
}

impl Config {
    /// Runtime configuration for [`intellindex_runtime::IntelligentIndex`].
    pub fn to_index_config(&self) -> IndexConfig {
        IndexConfig {
            llm_base_url: self.llm_url.clone(),
            report_model: self.report_model.clone(),
            memory_model: self.memory_model.clone(),
            api_key: (!self.api_key.is_empty()).then(|| self.api_key.clone()),
            db_path: (!self.db_path.is_empty()).then(|| self.db_path.clone()),
            episodic_limit: self.episodic_limit,
            archive_top_k: self.archive_top_k,
            reflection_steps: self.reflection_steps,
            run_ttl_hours: self.run_ttl_hours,
            ..IndexConfig::default()
        }
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

/// `~/.intellindex`.
pub fn config_dir() -> PathBuf {
    PathBuf::from(home_dir()).join(".intellindex")
}

/// Return the path to `~/.intellindex/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".intellindex").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// Load the config from a specific path.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `INTELLINDEX_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `INTELLINDEX_LLM_URL` | `llm_url` |
/// | `INTELLINDEX_REPORT_MODEL` | `report_model` |
/// | `INTELLINDEX_MEMORY_MODEL` | `memory_model` |
/// | `INTELLINDEX_DB_PATH` | `db_path` |
/// | `INTELLINDEX_API_KEY` | `api_key` |
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides_from(cfg, |key| std::env::var(key).ok());
}

pub(crate) fn apply_overrides_from(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("INTELLINDEX_LLM_URL") {
        cfg.llm_url = v;
    }
    if let Some(v) = lookup("INTELLINDEX_REPORT_MODEL") {
        cfg.report_model = v;
    }
    if let Some(v) = lookup("INTELLINDEX_MEMORY_MODEL") {
        cfg.memory_model = v;
    }
    if let Some(v) = lookup("INTELLINDEX_DB_PATH") {
        cfg.db_path = v;
    }
    if let Some(v) = lookup("INTELLINDEX_API_KEY") {
        cfg.api_key = v;
    }
}

/// Save the config to disk, creating `~/.intellindex/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner-only directory (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Owner-only file (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
