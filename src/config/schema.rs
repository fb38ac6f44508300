use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ConfigError;

/// Top-level worker configuration, loaded from `ragline.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub generation: GenerationConfig,
    pub embedding: EmbeddingConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file holding sessions, messages, documents, chunks and
    /// citations.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ragline.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for filesystem-stored document blobs. Locators that are
    /// not `http(s)` URLs resolve relative to this directory.
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("documents"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// OpenAI-compatible base URL.
    pub base_url: String,
    pub model: String,
    /// Prefer the `RAGLINE_API_KEY` env var over committing a key here.
    pub api_key: Option<String>,
    pub temperature: f64,
    /// Per-request timeout; a timeout counts as a transient failure.
    pub timeout_secs: u64,
    /// Bounded retry budget for transient failures.
    pub max_retries: u32,
    pub backoff_ms: u64,
    /// How many top-ranked chunks ground the request and become citation
    /// candidates.
    pub top_chunks: usize,
    /// Character cap on the document text embedded in the system prompt.
    pub context_max_chars: usize,
    /// Extra system instructions prepended to the grounding context.
    pub system_prompt: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            temperature: 0.2,
            timeout_secs: 60,
            max_retries: 2,
            backoff_ms: 500,
            top_chunks: 4,
            context_max_chars: 12_000,
            system_prompt: None,
        }
    }
}

impl GenerationConfig {
    /// Resolve the API key: explicit config value, then environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("RAGLINE_API_KEY").ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `"none"` for lexical-overlap scoring, `"openai"` for an
    /// OpenAI-compatible embeddings endpoint.
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "none".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum concurrently executing message pipelines.
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    /// Conversation-history window passed to the generator.
    pub history_limit: usize,
    /// Maximum events pulled per feed poll.
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 1_000,
            history_limit: 20,
            batch_size: 32,
        }
    }
}

impl Config {
    /// Reject configurations the worker cannot run with.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Validation(
                "worker.concurrency must be at least 1".into(),
            ));
        }
        if self.generation.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "generation.timeout_secs must be at least 1".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(ConfigError::Validation(format!(
                "generation.temperature {} out of range 0.0..=2.0",
                self.generation.temperature
            )));
        }
        if self.generation.top_chunks == 0 {
            return Err(ConfigError::Validation(
                "generation.top_chunks must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
