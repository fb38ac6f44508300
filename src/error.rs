use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for `ragline`.
///
/// Each subsystem defines its own error variant. Library callers can match on
/// these to decide recovery strategy; internal code continues to use
/// `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum RaglineError {
    // ── Config ───────────────────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── Store ───────────────────────────────────────────────────────────
    #[error("store: {0}")]
    Store(#[from] StoreError),

    // ── Pipeline stages ─────────────────────────────────────────────────
    #[error("pipeline: {0}")]
    Pipeline(#[from] PipelineError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Store errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("schema init failed: {0}")]
    Schema(String),

    #[error("query failed: {0}")]
    Query(String),
}

// ─── Pipeline stage errors ──────────────────────────────────────────────────

/// Per-message processing failures, classified by recovery strategy.
///
/// `Configuration` needs operator intervention (the message references a
/// session or document that does not exist). `TransientIo` and
/// `GenerationExhausted` leave the message visibly retryable via `sweep`.
/// Losing the claim race is not represented here at all — it is an expected
/// silent no-op, not an error.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration: {0}")]
    Configuration(String),

    #[error("transient i/o: {0}")]
    TransientIo(String),

    #[error("generation failed after {attempts} attempts: {message}")]
    GenerationExhausted { attempts: u32, message: String },
}

impl PipelineError {
    /// Whether a scheduled sweep may safely requeue the message.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Configuration(_))
    }
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, RaglineError>;
