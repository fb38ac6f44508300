//! Row models for the worker's SQLite store.
//!
//! Sessions bind a chat to at most one document; messages carry the
//! `processed` flag and the claim `status` the worker loop races on; chunks
//! and documents are written by the ingestion side and read-only here;
//! citations are written only for assistant messages.

use anyhow::bail;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => bail!("unknown message role: {other}"),
        }
    }
}

/// Claim lifecycle of a message. `processed` stays false until `Completed`;
/// `Failed` keeps it false so a sweep can requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => bail!("unknown message status: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    /// Immutable once set; `None` means an unbound (document-less) chat.
    pub document_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub processed: bool,
    pub status: MessageStatus,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    /// For assistant rows: the user message this reply answers.
    pub parent_message_id: Option<String>,
    /// Monotonic claim order, used to sequence replies within a session.
    pub claim_seq: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    /// Blob locator: a path under the storage root or an http(s) URL.
    pub storage_path: String,
    pub title: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub page_number: Option<i64>,
    pub slide_number: Option<i64>,
    pub start_offset: Option<i64>,
    pub end_offset: Option<i64>,
    /// Precomputed embedding, little-endian f32 bytes; absent when the
    /// ingestion side ran without an embedder.
    pub embedding: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct Citation {
    pub id: String,
    pub message_id: String,
    pub chunk_id: String,
    pub similarity: Option<f64>,
    pub highlight_start: Option<i64>,
    pub highlight_end: Option<i64>,
    pub created_at: String,
}

/// Citation data produced by the resolver, before it gets a row id.
#[derive(Debug, Clone)]
pub struct NewCitation {
    pub chunk_id: String,
    pub similarity: Option<f64>,
    pub highlight_start: Option<i64>,
    pub highlight_end: Option<i64>,
}
