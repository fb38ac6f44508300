//! Change feed over unprocessed user messages.
//!
//! The worker loop is handed a [`ChangeFeed`] rather than reaching into
//! process-wide state, so tests can inject scripted feeds. An event is only a
//! notification — the atomic claim in the store decides who processes a
//! message, so redelivered or duplicated events are harmless.

mod sqlite;

pub use sqlite::SqliteChangeFeed;

use async_trait::async_trait;

/// Insert event for a user message with `processed = false`.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub message_id: String,
    pub session_id: String,
    pub user_id: String,
    pub body: String,
    pub input_tokens: Option<i64>,
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Next batch of events; empty when nothing is waiting.
    async fn poll(&self) -> anyhow::Result<Vec<MessageEvent>>;
}
