use super::{ChangeFeed, MessageEvent};
use crate::store::Store;
use anyhow::Context;
use async_trait::async_trait;
use sqlx::Row;
use std::sync::Arc;

/// Polling change feed over the message table.
///
/// Emulates an insert subscription by selecting pending user messages in
/// insertion order. Delivery is at-least-once; exactly-once-in-effect comes
/// from the claim gate downstream.
pub struct SqliteChangeFeed {
    store: Arc<Store>,
    batch_size: usize,
}

impl SqliteChangeFeed {
    pub fn new(store: Arc<Store>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl ChangeFeed for SqliteChangeFeed {
    async fn poll(&self) -> anyhow::Result<Vec<MessageEvent>> {
        let limit = i64::try_from(self.batch_size).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT m.id AS message_id, m.session_id, s.user_id, m.content, m.input_tokens
             FROM messages m
             JOIN sessions s ON s.id = m.session_id
             WHERE m.role = 'user' AND m.processed = 0 AND m.status = 'pending'
             ORDER BY m.rowid ASC
             LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(self.store.pool())
        .await
        .context("poll pending user messages")?;

        rows.iter()
            .map(|row| {
                Ok(MessageEvent {
                    message_id: row.try_get("message_id")?,
                    session_id: row.try_get("session_id")?,
                    user_id: row.try_get("user_id")?,
                    body: row.try_get("content")?,
                    input_tokens: row.try_get("input_tokens")?,
                })
            })
            .collect()
    }
}
