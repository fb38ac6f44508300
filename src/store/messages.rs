use super::Store;
use super::types::{Message, MessageRole, MessageStatus, NewCitation, Session};
use anyhow::Context;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn message_from_row(row: &SqliteRow) -> anyhow::Result<Message> {
    let role_raw: String = row.try_get("role")?;
    let status_raw: String = row.try_get("status")?;
    Ok(Message {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        role: MessageRole::parse(&role_raw)?,
        content: row.try_get("content")?,
        processed: row.try_get::<i64, _>("processed")? != 0,
        status: MessageStatus::parse(&status_raw)?,
        input_tokens: row.try_get("input_tokens")?,
        output_tokens: row.try_get("output_tokens")?,
        parent_message_id: row.try_get("parent_message_id")?,
        claim_seq: row.try_get("claim_seq")?,
        created_at: row.try_get("created_at")?,
    })
}

const MESSAGE_COLUMNS: &str = "id, session_id, role, content, processed, status, \
     input_tokens, output_tokens, parent_message_id, claim_seq, created_at";

impl Store {
    // ── Sessions ────────────────────────────────────────────────────────

    pub async fn create_session(
        &self,
        user_id: &str,
        document_id: Option<&str>,
    ) -> anyhow::Result<Session> {
        let id = Uuid::new_v4().to_string();
        let timestamp = now();

        sqlx::query(
            "INSERT INTO sessions (id, user_id, document_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(document_id)
        .bind(&timestamp)
        .execute(&self.pool)
        .await
        .context("insert session")?;

        Ok(Session {
            id,
            user_id: user_id.to_string(),
            document_id: document_id.map(str::to_string),
            created_at: timestamp.clone(),
            updated_at: timestamp,
        })
    }

    pub async fn get_session(&self, id: &str) -> anyhow::Result<Option<Session>> {
        let row = sqlx::query(
            "SELECT id, user_id, document_id, created_at, updated_at
             FROM sessions WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch session")?;

        row.map(|row| {
            Ok(Session {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                document_id: row.try_get("document_id")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    // ── Messages ────────────────────────────────────────────────────────

    /// Client-side insert of a user message (role=user, unprocessed). The
    /// change feed picks it up from here.
    pub async fn append_user_message(
        &self,
        session_id: &str,
        content: &str,
        input_tokens: Option<i64>,
    ) -> anyhow::Result<Message> {
        let id = Uuid::new_v4().to_string();
        let created_at = now();

        sqlx::query(
            "INSERT INTO messages (id, session_id, role, content, processed, status,
                                   input_tokens, created_at)
             VALUES (?1, ?2, 'user', ?3, 0, 'pending', ?4, ?5)",
        )
        .bind(&id)
        .bind(session_id)
        .bind(content)
        .bind(input_tokens)
        .bind(&created_at)
        .execute(&self.pool)
        .await
        .context("insert user message")?;

        Ok(Message {
            id,
            session_id: session_id.to_string(),
            role: MessageRole::User,
            content: content.to_string(),
            processed: false,
            status: MessageStatus::Pending,
            input_tokens,
            output_tokens: None,
            parent_message_id: None,
            claim_seq: None,
            created_at,
        })
    }

    pub async fn get_message(&self, id: &str) -> anyhow::Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch message")?;

        row.as_ref().map(message_from_row).transpose()
    }

    /// Most recent `limit` messages of a session, oldest first.
    pub async fn get_history(&self, session_id: &str, limit: usize) -> anyhow::Result<Vec<Message>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM (
                 SELECT rowid AS rid, {MESSAGE_COLUMNS} FROM messages
                 WHERE session_id = ?1
                 ORDER BY rid DESC
                 LIMIT ?2
             ) ORDER BY rid ASC"
        ))
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("fetch session history")?;

        rows.iter().map(message_from_row).collect()
    }

    // ── Claiming ────────────────────────────────────────────────────────

    /// Atomically claim an unprocessed user message.
    ///
    /// The conditional UPDATE is the race-free gate: of any number of
    /// concurrent claim attempts, exactly one flips `pending → processing`.
    /// Returns `None` when the race was lost (or the row was already
    /// processed), which callers treat as a silent no-op.
    pub async fn claim_message(
        &self,
        id: &str,
        claim_seq: i64,
    ) -> anyhow::Result<Option<Message>> {
        let result = sqlx::query(
            "UPDATE messages
             SET status = 'processing', claim_seq = ?2, claimed_at = ?3
             WHERE id = ?1 AND status = 'pending' AND role = 'user'",
        )
        .bind(id)
        .bind(claim_seq)
        .bind(now())
        .execute(&self.pool)
        .await
        .context("claim message")?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_message(id).await
    }

    /// Highest claim sequence ever issued, for seeding the in-process counter
    /// after a restart.
    pub async fn max_claim_seq(&self) -> anyhow::Result<i64> {
        let max: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(claim_seq), 0) FROM messages")
            .fetch_one(&self.pool)
            .await
            .context("fetch max claim sequence")?;
        Ok(max)
    }

    /// Record an unrecoverable stage failure. `processed` stays 0 so the
    /// message is visibly retryable by `sweep`.
    pub async fn mark_failed(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE messages SET status = 'failed' WHERE id = ?1 AND status = 'processing'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("mark message failed")?;
        Ok(())
    }

    /// Operator sweep: flip failed messages back to pending so the feed
    /// re-delivers them.
    pub async fn requeue_failed(&self) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE messages SET status = 'pending', claim_seq = NULL, claimed_at = NULL
             WHERE status = 'failed'",
        )
        .execute(&self.pool)
        .await
        .context("requeue failed messages")?;
        Ok(result.rows_affected())
    }

    // ── Result writing ──────────────────────────────────────────────────

    pub async fn find_assistant_reply(
        &self,
        parent_message_id: &str,
    ) -> anyhow::Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE parent_message_id = ?1 AND role = 'assistant'"
        ))
        .bind(parent_message_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch assistant reply")?;

        row.as_ref().map(message_from_row).transpose()
    }

    /// Persist the pipeline's output in one transaction: the assistant
    /// message, its citations, and the processed flip on the source message.
    ///
    /// Idempotent on re-run: an existing reply for the same source message is
    /// reused rather than duplicated, and its citations are rewritten, so a
    /// retry after a partial failure converges instead of double-posting.
    pub async fn write_assistant_reply(
        &self,
        source: &Message,
        answer: &str,
        input_tokens: i64,
        output_tokens: i64,
        claim_seq: i64,
        citations: &[NewCitation],
    ) -> anyhow::Result<Message> {
        let mut tx = self.pool.begin().await.context("begin result transaction")?;
        let created_at = now();

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM messages WHERE parent_message_id = ?1 AND role = 'assistant'",
        )
        .bind(&source.id)
        .fetch_optional(&mut *tx)
        .await
        .context("check for existing reply")?;

        let reply_id = match existing {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                sqlx::query(
                    "INSERT INTO messages (id, session_id, role, content, processed, status,
                                           input_tokens, output_tokens, parent_message_id,
                                           claim_seq, created_at)
                     VALUES (?1, ?2, 'assistant', ?3, 1, 'completed', ?4, ?5, ?6, ?7, ?8)",
                )
                .bind(&id)
                .bind(&source.session_id)
                .bind(answer)
                .bind(input_tokens)
                .bind(output_tokens)
                .bind(&source.id)
                .bind(claim_seq)
                .bind(&created_at)
                .execute(&mut *tx)
                .await
                .context("insert assistant message")?;
                id
            }
        };

        // Rewrite citations wholesale so a retried write converges.
        sqlx::query("DELETE FROM citations WHERE message_id = ?1")
            .bind(&reply_id)
            .execute(&mut *tx)
            .await
            .context("clear stale citations")?;

        for citation in citations {
            sqlx::query(
                "INSERT INTO citations (id, message_id, chunk_id, similarity,
                                        highlight_start, highlight_end, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&reply_id)
            .bind(&citation.chunk_id)
            .bind(citation.similarity)
            .bind(citation.highlight_start)
            .bind(citation.highlight_end)
            .bind(&created_at)
            .execute(&mut *tx)
            .await
            .context("insert citation")?;
        }

        sqlx::query(
            "UPDATE messages
             SET processed = 1, status = 'completed', input_tokens = COALESCE(input_tokens, ?2)
             WHERE id = ?1",
        )
        .bind(&source.id)
        .bind(input_tokens)
        .execute(&mut *tx)
        .await
        .context("flip processed flag")?;

        sqlx::query("UPDATE sessions SET updated_at = ?1 WHERE id = ?2")
            .bind(&created_at)
            .bind(&source.session_id)
            .execute(&mut *tx)
            .await
            .context("touch session")?;

        tx.commit().await.context("commit result transaction")?;

        self.get_message(&reply_id)
            .await?
            .context("assistant reply vanished after commit")
    }

    /// Citations attached to an assistant message, insertion order.
    pub async fn get_citations(
        &self,
        message_id: &str,
    ) -> anyhow::Result<Vec<super::types::Citation>> {
        let rows = sqlx::query(
            "SELECT id, message_id, chunk_id, similarity, highlight_start, highlight_end,
                    created_at
             FROM citations WHERE message_id = ?1 ORDER BY rowid ASC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await
        .context("fetch citations")?;

        rows.iter()
            .map(|row| {
                Ok(super::types::Citation {
                    id: row.try_get("id")?,
                    message_id: row.try_get("message_id")?,
                    chunk_id: row.try_get("chunk_id")?,
                    similarity: row.try_get("similarity")?,
                    highlight_start: row.try_get("highlight_start")?,
                    highlight_end: row.try_get("highlight_end")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
