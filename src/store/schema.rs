use anyhow::Context;
use sqlx::SqlitePool;

pub(super) async fn init_schema(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::raw_sql(
        "PRAGMA foreign_keys = ON;

         CREATE TABLE IF NOT EXISTS documents (
             id           TEXT PRIMARY KEY,
             storage_path TEXT NOT NULL,
             title        TEXT,
             created_at   TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS sessions (
             id          TEXT PRIMARY KEY,
             user_id     TEXT NOT NULL,
             document_id TEXT REFERENCES documents(id),
             created_at  TEXT NOT NULL,
             updated_at  TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);

         CREATE TABLE IF NOT EXISTS chunks (
             id            TEXT PRIMARY KEY,
             document_id   TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
             chunk_index   INTEGER NOT NULL,
             text          TEXT NOT NULL,
             page_number   INTEGER,
             slide_number  INTEGER,
             start_offset  INTEGER,
             end_offset    INTEGER,
             embedding     BLOB
         );
         CREATE INDEX IF NOT EXISTS idx_chunks_document
             ON chunks(document_id, chunk_index);

         CREATE TABLE IF NOT EXISTS messages (
             id                TEXT PRIMARY KEY,
             session_id        TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
             role              TEXT NOT NULL,
             content           TEXT NOT NULL,
             processed         INTEGER NOT NULL DEFAULT 0,
             status            TEXT NOT NULL DEFAULT 'pending',
             input_tokens      INTEGER,
             output_tokens     INTEGER,
             parent_message_id TEXT,
             claim_seq         INTEGER,
             claimed_at        TEXT,
             created_at        TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_messages_session
             ON messages(session_id, created_at);
         CREATE INDEX IF NOT EXISTS idx_messages_status
             ON messages(status, created_at);
         CREATE INDEX IF NOT EXISTS idx_messages_parent
             ON messages(parent_message_id);

         CREATE TABLE IF NOT EXISTS citations (
             id              TEXT PRIMARY KEY,
             message_id      TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
             chunk_id        TEXT NOT NULL,
             similarity      REAL,
             highlight_start INTEGER,
             highlight_end   INTEGER,
             created_at      TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_citations_message ON citations(message_id);",
    )
    .execute(pool)
    .await
    .context("init sqlite schema")?;

    Ok(())
}
