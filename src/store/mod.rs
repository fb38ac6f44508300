mod documents;
mod messages;
mod schema;
pub mod types;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// SQLite-backed persistence shared by the worker and the ingestion side.
///
/// Sessions, messages and citations are owned by this worker; documents and
/// chunks are precomputed externally and read-only here (the insert helpers
/// exist for the ingestion process and for tests).
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database file at `path`.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("create database directory")?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .context("parse sqlite url")?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("open SQLite database")?;

        schema::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Open an in-memory database (useful for tests).
    ///
    /// Capped at one connection: each pooled connection to `:memory:` would
    /// otherwise see its own empty database.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("open in-memory SQLite")?;
        schema::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
