use super::Store;
use super::types::{Chunk, Document};
use anyhow::Context;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

fn chunk_from_row(row: &SqliteRow) -> anyhow::Result<Chunk> {
    Ok(Chunk {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        chunk_index: row.try_get("chunk_index")?,
        text: row.try_get("text")?,
        page_number: row.try_get("page_number")?,
        slide_number: row.try_get("slide_number")?,
        start_offset: row.try_get("start_offset")?,
        end_offset: row.try_get("end_offset")?,
        embedding: row.try_get("embedding")?,
    })
}

impl Store {
    pub async fn get_document(&self, id: &str) -> anyhow::Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, storage_path, title, created_at FROM documents WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch document")?;

        row.map(|row| {
            Ok(Document {
                id: row.try_get("id")?,
                storage_path: row.try_get("storage_path")?,
                title: row.try_get("title")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    /// A document's chunks in ordinal order.
    pub async fn get_chunks(&self, document_id: &str) -> anyhow::Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT id, document_id, chunk_index, text, page_number, slide_number,
                    start_offset, end_offset, embedding
             FROM chunks WHERE document_id = ?1 ORDER BY chunk_index ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .context("fetch chunks")?;

        rows.iter().map(chunk_from_row).collect()
    }

    // ── Ingestion-side inserts (used by the ingestion process and tests) ─

    pub async fn insert_document(
        &self,
        storage_path: &str,
        title: Option<&str>,
    ) -> anyhow::Result<Document> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO documents (id, storage_path, title, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&id)
        .bind(storage_path)
        .bind(title)
        .bind(&created_at)
        .execute(&self.pool)
        .await
        .context("insert document")?;

        Ok(Document {
            id,
            storage_path: storage_path.to_string(),
            title: title.map(str::to_string),
            created_at,
        })
    }

    pub async fn insert_chunk(&self, chunk: &Chunk) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO chunks (id, document_id, chunk_index, text, page_number,
                                 slide_number, start_offset, end_offset, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(chunk.page_number)
        .bind(chunk.slide_number)
        .bind(chunk.start_offset)
        .bind(chunk.end_offset)
        .bind(chunk.embedding.as_deref())
        .execute(&self.pool)
        .await
        .context("insert chunk")?;
        Ok(())
    }
}
