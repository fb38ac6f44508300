//! Grounding context assembly for one message.
//!
//! Degrade, don't fail: a missing document row, unreachable blob, or chunk
//! query error downgrades the reply to ungrounded instead of failing the
//! message. Only a missing session is unrecoverable, since without it there
//! is nowhere to write the reply.

use crate::blob::{BlobStore, decode_text};
use crate::error::PipelineError;
use crate::store::Store;
use crate::store::types::{Chunk, Session};
use std::sync::Arc;

/// Everything generation and citation resolution need about the document a
/// session is bound to.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub document_id: Option<String>,
    pub document_title: Option<String>,
    /// Full decoded document text, empty when unavailable.
    pub text: String,
    /// Citation candidates in ordinal order.
    pub chunks: Vec<Chunk>,
    /// False when the session is unbound or every document fetch degraded.
    pub grounded: bool,
}

impl AssembledContext {
    fn ungrounded(document_id: Option<String>) -> Self {
        Self {
            document_id,
            document_title: None,
            text: String::new(),
            chunks: Vec::new(),
            grounded: false,
        }
    }
}

pub struct ContextAssembler {
    store: Arc<Store>,
    blobs: Arc<dyn BlobStore>,
}

impl ContextAssembler {
    pub fn new(store: Arc<Store>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { store, blobs }
    }

    pub async fn assemble(
        &self,
        session_id: &str,
    ) -> Result<(Session, AssembledContext), PipelineError> {
        let session = self
            .store
            .get_session(session_id)
            .await
            .map_err(|e| PipelineError::TransientIo(format!("load session: {e:#}")))?
            .ok_or_else(|| {
                PipelineError::Configuration(format!("session {session_id} does not exist"))
            })?;

        let Some(document_id) = session.document_id.clone() else {
            // Sessions without a document answer from conversation alone.
            return Ok((session, AssembledContext::ungrounded(None)));
        };

        let document = match self.store.get_document(&document_id).await {
            Ok(Some(document)) => document,
            Ok(None) => {
                tracing::warn!(document_id, "session bound to missing document, degrading");
                return Ok((session, AssembledContext::ungrounded(Some(document_id))));
            }
            Err(error) => {
                tracing::warn!(document_id, "document lookup failed, degrading: {error:#}");
                return Ok((session, AssembledContext::ungrounded(Some(document_id))));
            }
        };

        let text = match self.blobs.fetch(&document.storage_path).await {
            Ok(bytes) => decode_text(&bytes),
            Err(error) => {
                tracing::warn!(
                    document_id,
                    locator = document.storage_path,
                    "blob fetch failed, continuing without document text: {error:#}"
                );
                String::new()
            }
        };

        let chunks = match self.store.get_chunks(&document_id).await {
            Ok(chunks) => chunks,
            Err(error) => {
                tracing::warn!(
                    document_id,
                    "chunk fetch failed, continuing without citation candidates: {error:#}"
                );
                Vec::new()
            }
        };

        let grounded = !text.is_empty() || !chunks.is_empty();
        Ok((
            session,
            AssembledContext {
                document_id: Some(document_id),
                document_title: document.title,
                text,
                chunks,
                grounded,
            },
        ))
    }
}
