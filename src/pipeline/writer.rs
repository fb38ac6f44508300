//! Final pipeline stage: persist the reply, its citations, and the processed
//! flip in one transaction.

use super::citations::ResolvedCitation;
use crate::store::Store;
use crate::store::types::{Message, NewCitation};
use crate::tokens::estimate_tokens;
use std::sync::Arc;

pub struct ResultWriter {
    store: Arc<Store>,
}

impl ResultWriter {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Safe to call again after a partial failure: the underlying write keys
    /// on the source message and converges instead of duplicating the reply.
    pub async fn write(
        &self,
        source: &Message,
        answer: &str,
        claim_seq: i64,
        citations: &[ResolvedCitation],
    ) -> anyhow::Result<Message> {
        let input_tokens = source
            .input_tokens
            .unwrap_or_else(|| estimate_tokens(&source.content));
        let output_tokens = estimate_tokens(answer);

        let rows: Vec<NewCitation> = citations
            .iter()
            .map(ResolvedCitation::to_new_citation)
            .collect();

        self.store
            .write_assistant_reply(source, answer, input_tokens, output_tokens, claim_seq, &rows)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::citations::{Highlight, ResolvedCitation};
    use crate::store::types::Chunk;
    use uuid::Uuid;

    fn resolved(chunk_id: &str) -> ResolvedCitation {
        ResolvedCitation {
            chunk: Chunk {
                id: chunk_id.to_string(),
                document_id: "doc".into(),
                chunk_index: 0,
                text: "chunk text".into(),
                page_number: Some(2),
                slide_number: None,
                start_offset: None,
                end_offset: None,
                embedding: None,
            },
            label: "p.2".into(),
            similarity: Some(0.75),
            highlight: Highlight::Excerpt {
                text: "chunk text".into(),
                truncated: false,
            },
            highlight_start: None,
            highlight_end: None,
        }
    }

    #[tokio::test]
    async fn write_persists_reply_with_citations_and_token_estimates() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let session = store.create_session("u1", None).await.unwrap();
        // No client-supplied token count: the writer estimates from content.
        let source = store
            .append_user_message(&session.id, "12345678", None)
            .await
            .unwrap();
        let claimed = store.claim_message(&source.id, 1).await.unwrap().unwrap();

        let writer = ResultWriter::new(Arc::clone(&store));
        let reply = writer
            .write(&claimed, "abcd", 1, &[resolved(&Uuid::new_v4().to_string())])
            .await
            .unwrap();

        assert_eq!(reply.input_tokens, Some(2));
        assert_eq!(reply.output_tokens, Some(1));
        assert_eq!(reply.parent_message_id.as_deref(), Some(source.id.as_str()));

        let citations = store.get_citations(&reply.id).await.unwrap();
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].similarity, Some(0.75));
    }

    #[tokio::test]
    async fn client_supplied_input_tokens_win_over_estimate() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let session = store.create_session("u1", None).await.unwrap();
        let source = store
            .append_user_message(&session.id, "12345678", Some(99))
            .await
            .unwrap();
        let claimed = store.claim_message(&source.id, 1).await.unwrap().unwrap();

        let reply = ResultWriter::new(Arc::clone(&store))
            .write(&claimed, "ok", 1, &[])
            .await
            .unwrap();
        assert_eq!(reply.input_tokens, Some(99));
    }
}
