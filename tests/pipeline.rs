//! End-to-end pipeline tests over an in-memory store.

use ragline::blob::FsBlobStore;
use ragline::embedding::NoopEmbedding;
use ragline::feed::{ChangeFeed, MessageEvent, SqliteChangeFeed};
use ragline::llm::{ChatTurn, Generator};
use ragline::pipeline::{CitationResolver, ContextAssembler, PipelineOptions};
use ragline::store::types::{Chunk, MessageRole, MessageStatus};
use ragline::{Pipeline, ProcessOutcome, Store};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

struct ScriptedGenerator {
    answer: String,
    fail_first: usize,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    fn answering(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            fail_first: 0,
            calls: AtomicUsize::new(0),
        }
    }

    fn failing_first(answer: &str, failures: usize) -> Self {
        Self {
            answer: answer.to_string(),
            fail_first: failures,
            calls: AtomicUsize::new(0),
        }
    }
}

impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    fn generate<'a>(
        &'a self,
        _system_prompt: Option<&'a str>,
        _turns: &'a [ChatTurn],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                anyhow::bail!("provider unavailable");
            }
            Ok(self.answer.clone())
        })
    }
}

struct Harness {
    store: Arc<Store>,
    dir: tempfile::TempDir,
}

impl Harness {
    async fn new() -> Self {
        Self {
            store: Arc::new(Store::in_memory().await.unwrap()),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn write_blob(&self, name: &str, contents: &str) {
        std::fs::write(self.dir.path().join(name), contents).unwrap();
    }

    async fn pipeline(&self, generator: ScriptedGenerator) -> Arc<Pipeline> {
        let assembler = ContextAssembler::new(
            Arc::clone(&self.store),
            Arc::new(FsBlobStore::new(self.dir.path())),
        );
        let resolver = CitationResolver::new(Arc::new(NoopEmbedding), 4);
        Arc::new(
            Pipeline::new(
                Arc::clone(&self.store),
                assembler,
                Box::new(generator),
                resolver,
                PipelineOptions {
                    history_limit: 10,
                    context_max_chars: 10_000,
                    system_prompt: None,
                    generation_attempts: 1,
                },
            )
            .await
            .unwrap(),
        )
    }

    async fn seed_document(&self, chunks: &[&str]) -> String {
        let document = self
            .store
            .insert_document("doc.txt", Some("Test Document"))
            .await
            .unwrap();
        self.write_blob("doc.txt", &chunks.join("\n\n"));
        for (index, text) in chunks.iter().enumerate() {
            self.store
                .insert_chunk(&Chunk {
                    id: Uuid::new_v4().to_string(),
                    document_id: document.id.clone(),
                    chunk_index: i64::try_from(index).unwrap(),
                    text: (*text).to_string(),
                    page_number: Some(i64::try_from(index).unwrap() + 1),
                    slide_number: None,
                    start_offset: None,
                    end_offset: None,
                    embedding: None,
                })
                .await
                .unwrap();
        }
        document.id
    }

    async fn next_event(&self) -> MessageEvent {
        let feed = SqliteChangeFeed::new(Arc::clone(&self.store), 16);
        feed.poll().await.unwrap().remove(0)
    }
}

#[tokio::test]
async fn grounded_message_produces_cited_reply() {
    let harness = Harness::new().await;
    let document_id = harness
        .seed_document(&[
            "Photosynthesis converts light into chemical energy inside chloroplasts.",
            "The Krebs cycle oxidizes acetyl-CoA to release stored energy.",
        ])
        .await;
    let session = harness
        .store
        .create_session("u1", Some(&document_id))
        .await
        .unwrap();
    let message = harness
        .store
        .append_user_message(&session.id, "how does photosynthesis work?", Some(7))
        .await
        .unwrap();

    let pipeline = harness
        .pipeline(ScriptedGenerator::answering(
            "Photosynthesis converts light into chemical energy inside chloroplasts.",
        ))
        .await;
    let event = harness.next_event().await;

    let outcome = pipeline.process_event(&event).await.unwrap();
    let ProcessOutcome::Completed { reply, citation_count } = outcome else {
        panic!("expected completion");
    };
    assert!(citation_count >= 1);
    assert_eq!(reply.parent_message_id.as_deref(), Some(message.id.as_str()));
    assert_eq!(reply.claim_seq, Some(1));

    let source = harness.store.get_message(&message.id).await.unwrap().unwrap();
    assert!(source.processed);
    assert_eq!(source.status, MessageStatus::Completed);
    assert_eq!(source.input_tokens, Some(7));

    let citations = harness.store.get_citations(&reply.id).await.unwrap();
    assert_eq!(citations.len(), citation_count);
    // The photosynthesis chunk must rank first and carry a highlight span.
    assert!(citations[0].similarity.unwrap() > 0.0);
    assert!(citations[0].highlight_start.is_some());
    assert!(citations[0].highlight_end.unwrap() > citations[0].highlight_start.unwrap());
}

#[tokio::test]
async fn unbound_session_still_gets_a_reply() {
    let harness = Harness::new().await;
    let session = harness.store.create_session("u1", None).await.unwrap();
    harness
        .store
        .append_user_message(&session.id, "just chatting", None)
        .await
        .unwrap();

    let pipeline = harness
        .pipeline(ScriptedGenerator::answering("hello there"))
        .await;
    let event = harness.next_event().await;

    let outcome = pipeline.process_event(&event).await.unwrap();
    let ProcessOutcome::Completed { reply, citation_count } = outcome else {
        panic!("expected completion");
    };
    assert_eq!(citation_count, 0);
    assert_eq!(reply.content, "hello there");
}

#[tokio::test]
async fn concurrent_claims_produce_exactly_one_reply() {
    let harness = Harness::new().await;
    let session = harness.store.create_session("u1", None).await.unwrap();
    let message = harness
        .store
        .append_user_message(&session.id, "race me", None)
        .await
        .unwrap();

    let pipeline = harness.pipeline(ScriptedGenerator::answering("winner")).await;
    let event = harness.next_event().await;

    let (first, second) = tokio::join!(
        pipeline.process_event(&event),
        pipeline.process_event(&event)
    );
    let outcomes = [first.unwrap(), second.unwrap()];

    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, ProcessOutcome::Completed { .. }))
        .count();
    let skipped = outcomes
        .iter()
        .filter(|o| matches!(o, ProcessOutcome::AlreadyClaimed))
        .count();
    assert_eq!(completed, 1);
    assert_eq!(skipped, 1);

    let history = harness.store.get_history(&session.id, 10).await.unwrap();
    let replies = history
        .iter()
        .filter(|m| m.role == MessageRole::Assistant)
        .count();
    assert_eq!(replies, 1);
    assert!(harness
        .store
        .find_assistant_reply(&message.id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn generation_failure_marks_message_failed_and_spares_others() {
    let harness = Harness::new().await;
    let session = harness.store.create_session("u1", None).await.unwrap();
    let doomed = harness
        .store
        .append_user_message(&session.id, "will fail", None)
        .await
        .unwrap();

    let failing = harness
        .pipeline(ScriptedGenerator::failing_first("never", usize::MAX))
        .await;
    let event = harness.next_event().await;
    let outcome = failing.process_event(&event).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Failed { .. }));

    let failed = harness.store.get_message(&doomed.id).await.unwrap().unwrap();
    assert_eq!(failed.status, MessageStatus::Failed);
    assert!(!failed.processed);

    // The next message in the same session is unaffected.
    harness
        .store
        .append_user_message(&session.id, "still works?", None)
        .await
        .unwrap();
    let healthy = harness.pipeline(ScriptedGenerator::answering("yes")).await;
    let event = harness.next_event().await;
    assert!(matches!(
        healthy.process_event(&event).await.unwrap(),
        ProcessOutcome::Completed { .. }
    ));
}

#[tokio::test]
async fn sweep_requeues_failed_message_for_reprocessing() {
    let harness = Harness::new().await;
    let session = harness.store.create_session("u1", None).await.unwrap();
    let message = harness
        .store
        .append_user_message(&session.id, "retry me", None)
        .await
        .unwrap();

    let failing = harness
        .pipeline(ScriptedGenerator::failing_first("late success", 1))
        .await;
    let event = harness.next_event().await;
    assert!(matches!(
        failing.process_event(&event).await.unwrap(),
        ProcessOutcome::Failed { .. }
    ));

    assert_eq!(harness.store.requeue_failed().await.unwrap(), 1);

    // The feed re-delivers and the second attempt succeeds.
    let event = harness.next_event().await;
    assert_eq!(event.message_id, message.id);
    let outcome = failing.process_event(&event).await.unwrap();
    let ProcessOutcome::Completed { reply, .. } = outcome else {
        panic!("expected completion after requeue");
    };
    assert_eq!(reply.content, "late success");
    // The second claim got a fresh, higher sequence number.
    assert_eq!(reply.claim_seq, Some(2));
}

#[tokio::test]
async fn missing_session_fails_without_retryable_flag() {
    let harness = Harness::new().await;
    let session = harness.store.create_session("u1", None).await.unwrap();
    let message = harness
        .store
        .append_user_message(&session.id, "orphan", None)
        .await
        .unwrap();
    // Orphan the message behind the foreign key's back.
    sqlx::query("PRAGMA foreign_keys = OFF")
        .execute(harness.store.pool())
        .await
        .unwrap();
    sqlx::query("DELETE FROM sessions WHERE id = ?1")
        .bind(&session.id)
        .execute(harness.store.pool())
        .await
        .unwrap();

    let pipeline = harness.pipeline(ScriptedGenerator::answering("n/a")).await;
    let event = MessageEvent {
        message_id: message.id.clone(),
        session_id: session.id,
        user_id: "u1".into(),
        body: "orphan".into(),
        input_tokens: None,
    };

    let outcome = pipeline.process_event(&event).await.unwrap();
    let ProcessOutcome::Failed { error } = outcome else {
        panic!("expected failure");
    };
    assert!(!error.is_retryable());
    let failed = harness.store.get_message(&message.id).await.unwrap().unwrap();
    assert_eq!(failed.status, MessageStatus::Failed);
}
