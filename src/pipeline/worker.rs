//! Long-lived worker loop: poll the change feed, fan events out to the
//! pipeline under a concurrency cap.
//!
//! A poll failure or a panicked task is logged and the loop keeps running;
//! per-message failures never escape the pipeline.

use super::{Pipeline, ProcessOutcome};
use crate::feed::ChangeFeed;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub struct WorkerLoop {
    feed: Arc<dyn ChangeFeed>,
    pipeline: Arc<Pipeline>,
    poll_interval: Duration,
    permits: Arc<Semaphore>,
}

impl WorkerLoop {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        pipeline: Arc<Pipeline>,
        poll_interval: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            feed,
            pipeline,
            poll_interval,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Run until the surrounding task is cancelled.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.drain_once().await {
                Ok(0) => {}
                Ok(completed) => tracing::debug!(completed, "drained feed batch"),
                Err(error) => tracing::error!("feed poll failed: {error:#}"),
            }
        }
    }

    /// Poll once and process every delivered event; returns how many messages
    /// completed.
    pub async fn drain_once(&self) -> anyhow::Result<usize> {
        let events = self.feed.poll().await?;
        if events.is_empty() {
            return Ok(0);
        }

        let mut tasks = JoinSet::new();
        for event in events {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            let pipeline = Arc::clone(&self.pipeline);

            tasks.spawn(async move {
                let _permit = permit;
                let message_id = event.message_id.clone();
                match pipeline.process_event(&event).await {
                    Ok(outcome) => Some(outcome),
                    Err(error) => {
                        tracing::error!(message_id, "claim attempt failed: {error:#}");
                        None
                    }
                }
            });
        }

        let mut completed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(ProcessOutcome::Completed { .. })) => completed += 1,
                Ok(_) => {}
                Err(join_error) => tracing::error!("pipeline task panicked: {join_error}"),
            }
        }
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::FsBlobStore;
    use crate::embedding::NoopEmbedding;
    use crate::feed::{MessageEvent, SqliteChangeFeed};
    use crate::llm::{ChatTurn, Generator};
    use crate::pipeline::{CitationResolver, ContextAssembler, PipelineOptions};
    use crate::store::Store;
    use crate::store::types::MessageStatus;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    struct CannedGenerator {
        answer: &'static str,
    }

    impl Generator for CannedGenerator {
        fn name(&self) -> &str {
            "canned"
        }

        fn generate<'a>(
            &'a self,
            _system_prompt: Option<&'a str>,
            _turns: &'a [ChatTurn],
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
            Box::pin(async move { Ok(self.answer.to_string()) })
        }
    }

    struct ScriptedFeed {
        batches: Mutex<Vec<Vec<MessageEvent>>>,
    }

    #[async_trait::async_trait]
    impl ChangeFeed for ScriptedFeed {
        async fn poll(&self) -> anyhow::Result<Vec<MessageEvent>> {
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(batches.remove(0))
            }
        }
    }

    async fn pipeline_over(store: &Arc<Store>, dir: &tempfile::TempDir) -> Arc<Pipeline> {
        let assembler = ContextAssembler::new(
            Arc::clone(store),
            Arc::new(FsBlobStore::new(dir.path())),
        );
        let resolver = CitationResolver::new(Arc::new(NoopEmbedding), 4);
        Arc::new(
            Pipeline::new(
                Arc::clone(store),
                assembler,
                Box::new(CannedGenerator { answer: "the reply" }),
                resolver,
                PipelineOptions {
                    history_limit: 10,
                    context_max_chars: 10_000,
                    system_prompt: None,
                    generation_attempts: 3,
                },
            )
            .await
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn drain_processes_pending_messages() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let session = store.create_session("u1", None).await.unwrap();
        let message = store
            .append_user_message(&session.id, "hello?", None)
            .await
            .unwrap();

        let feed = Arc::new(SqliteChangeFeed::new(Arc::clone(&store), 16));
        let worker = WorkerLoop::new(
            feed,
            pipeline_over(&store, &dir).await,
            Duration::from_millis(10),
            2,
        );

        assert_eq!(worker.drain_once().await.unwrap(), 1);

        let processed = store.get_message(&message.id).await.unwrap().unwrap();
        assert_eq!(processed.status, MessageStatus::Completed);
        let reply = store.find_assistant_reply(&message.id).await.unwrap().unwrap();
        assert_eq!(reply.content, "the reply");

        // The feed has nothing left once everything is claimed.
        assert_eq!(worker.drain_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_events_in_one_batch_produce_one_reply() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let session = store.create_session("u1", None).await.unwrap();
        let message = store
            .append_user_message(&session.id, "hello?", None)
            .await
            .unwrap();

        let event = MessageEvent {
            message_id: message.id.clone(),
            session_id: session.id.clone(),
            user_id: "u1".into(),
            body: "hello?".into(),
            input_tokens: None,
        };
        let feed = Arc::new(ScriptedFeed {
            batches: Mutex::new(vec![vec![event.clone(), event]]),
        });

        let worker = WorkerLoop::new(
            feed,
            pipeline_over(&store, &dir).await,
            Duration::from_millis(10),
            4,
        );
        assert_eq!(worker.drain_once().await.unwrap(), 1);

        let history = store.get_history(&session.id, 10).await.unwrap();
        assert_eq!(history.len(), 2);
    }
}
