//! Message processing pipeline.
//!
//! One message flows claim → assemble → generate → resolve citations →
//! write, and every failure is isolated to that message: the claim is marked
//! failed and the worker moves on.

pub mod citations;
pub mod context;
pub mod worker;
pub mod writer;

pub use citations::{
    CitationResolver, Highlight, ResolvedCitation, compute_highlight, display_label,
};
pub use context::{AssembledContext, ContextAssembler};
pub use worker::WorkerLoop;
pub use writer::ResultWriter;

use crate::error::PipelineError;
use crate::feed::MessageEvent;
use crate::llm::{ChatTurn, Generator};
use crate::store::Store;
use crate::store::types::{Message, MessageRole, MessageStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant answering questions about a \
     document. Ground your answers in the provided document context, and say so plainly when \
     the document does not contain the answer.";

/// Per-event result, for logging and tests.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// Reply written and source message flipped to processed.
    Completed { reply: Message, citation_count: usize },
    /// Another worker holds the claim; nothing to do.
    AlreadyClaimed,
    /// A stage failed; the message is marked failed and the worker moves on.
    Failed { error: PipelineError },
}

/// Tunables the pipeline needs from the worker configuration.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub history_limit: usize,
    pub context_max_chars: usize,
    pub system_prompt: Option<String>,
    /// Total generation attempts (initial try plus retries), for error
    /// reporting.
    pub generation_attempts: u32,
}

pub struct Pipeline {
    store: Arc<Store>,
    assembler: ContextAssembler,
    generator: Box<dyn Generator>,
    resolver: CitationResolver,
    writer: ResultWriter,
    options: PipelineOptions,
    claim_seq: AtomicI64,
}

impl Pipeline {
    /// Seeds the claim counter from the store so sequence numbers stay
    /// monotonic across restarts.
    pub async fn new(
        store: Arc<Store>,
        assembler: ContextAssembler,
        generator: Box<dyn Generator>,
        resolver: CitationResolver,
        options: PipelineOptions,
    ) -> anyhow::Result<Self> {
        let seed = store.max_claim_seq().await?;
        Ok(Self {
            writer: ResultWriter::new(Arc::clone(&store)),
            store,
            assembler,
            generator,
            resolver,
            options,
            claim_seq: AtomicI64::new(seed),
        })
    }

    fn next_claim_seq(&self) -> i64 {
        self.claim_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Process one feed event end to end.
    ///
    /// Only claim-gate I/O errors surface as `Err`; stage failures are
    /// recorded on the message and reported as [`ProcessOutcome::Failed`].
    pub async fn process_event(&self, event: &MessageEvent) -> anyhow::Result<ProcessOutcome> {
        let claim_seq = self.next_claim_seq();
        let Some(claimed) = self.store.claim_message(&event.message_id, claim_seq).await? else {
            tracing::debug!(message_id = event.message_id, "claim lost, skipping");
            return Ok(ProcessOutcome::AlreadyClaimed);
        };

        match self.run_stages(&claimed, claim_seq).await {
            Ok((reply, citation_count)) => {
                tracing::info!(
                    message_id = claimed.id,
                    reply_id = reply.id,
                    citation_count,
                    "message processed"
                );
                Ok(ProcessOutcome::Completed { reply, citation_count })
            }
            Err(error) => {
                tracing::error!(
                    message_id = claimed.id,
                    retryable = error.is_retryable(),
                    "pipeline failed: {error}"
                );
                if let Err(mark_error) = self.store.mark_failed(&claimed.id).await {
                    tracing::error!(
                        message_id = claimed.id,
                        "could not mark message failed: {mark_error:#}"
                    );
                }
                Ok(ProcessOutcome::Failed { error })
            }
        }
    }

    async fn run_stages(
        &self,
        claimed: &Message,
        claim_seq: i64,
    ) -> Result<(Message, usize), PipelineError> {
        let (session, context) = self.assembler.assemble(&claimed.session_id).await?;

        let history = self
            .store
            .get_history(&session.id, self.options.history_limit)
            .await
            .map_err(|e| PipelineError::TransientIo(format!("load history: {e:#}")))?;
        let turns = build_turns(&history, claimed);

        let system_prompt = build_system_prompt(
            self.options.system_prompt.as_deref(),
            &context,
            self.options.context_max_chars,
        );

        let answer = self
            .generator
            .generate(Some(&system_prompt), &turns)
            .await
            .map_err(|e| PipelineError::GenerationExhausted {
                attempts: self.options.generation_attempts,
                message: format!("{e:#}"),
            })?;

        let resolved = self
            .resolver
            .resolve(&claimed.content, &answer, &context.chunks)
            .await;

        let reply = self
            .writer
            .write(claimed, &answer, claim_seq, &resolved)
            .await
            .map_err(|e| PipelineError::TransientIo(format!("write reply: {e:#}")))?;

        Ok((reply, resolved.len()))
    }
}

/// Conversation turns for the generator: prior completed exchanges followed by
/// the message being processed.
fn build_turns(history: &[Message], claimed: &Message) -> Vec<ChatTurn> {
    let mut turns: Vec<ChatTurn> = history
        .iter()
        .filter(|m| m.id != claimed.id && m.status == MessageStatus::Completed)
        .filter_map(|m| match m.role {
            MessageRole::User => Some(ChatTurn::user(&m.content)),
            MessageRole::Assistant => Some(ChatTurn::assistant(&m.content)),
            MessageRole::System => None,
        })
        .collect();
    turns.push(ChatTurn::user(&claimed.content));
    turns
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}

/// System prompt carrying the grounding context. Always returns instructions;
/// the document block is appended only when context survived assembly.
fn build_system_prompt(base: Option<&str>, context: &AssembledContext, max_chars: usize) -> String {
    let mut prompt = base.unwrap_or(DEFAULT_SYSTEM_PROMPT).to_string();

    if context.grounded {
        let body = if context.text.is_empty() {
            // Blob text degraded; the chunks still carry the content.
            context
                .chunks
                .iter()
                .map(|c| c.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n")
        } else {
            context.text.clone()
        };

        prompt.push_str("\n\n# Document");
        if let Some(title) = &context.document_title {
            prompt.push_str(": ");
            prompt.push_str(title);
        }
        prompt.push('\n');
        prompt.push_str(truncate_chars(&body, max_chars));
    } else {
        prompt.push_str(
            "\n\nNo document context is available for this conversation; answer from the \
             conversation alone and say that the document could not be consulted if asked \
             about it.",
        );
    }

    prompt
}
