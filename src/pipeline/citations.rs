//! Citation resolution: pick the chunks that back an answer and compute
//! renderable highlight spans.
//!
//! `compute_highlight` is deliberately a pure function over
//! `(text, start, end)` — the server stores only offsets it has validated
//! here, and any renderer can recompute identical segments.

use crate::embedding::{EmbeddingProvider, bytes_to_vec, cosine_similarity};
use crate::store::types::{Chunk, NewCitation};
use std::collections::HashSet;
use std::sync::Arc;

/// Plain-excerpt length when no valid highlight exists.
pub const EXCERPT_LIMIT: usize = 220;
/// Context shown on each side of a highlighted span.
pub const CONTEXT_WINDOW: usize = 80;

const MIN_SPAN_CHARS: usize = 15;

/// Renderable evidence for one citation. All boundaries are in characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Highlight {
    /// No valid span: a leading excerpt of the chunk text.
    Excerpt { text: String, truncated: bool },
    /// Pre-context window, highlighted body, post-context window. The
    /// `elided` flags mark whether an ellipsis belongs before/after because
    /// the window stops short of the text boundary.
    Span {
        prefix: String,
        prefix_elided: bool,
        body: String,
        suffix: String,
        suffix_elided: bool,
    },
}

fn byte_index(text: &str, char_index: usize) -> usize {
    text.char_indices()
        .nth(char_index)
        .map_or(text.len(), |(i, _)| i)
}

fn slice_chars(text: &str, from: usize, to: usize) -> &str {
    &text[byte_index(text, from)..byte_index(text, to)]
}

fn excerpt(text: &str, char_len: usize) -> Highlight {
    Highlight::Excerpt {
        text: slice_chars(text, 0, char_len.min(EXCERPT_LIMIT)).to_string(),
        truncated: char_len > EXCERPT_LIMIT,
    }
}

/// Compute highlight segments for proposed offsets into `text`.
///
/// Invalid offsets (missing, negative start, `end <= start`, start past the
/// end of the text) fall back to a plain excerpt; valid ones are clamped into
/// range. Pure and deterministic: identical inputs always produce identical
/// segment boundaries.
pub fn compute_highlight(text: &str, start: Option<i64>, end: Option<i64>) -> Highlight {
    let len = text.chars().count();

    let (Some(raw_start), Some(raw_end)) = (start, end) else {
        return excerpt(text, len);
    };
    if raw_start < 0 || raw_end <= raw_start {
        return excerpt(text, len);
    }

    let start = usize::try_from(raw_start).unwrap_or(usize::MAX);
    if start >= len {
        return excerpt(text, len);
    }
    let end = usize::try_from(raw_end).unwrap_or(usize::MAX).min(len);

    let prefix_start = start.saturating_sub(CONTEXT_WINDOW);
    let suffix_end = end.saturating_add(CONTEXT_WINDOW).min(len);

    Highlight::Span {
        prefix: slice_chars(text, prefix_start, start).to_string(),
        prefix_elided: prefix_start > 0,
        body: slice_chars(text, start, end).to_string(),
        suffix: slice_chars(text, end, suffix_end).to_string(),
        suffix_elided: suffix_end < len,
    }
}

/// Source label shown next to a citation.
pub fn display_label(chunk: &Chunk) -> String {
    if let Some(page) = chunk.page_number {
        format!("p.{page}")
    } else if let Some(slide) = chunk.slide_number {
        format!("slide {slide}")
    } else {
        format!("chunk {}", chunk.chunk_index)
    }
}

/// A chunk with its relevance score, pre-ordering.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: Option<f64>,
}

/// Display order: similarity descending, missing scores as 0, ties broken by
/// ordinal chunk index ascending.
pub fn order_for_display(mut scored: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
    scored.sort_by(|a, b| {
        let score_a = a.score.unwrap_or(0.0);
        let score_b = b.score.unwrap_or(0.0);
        score_b
            .total_cmp(&score_a)
            .then_with(|| a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
    });
    scored
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}

/// Term-overlap relevance (Jaccard) for chunks without embeddings.
pub fn lexical_score(query: &str, text: &str) -> f64 {
    let query_terms = terms(query);
    let text_terms = terms(text);
    if query_terms.is_empty() || text_terms.is_empty() {
        return 0.0;
    }

    let shared = query_terms.intersection(&text_terms).count();
    let union = query_terms.union(&text_terms).count();
    #[allow(clippy::cast_precision_loss)]
    let score = shared as f64 / union as f64;
    score
}

/// Locate a piece of the answer inside the chunk text, as char offsets.
///
/// Whole sentences are tried first; clause-level splits then catch quoted
/// content sitting behind framing text ("As the document says, ..."). Only
/// candidates long enough to be distinctive are considered, and the first
/// match wins, which keeps the proposal deterministic.
pub fn find_answer_span(chunk_text: &str, answer: &str) -> Option<(i64, i64)> {
    locate_any(chunk_text, answer.split(['.', '!', '?', '\n'])).or_else(|| {
        locate_any(chunk_text, answer.split(['.', '!', '?', '\n', ',', ';', ':']))
    })
}

fn locate_any<'a>(
    chunk_text: &str,
    candidates: impl Iterator<Item = &'a str>,
) -> Option<(i64, i64)> {
    for candidate in candidates {
        let needle = candidate.trim();
        if needle.chars().count() < MIN_SPAN_CHARS {
            continue;
        }
        if let Some(span) = locate(chunk_text, needle) {
            return Some(span);
        }
    }
    None
}

fn locate(chunk_text: &str, needle: &str) -> Option<(i64, i64)> {
    if let Some(byte_pos) = chunk_text.find(needle) {
        let start = chunk_text[..byte_pos].chars().count();
        let end = start + needle.chars().count();
        return Some((start as i64, end as i64));
    }

    // Case-insensitive fallback, only when lowercasing preserves char
    // positions in the haystack. The end offset comes from the matched
    // region, since lowercasing the needle can change its char count.
    let hay = chunk_text.to_lowercase();
    if hay.chars().count() != chunk_text.chars().count() {
        return None;
    }
    let needle_lower = needle.to_lowercase();
    let byte_pos = hay.find(&needle_lower)?;
    let start = hay[..byte_pos].chars().count();
    let end = hay[..byte_pos + needle_lower.len()].chars().count();
    Some((start as i64, end as i64))
}

/// One citation ready for persistence and rendering.
#[derive(Debug, Clone)]
pub struct ResolvedCitation {
    pub chunk: Chunk,
    pub label: String,
    pub similarity: Option<f64>,
    pub highlight: Highlight,
    pub highlight_start: Option<i64>,
    pub highlight_end: Option<i64>,
}

impl ResolvedCitation {
    pub fn to_new_citation(&self) -> NewCitation {
        NewCitation {
            chunk_id: self.chunk.id.clone(),
            similarity: self.similarity,
            highlight_start: self.highlight_start,
            highlight_end: self.highlight_end,
        }
    }
}

/// Selects supporting chunks for an answer and computes their highlights.
pub struct CitationResolver {
    embedder: Arc<dyn EmbeddingProvider>,
    top_k: usize,
}

impl CitationResolver {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, top_k: usize) -> Self {
        Self {
            embedder,
            top_k: top_k.max(1),
        }
    }

    /// An empty result is valid: it means no evidence was found.
    pub async fn resolve(
        &self,
        question: &str,
        answer: &str,
        chunks: &[Chunk],
    ) -> Vec<ResolvedCitation> {
        if chunks.is_empty() {
            return Vec::new();
        }

        let query_vector = if self.embedder.dimensions() > 0 {
            match self.embedder.embed_one(question).await {
                Ok(vector) => Some(vector),
                Err(error) => {
                    tracing::warn!(
                        provider = self.embedder.name(),
                        "query embedding failed, falling back to lexical scoring: {error}"
                    );
                    None
                }
            }
        } else {
            None
        };

        let query_text = format!("{question} {answer}");
        let mut scored = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let score = match (&query_vector, &chunk.embedding) {
                (Some(query), Some(bytes)) => {
                    f64::from(cosine_similarity(query, &bytes_to_vec(bytes)))
                }
                _ => lexical_score(&query_text, &chunk.text),
            };
            if score > 0.0 {
                scored.push(ScoredChunk {
                    chunk: chunk.clone(),
                    score: Some(score),
                });
            }
        }

        let mut ordered = order_for_display(scored);
        ordered.truncate(self.top_k);

        ordered
            .into_iter()
            .map(|entry| {
                let proposed = find_answer_span(&entry.chunk.text, answer);
                let (start, end) = proposed.map_or((None, None), |(s, e)| (Some(s), Some(e)));
                let highlight = compute_highlight(&entry.chunk.text, start, end);
                // Store offsets only when they produced a real span; bad
                // offsets are a cosmetic issue, never a pipeline failure.
                let (highlight_start, highlight_end) = match highlight {
                    Highlight::Span { .. } => (start, end),
                    Highlight::Excerpt { .. } => (None, None),
                };
                ResolvedCitation {
                    label: display_label(&entry.chunk),
                    similarity: entry.score,
                    highlight,
                    highlight_start,
                    highlight_end,
                    chunk: entry.chunk,
                }
            })
            .collect()
    }
}
