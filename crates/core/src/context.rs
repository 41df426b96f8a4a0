use crate::models::{AssembledContext, Citation, RetrievalResult};
use crate::tokens::count_tokens;
use std::collections::HashSet;
use tracing::debug;

const BLOCK_SEPARATOR: &str = "\n\n";

/// Packs retrieved chunks into a prompt context under a token budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextAssembler;

impl ContextAssembler {
    pub fn new() -> Self {
        Self
    }

    /// Greedy in ranking order: each chunk is rendered as `[n] text` and
    /// added whole while the running token count stays within
    /// `max_context_tokens`. The first chunk that does not fit ends the
    /// context; chunks are never truncated.
    pub fn assemble(&self, results: &[RetrievalResult], max_context_tokens: usize) -> AssembledContext {
        let mut ordered: Vec<&RetrievalResult> = results.iter().collect();
        ordered.sort_by(|left, right| left.ranking_cmp(right));

        let mut context = AssembledContext::default();
        let mut seen = HashSet::new();

        for result in ordered {
            if !seen.insert(result.chunk_id.as_str()) {
                continue;
            }

            let marker = format!("[{}]", context.included.len() + 1);
            let block = format!("{marker} {}", result.text);
            let cost = count_tokens(&block);
            if context.token_count + cost > max_context_tokens {
                debug!(
                    chunk_id = %result.chunk_id,
                    cost,
                    used = context.token_count,
                    budget = max_context_tokens,
                    "context budget reached"
                );
                break;
            }

            if !context.text.is_empty() {
                context.text.push_str(BLOCK_SEPARATOR);
            }
            context.text.push_str(&block);
            context.token_count += cost;
            context.included.push(result.chunk_id.clone());
            context.citations.insert(
                marker,
                Citation {
                    chunk_id: result.chunk_id.clone(),
                    document_id: result.document_id.clone(),
                    source_uri: result.source_uri().map(str::to_string),
                },
            );
        }

        context
    }
}
