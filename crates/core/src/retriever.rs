use crate::cancel::CancelSignal;
use crate::config::EngineConfig;
use crate::embeddings::EmbeddingClient;
use crate::error::{EmbeddingError, SearchError};
use crate::models::{IndexHit, MetadataFilter, RetrievalResult};
use crate::traits::VectorIndex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct RetrieverSettings {
    pub top_k: usize,
    pub score_threshold: f32,
    pub overfetch_factor: usize,
    /// Maximum sequence distance for two chunks to count as neighbours.
    pub dedup_window: u64,
    /// Token-set Jaccard similarity at which neighbours are duplicates.
    pub dedup_similarity: f64,
    pub query_timeout: Option<Duration>,
}

impl Default for RetrieverSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for RetrieverSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            top_k: config.top_k,
            score_threshold: config.score_threshold,
            overfetch_factor: config.overfetch_factor.max(1),
            dedup_window: config.dedup_window,
            dedup_similarity: config.dedup_similarity,
            query_timeout: config.query_timeout(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub query_text: String,
    pub top_k: usize,
    pub score_threshold: f32,
    pub filter: Option<MetadataFilter>,
    pub cancel: CancelSignal,
}

impl RetrievalRequest {
    pub fn new(query_text: impl Into<String>, top_k: usize, score_threshold: f32) -> Self {
        Self {
            query_text: query_text.into(),
            top_k,
            score_threshold,
            filter: None,
            cancel: CancelSignal::never(),
        }
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }
}

pub struct Retriever {
    embedder: EmbeddingClient,
    index: Arc<dyn VectorIndex>,
    settings: RetrieverSettings,
}

impl Retriever {
    pub fn new(embedder: EmbeddingClient, index: Arc<dyn VectorIndex>, settings: RetrieverSettings) -> Self {
        Self {
            embedder,
            index,
            settings,
        }
    }

    pub fn settings(&self) -> &RetrieverSettings {
        &self.settings
    }

    pub async fn retrieve(
        &self,
        query_text: &str,
        top_k: usize,
        score_threshold: f32,
    ) -> Result<Vec<RetrievalResult>, SearchError> {
        self.retrieve_with(RetrievalRequest::new(query_text, top_k, score_threshold))
            .await
    }

    /// Ranked, thresholded, deduplicated results, at most `top_k`.
    /// An empty query or an empty index yields no results.
    pub async fn retrieve_with(
        &self,
        request: RetrievalRequest,
    ) -> Result<Vec<RetrievalResult>, SearchError> {
        let query_text = request.query_text.trim();
        if query_text.is_empty() || request.top_k == 0 {
            return Ok(Vec::new());
        }
        if self.index.is_empty().await? {
            debug!("retrieval against empty index");
            return Ok(Vec::new());
        }

        let cancel = request
            .cancel
            .clone()
            .with_optional_timeout(self.settings.query_timeout);
        let vector = self
            .embedder
            .embed_query(query_text, &cancel)
            .await
            .map_err(|error| match error {
                EmbeddingError::Cancelled => SearchError::Cancelled,
                other => SearchError::Embedding(other),
            })?;

        let candidates_wanted = request.top_k.saturating_mul(self.settings.overfetch_factor);
        let candidates = cancel
            .run(
                self.index
                    .query(&vector, candidates_wanted, request.filter.as_ref()),
            )
            .await
            .ok_or(SearchError::Cancelled)??;
        let fetched = candidates.len();

        let mut kept: Vec<IndexHit> = candidates
            .into_iter()
            .filter(|hit| hit.score >= request.score_threshold)
            .collect();
        kept.sort_by(IndexHit::ranking_cmp);
        let kept = self.deduplicate(kept);

        let results: Vec<RetrievalResult> = kept
            .into_iter()
            .take(request.top_k)
            .enumerate()
            .map(|(rank, hit)| RetrievalResult {
                chunk_id: hit.chunk_id,
                document_id: hit.document_id,
                sequence_index: hit.sequence_index,
                score: hit.score,
                rank,
                text: hit.text,
                token_count: hit.token_count,
                metadata: hit.metadata,
            })
            .collect();

        debug!(
            fetched,
            returned = results.len(),
            top_k = request.top_k,
            "retrieval finished"
        );
        Ok(results)
    }

    /// Drops hits that repeat a better-ranked neighbour from the same document.
    /// `hits` must already be in ranking order.
    fn deduplicate(&self, hits: Vec<IndexHit>) -> Vec<IndexHit> {
        let mut kept: Vec<(IndexHit, HashSet<String>)> = Vec::with_capacity(hits.len());

        for hit in hits {
            let words = word_set(&hit.text);
            let duplicate = kept.iter().any(|(existing, existing_words)| {
                existing.document_id == hit.document_id
                    && existing.sequence_index.abs_diff(hit.sequence_index) <= self.settings.dedup_window
                    && jaccard(existing_words, &words) >= self.settings.dedup_similarity
            });
            if duplicate {
                debug!(chunk_id = %hit.chunk_id, "dropping near-duplicate chunk");
                continue;
            }
            kept.push((hit, words));
        }

        kept.into_iter().map(|(hit, _)| hit).collect()
    }
}

fn word_set(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|word| word.to_lowercase())
        .collect()
}

fn jaccard(left: &HashSet<String>, right: &HashSet<String>) -> f64 {
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    let shared = left.intersection(right).count();
    let union = left.len() + right.len() - shared;
    shared as f64 / union as f64
}
