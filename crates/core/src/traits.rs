use crate::error::{IndexError, LoaderError, SearchError};
use crate::models::{
    Citation, DocumentFormat, IndexHit, Metadata, MetadataFilter, StoredChunk, VectorIndexEntry,
};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Similarity store over chunk embeddings.
///
/// Implementations must apply each `upsert`/`delete` batch atomically with
/// respect to concurrent `query` calls.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn backend(&self) -> &str;

    fn dimension(&self) -> usize;

    /// Inserts or replaces entries by `chunk_id`. A batch containing any
    /// vector of the wrong dimension is rejected as a whole.
    async fn upsert(&self, entries: Vec<VectorIndexEntry>) -> Result<(), IndexError>;

    /// Removes entries; unknown ids are ignored.
    async fn delete(&self, chunk_ids: &[String]) -> Result<(), IndexError>;

    /// Up to `k` entries ordered by descending cosine similarity.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexHit>, IndexError>;

    async fn len(&self) -> Result<usize, IndexError>;

    async fn is_empty(&self) -> Result<bool, IndexError> {
        Ok(self.len().await? == 0)
    }

    /// Every stored entry of `document_id`, ordered by chunk id.
    async fn document_entries(&self, document_id: &str) -> Result<Vec<StoredChunk>, IndexError>;

    async fn document_chunk_ids(&self, document_id: &str) -> Result<Vec<String>, IndexError> {
        Ok(self
            .document_entries(document_id)
            .await?
            .into_iter()
            .map(|stored| stored.chunk_id)
            .collect())
    }
}

/// Output of a [`Loader`]: extracted text plus what the source says about itself.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub document_id: String,
    pub source_uri: String,
    pub format: DocumentFormat,
    pub text: String,
    pub metadata: Metadata,
}

#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, source_uri: &str) -> Result<LoadedDocument, LoaderError>;
}

/// Final answer step. Receives the assembled context exactly as produced.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(
        &self,
        query_text: &str,
        context: &str,
        citations: &BTreeMap<String, Citation>,
    ) -> Result<String, SearchError>;
}
