use crate::embeddings::cosine_similarity;
use crate::error::IndexError;
use crate::models::{IndexHit, MetadataFilter, StoredChunk, VectorIndexEntry};
use crate::stores::snapshot::{read_snapshot, write_snapshot};
use crate::traits::VectorIndex;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Brute-force cosine index held in memory, optionally mirrored to a
/// JSON Lines snapshot after every mutation.
pub struct ExactIndex {
    dimension: usize,
    snapshot_path: Option<PathBuf>,
    state: Arc<RwLock<IndexState>>,
}

#[derive(Debug, Clone, Default)]
struct IndexState {
    entries: HashMap<String, VectorIndexEntry>,
    by_document: HashMap<String, BTreeSet<String>>,
}

impl IndexState {
    fn insert(&mut self, entry: VectorIndexEntry) {
        if let Some(previous) = self.entries.get(&entry.chunk_id) {
            if previous.document_id != entry.document_id {
                let previous_document = previous.document_id.clone();
                self.unlink(&previous_document, &entry.chunk_id);
            }
        }
        self.by_document
            .entry(entry.document_id.clone())
            .or_default()
            .insert(entry.chunk_id.clone());
        self.entries.insert(entry.chunk_id.clone(), entry);
    }

    fn remove(&mut self, chunk_id: &str) {
        if let Some(entry) = self.entries.remove(chunk_id) {
            self.unlink(&entry.document_id, chunk_id);
        }
    }

    fn unlink(&mut self, document_id: &str, chunk_id: &str) {
        if let Some(ids) = self.by_document.get_mut(document_id) {
            ids.remove(chunk_id);
            if ids.is_empty() {
                self.by_document.remove(document_id);
            }
        }
    }
}

impl ExactIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            snapshot_path: None,
            state: Arc::new(RwLock::new(IndexState::default())),
        }
    }

    /// Loads `path` if it exists and persists every later mutation back to it.
    pub fn open(path: impl Into<PathBuf>, dimension: usize) -> Result<Self, IndexError> {
        let path = path.into();
        let mut state = IndexState::default();
        for entry in read_snapshot(&path, dimension)? {
            state.insert(entry);
        }
        debug!(
            path = %path.display(),
            entries = state.entries.len(),
            "loaded index snapshot"
        );

        Ok(Self {
            dimension,
            snapshot_path: Some(path),
            state: Arc::new(RwLock::new(state)),
        })
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    fn check_dimension(&self, actual: usize) -> Result<(), IndexError> {
        if actual != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual,
            });
        }
        Ok(())
    }

    /// Applies `change` under the write lock. With a snapshot configured the
    /// change is made on a copy that replaces the live state only once the
    /// snapshot write succeeded. The write and the swap run together on the
    /// blocking pool, which owns the lock until both are done, so a caller
    /// that stops waiting cannot leave the snapshot ahead of memory.
    async fn mutate<F>(&self, change: F) -> Result<(), IndexError>
    where
        F: FnOnce(&mut IndexState),
    {
        let Some(path) = &self.snapshot_path else {
            change(&mut *self.state.write().await);
            return Ok(());
        };

        let mut guard = Arc::clone(&self.state).write_owned().await;
        let mut next = guard.clone();
        change(&mut next);
        let target = path.clone();
        tokio::task::spawn_blocking(move || {
            write_snapshot(&target, next.entries.values())?;
            *guard = next;
            Ok::<(), IndexError>(())
        })
        .await
        .map_err(|error| IndexError::Snapshot {
            path: path.clone(),
            source: std::io::Error::other(error),
        })?
    }
}

#[async_trait]
impl VectorIndex for ExactIndex {
    fn backend(&self) -> &str {
        if self.snapshot_path.is_some() {
            "snapshot"
        } else {
            "memory"
        }
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, entries: Vec<VectorIndexEntry>) -> Result<(), IndexError> {
        if entries.is_empty() {
            return Ok(());
        }
        for entry in &entries {
            self.check_dimension(entry.vector.len())?;
        }

        let count = entries.len();
        self.mutate(move |state| {
            for entry in entries {
                state.insert(entry);
            }
        })
        .await?;
        debug!(backend = self.backend(), count, "upserted index entries");
        Ok(())
    }

    async fn delete(&self, chunk_ids: &[String]) -> Result<(), IndexError> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        self.mutate(|state| {
            for chunk_id in chunk_ids {
                state.remove(chunk_id);
            }
        })
        .await?;
        debug!(backend = self.backend(), count = chunk_ids.len(), "deleted index entries");
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexHit>, IndexError> {
        self.check_dimension(vector.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let state = self.state.read().await;
        let mut hits: Vec<IndexHit> = state
            .entries
            .values()
            .filter(|entry| filter.map_or(true, |filter| filter.matches(&entry.metadata)))
            .map(|entry| IndexHit {
                chunk_id: entry.chunk_id.clone(),
                document_id: entry.document_id.clone(),
                sequence_index: entry.sequence_index,
                score: cosine_similarity(vector, &entry.vector),
                text: entry.text.clone(),
                token_count: entry.token_count,
                metadata: entry.metadata.clone(),
            })
            .collect();
        drop(state);

        hits.sort_by(IndexHit::ranking_cmp);
        hits.truncate(k);
        Ok(hits)
    }

    async fn len(&self) -> Result<usize, IndexError> {
        Ok(self.state.read().await.entries.len())
    }

    async fn document_entries(&self, document_id: &str) -> Result<Vec<StoredChunk>, IndexError> {
        let state = self.state.read().await;
        let Some(ids) = state.by_document.get(document_id) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|chunk_id| state.entries.get(chunk_id))
            .map(|entry| StoredChunk {
                chunk_id: entry.chunk_id.clone(),
                metadata: entry.metadata.clone(),
            })
            .collect())
    }
}
