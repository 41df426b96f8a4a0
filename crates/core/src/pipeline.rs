use crate::cancel::CancelSignal;
use crate::chunking::{content_hash, normalize_text, Chunker, CONTENT_HASH_KEY};
use crate::embeddings::EmbeddingClient;
use crate::error::{EmbeddingError, IndexError, IngestError};
use crate::models::{
    Document, IngestOutcome, IngestRequest, IngestionState, MetadataValue, VectorIndexEntry,
};
use crate::traits::{Loader, VectorIndex};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const ROLLBACK_ATTEMPTS: u32 = 3;
const ROLLBACK_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct DocumentRecord {
    document: Option<Document>,
    state: IngestionState,
    chunk_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Documents whose last attempt completed.
    pub documents: usize,
    /// Chunks held by those documents.
    pub chunks: usize,
    /// Failed attempts since start.
    pub failed: usize,
}

/// Tracks one ingestion attempt through the state machine.
struct Attempt {
    source_uri: String,
    document_id: Option<String>,
    state: IngestionState,
}

impl Attempt {
    fn new(source_uri: &str) -> Self {
        Self {
            source_uri: source_uri.to_string(),
            document_id: None,
            state: IngestionState::Pending,
        }
    }

    fn advance(&mut self, next: IngestionState) -> Result<(), IngestError> {
        if !self.state.can_transition_to(next) {
            return Err(IngestError::InvalidArgument(format!(
                "illegal ingestion transition {} -> {next}",
                self.state
            )));
        }
        debug!(
            source_uri = %self.source_uri,
            document_id = self.document_id.as_deref().unwrap_or("-"),
            from = %self.state,
            to = %next,
            "ingestion transition"
        );
        self.state = next;
        Ok(())
    }

    fn document_id(&self) -> String {
        self.document_id
            .clone()
            .unwrap_or_else(|| self.source_uri.clone())
    }

    fn fail(&mut self, error: IngestError) -> IngestError {
        let stage = self.state;
        if !stage.is_terminal() {
            self.state = IngestionState::Failed;
        }
        let document_id = self.document_id();
        warn!(
            source_uri = %self.source_uri,
            document_id = %document_id,
            stage = %stage,
            error = %error,
            "ingestion failed"
        );
        IngestError::StageFailed {
            document_id,
            stage,
            source: Box::new(error),
        }
    }
}

fn embedding_failure(error: EmbeddingError) -> IngestError {
    match error {
        EmbeddingError::Cancelled => IngestError::Cancelled,
        other => IngestError::Embedding(other),
    }
}

/// Runs documents through load, chunk, embed, and index.
///
/// Distinct documents may be ingested concurrently; attempts for the same
/// document id are serialized.
pub struct IngestionPipeline {
    loader: Arc<dyn Loader>,
    chunker: Chunker,
    embedder: EmbeddingClient,
    index: Arc<dyn VectorIndex>,
    registry: Mutex<HashMap<String, DocumentRecord>>,
    document_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    failed: AtomicUsize,
    ingestion_timeout: Option<Duration>,
}

impl IngestionPipeline {
    pub fn new(
        loader: Arc<dyn Loader>,
        chunker: Chunker,
        embedder: EmbeddingClient,
        index: Arc<dyn VectorIndex>,
    ) -> Result<Self, IngestError> {
        if embedder.dimension() != index.dimension() {
            return Err(IngestError::Index(
                IndexError::DimensionMismatch {
                    expected: index.dimension(),
                    actual: embedder.dimension(),
                },
            ));
        }
        Ok(Self {
            loader,
            chunker,
            embedder,
            index,
            registry: Mutex::new(HashMap::new()),
            document_locks: Mutex::new(HashMap::new()),
            failed: AtomicUsize::new(0),
            ingestion_timeout: None,
        })
    }

    pub fn with_ingestion_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ingestion_timeout = timeout;
        self
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Ingests one source. Returns the outcome on `Completed`; any failure is
    /// a [`IngestError::StageFailed`] naming the document and stage, after
    /// this attempt's index writes have been rolled back.
    pub async fn ingest(
        &self,
        request: IngestRequest,
        cancel: &CancelSignal,
    ) -> Result<IngestOutcome, IngestError> {
        let cancel = cancel.clone().with_optional_timeout(self.ingestion_timeout);
        let mut attempt = Attempt::new(&request.source_uri);

        attempt.advance(IngestionState::Loading)?;
        let loaded = match cancel.run(self.loader.load(&request.source_uri)).await {
            None => return Err(self.record_failure(&mut attempt, IngestError::Cancelled).await),
            Some(Err(error)) => return Err(self.record_failure(&mut attempt, error.into()).await),
            Some(Ok(loaded)) => loaded,
        };
        attempt.document_id = Some(loaded.document_id.clone());

        let text = normalize_text(&loaded.text);
        let hash = content_hash(&text);
        let mut metadata = loaded.metadata;
        metadata.extend(request.metadata);
        let document = Document {
            id: loaded.document_id,
            source_uri: loaded.source_uri,
            format: loaded.format,
            content_hash: hash,
            metadata,
            ingested_at: Utc::now(),
        };

        let document_id = document.id.clone();
        let lock = self.document_lock(&document_id).await;
        let result = {
            let _serialized = lock.lock().await;
            self.ingest_document(&mut attempt, document, &text, &cancel)
                .await
        };
        self.release_document_lock(&document_id, lock).await;
        result
    }

    /// Everything after loading. Runs with the document lock held.
    async fn ingest_document(
        &self,
        attempt: &mut Attempt,
        document: Document,
        text: &str,
        cancel: &CancelSignal,
    ) -> Result<IngestOutcome, IngestError> {
        match self.unchanged_chunk_count(&document).await {
            Err(error) => return Err(self.record_failure(attempt, error).await),
            Ok(Some(chunk_count)) => {
                attempt.advance(IngestionState::Completed)?;
                info!(document_id = %document.id, chunk_count, "content unchanged, skipping stages");
                return Ok(IngestOutcome {
                    document_id: document.id,
                    source_uri: document.source_uri,
                    state: IngestionState::Completed,
                    chunk_count,
                    unchanged: true,
                });
            }
            Ok(None) => {}
        }
        self.set_state(&document.id, IngestionState::Loading).await;

        let mut written = Vec::new();
        match self
            .run_stages(attempt, &document, text, cancel, &mut written)
            .await
        {
            Ok(chunk_ids) => {
                attempt.advance(IngestionState::Completed)?;
                let chunk_count = chunk_ids.len();
                self.registry.lock().await.insert(
                    document.id.clone(),
                    DocumentRecord {
                        document: Some(document.clone()),
                        state: IngestionState::Completed,
                        chunk_ids,
                    },
                );
                info!(
                    document_id = %document.id,
                    source_uri = %document.source_uri,
                    chunk_count,
                    "document ingested"
                );
                Ok(IngestOutcome {
                    document_id: document.id,
                    source_uri: document.source_uri,
                    state: IngestionState::Completed,
                    chunk_count,
                    unchanged: false,
                })
            }
            Err(error) => {
                let error = match self.roll_back(&document.id, &written).await {
                    Ok(()) => error,
                    Err(rollback) => IngestError::RollbackFailed {
                        orphaned: written,
                        cause: Box::new(error),
                        source: rollback,
                    },
                };
                Err(self.record_failure(attempt, error).await)
            }
        }
    }

    /// Chunking, embedding, and indexing. Ids written to the index by this
    /// attempt are pushed to `written` as soon as the write is issued.
    async fn run_stages(
        &self,
        attempt: &mut Attempt,
        document: &Document,
        text: &str,
        cancel: &CancelSignal,
        written: &mut Vec<String>,
    ) -> Result<Vec<String>, IngestError> {
        attempt.advance(IngestionState::Chunking)?;
        self.set_state(&document.id, IngestionState::Chunking).await;
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        let chunks = self.chunker.chunk(document, text);
        debug!(document_id = %document.id, chunk_count = chunks.len(), "chunked document");

        attempt.advance(IngestionState::Embedding)?;
        self.set_state(&document.id, IngestionState::Embedding).await;
        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let vectors = self
            .embedder
            .embed_texts(&texts, cancel)
            .await
            .map_err(embedding_failure)?;

        attempt.advance(IngestionState::Indexing)?;
        self.set_state(&document.id, IngestionState::Indexing).await;
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        let previous: BTreeSet<String> = self
            .index
            .document_chunk_ids(&document.id)
            .await?
            .into_iter()
            .collect();
        let entries: Vec<VectorIndexEntry> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorIndexEntry::from_chunk(chunk, vector))
            .collect();
        let chunk_ids: Vec<String> = chunks.iter().map(|chunk| chunk.id.clone()).collect();

        written.extend(
            chunk_ids
                .iter()
                .filter(|chunk_id| !previous.contains(*chunk_id))
                .cloned(),
        );
        match cancel.run(self.index.upsert(entries)).await {
            None => return Err(IngestError::Cancelled),
            Some(result) => result?,
        }

        let current: BTreeSet<&String> = chunk_ids.iter().collect();
        let stale: Vec<String> = previous
            .into_iter()
            .filter(|chunk_id| !current.contains(chunk_id))
            .collect();
        if !stale.is_empty() {
            self.index.delete(&stale).await?;
            debug!(document_id = %document.id, removed = stale.len(), "removed superseded chunks");
        }

        Ok(chunk_ids)
    }

    /// Deletes `written`, retrying with a short backoff. The error of the
    /// last attempt is returned when every attempt fails.
    async fn roll_back(&self, document_id: &str, written: &[String]) -> Result<(), IndexError> {
        if written.is_empty() {
            return Ok(());
        }
        let mut attempt = 1;
        loop {
            match self.index.delete(written).await {
                Ok(()) => {
                    debug!(document_id, removed = written.len(), "rolled back partial index writes");
                    return Ok(());
                }
                Err(error) if attempt < ROLLBACK_ATTEMPTS => {
                    warn!(document_id, attempt, error = %error, "rollback delete failed, retrying");
                    tokio::time::sleep(ROLLBACK_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(error) => {
                    warn!(
                        document_id,
                        orphaned = written.len(),
                        error = %error,
                        "rollback of partial index writes failed"
                    );
                    return Err(error);
                }
            }
        }
    }

    async fn record_failure(&self, attempt: &mut Attempt, error: IngestError) -> IngestError {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if let Some(document_id) = attempt.document_id.clone() {
            self.set_state(&document_id, IngestionState::Failed).await;
        }
        attempt.fail(error)
    }

    /// Chunk count of the stored version when its content hash equals
    /// `document`'s. Falls back to the hashes stored with the chunks in the
    /// index when this process has no completed record of the document.
    async fn unchanged_chunk_count(&self, document: &Document) -> Result<Option<usize>, IngestError> {
        {
            let registry = self.registry.lock().await;
            if let Some(record) = registry.get(&document.id) {
                if let (IngestionState::Completed, Some(previous)) = (record.state, &record.document) {
                    return Ok((previous.content_hash == document.content_hash)
                        .then_some(record.chunk_ids.len()));
                }
            }
        }

        let stored = self.index.document_entries(&document.id).await?;
        let expected = MetadataValue::Text(document.content_hash.clone());
        let matches = !stored.is_empty()
            && stored
                .iter()
                .all(|chunk| chunk.metadata.get(CONTENT_HASH_KEY) == Some(&expected));
        if !matches {
            return Ok(None);
        }

        let chunk_ids: Vec<String> = stored.into_iter().map(|chunk| chunk.chunk_id).collect();
        let chunk_count = chunk_ids.len();
        self.registry.lock().await.insert(
            document.id.clone(),
            DocumentRecord {
                document: Some(document.clone()),
                state: IngestionState::Completed,
                chunk_ids,
            },
        );
        debug!(document_id = %document.id, chunk_count, "matched stored content hash");
        Ok(Some(chunk_count))
    }

    async fn set_state(&self, document_id: &str, state: IngestionState) {
        let mut registry = self.registry.lock().await;
        registry
            .entry(document_id.to_string())
            .and_modify(|record| record.state = state)
            .or_insert_with(|| DocumentRecord {
                document: None,
                state,
                chunk_ids: Vec::new(),
            });
    }

    async fn document_lock(&self, document_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.document_locks.lock().await;
        Arc::clone(locks.entry(document_id.to_string()).or_default())
    }

    /// Drops the map entry once `lock` and the map are its only holders.
    /// New holders clone from the map under the map lock, so the count
    /// cannot grow while it is checked.
    async fn release_document_lock(&self, document_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.document_locks.lock().await;
        if Arc::strong_count(&lock) == 2 {
            locks.remove(document_id);
        }
    }

    /// Deletes every index entry of `document_id`. Returns how many were removed.
    pub async fn remove(&self, document_id: &str) -> Result<usize, IngestError> {
        let lock = self.document_lock(document_id).await;
        let result = {
            let _serialized = lock.lock().await;
            self.remove_document(document_id).await
        };
        self.release_document_lock(document_id, lock).await;
        result
    }

    async fn remove_document(&self, document_id: &str) -> Result<usize, IngestError> {
        let chunk_ids = self.index.document_chunk_ids(document_id).await?;
        self.index.delete(&chunk_ids).await?;
        self.registry.lock().await.remove(document_id);
        info!(document_id, removed = chunk_ids.len(), "document removed");
        Ok(chunk_ids.len())
    }

    pub async fn document_state(&self, document_id: &str) -> Option<IngestionState> {
        self.registry
            .lock()
            .await
            .get(document_id)
            .map(|record| record.state)
    }

    pub async fn stats(&self) -> PipelineStats {
        let registry = self.registry.lock().await;
        let completed = registry
            .values()
            .filter(|record| record.state == IngestionState::Completed);
        let (documents, chunks) = completed.fold((0, 0), |(documents, chunks), record| {
            (documents + 1, chunks + record.chunk_ids.len())
        });
        PipelineStats {
            documents,
            chunks,
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

struct IngestJob {
    request: IngestRequest,
    cancel: CancelSignal,
    reply: oneshot::Sender<Result<IngestOutcome, IngestError>>,
}

/// Receipt for a queued ingestion.
#[derive(Debug)]
pub struct IngestTicket {
    source_uri: String,
    receiver: oneshot::Receiver<Result<IngestOutcome, IngestError>>,
}

impl IngestTicket {
    pub fn source_uri(&self) -> &str {
        &self.source_uri
    }

    /// Waits for the worker to finish this request.
    pub async fn wait(self) -> Result<IngestOutcome, IngestError> {
        self.receiver.await.map_err(|_| IngestError::ShutDown)?
    }
}

/// Bounded ingestion queue drained by a fixed pool of workers.
pub struct IngestionService {
    sender: Mutex<Option<mpsc::Sender<IngestJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
}

impl IngestionService {
    /// Spawns `concurrency` workers onto the current tokio runtime.
    pub fn start(pipeline: Arc<IngestionPipeline>, concurrency: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel::<IngestJob>(capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..concurrency.max(1))
            .map(|worker| {
                let pipeline = Arc::clone(&pipeline);
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    loop {
                        let job = { receiver.lock().await.recv().await };
                        let Some(job) = job else {
                            debug!(worker, "ingestion worker stopping");
                            break;
                        };
                        let result = pipeline.ingest(job.request, &job.cancel).await;
                        let _ = job.reply.send(result);
                    }
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queues `request`, or rejects it with [`IngestError::QueueFull`] when
    /// the queue is at capacity.
    pub async fn submit(
        &self,
        request: IngestRequest,
        cancel: CancelSignal,
    ) -> Result<IngestTicket, IngestError> {
        let guard = self.sender.lock().await;
        let sender = guard.as_ref().ok_or(IngestError::ShutDown)?;

        let (reply, receiver) = oneshot::channel();
        let source_uri = request.source_uri.clone();
        let job = IngestJob {
            request,
            cancel,
            reply,
        };

        match sender.try_send(job) {
            Ok(()) => Ok(IngestTicket {
                source_uri,
                receiver,
            }),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(source_uri = %source_uri, capacity = self.capacity, "ingestion queue full");
                Err(IngestError::QueueFull(self.capacity))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(IngestError::ShutDown),
        }
    }

    /// Stops accepting work, lets queued jobs drain, and waits for the workers.
    pub async fn shutdown(&self) {
        self.sender.lock().await.take();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            if let Err(error) = worker.await {
                warn!(error = %error, "ingestion worker ended abnormally");
            }
        }
    }
}
