use crate::cancel::CancelSignal;
use crate::chunking::{Chunker, ChunkingConfig};
use crate::config::EngineConfig;
use crate::context::ContextAssembler;
use crate::embeddings::{build_provider, EmbeddingClient, EmbeddingProvider};
use crate::error::{ConfigError, IndexError, IngestError, SearchError};
use crate::ingest::{discover_files, IngestionReport};
use crate::loader::FileLoader;
use crate::models::{IngestOutcome, IngestRequest, IngestionState, QuerySession};
use crate::pipeline::{IngestTicket, IngestionPipeline, IngestionService};
use crate::retriever::{RetrievalRequest, Retriever, RetrieverSettings};
use crate::stores::build_index;
use crate::traits::{AnswerGenerator, Loader, VectorIndex};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub backend: String,
    pub index_entries: usize,
    pub documents: usize,
    pub chunks: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub session: QuerySession,
}

/// Wires ingestion and retrieval over one shared index.
pub struct RagEngine {
    config: EngineConfig,
    index: Arc<dyn VectorIndex>,
    pipeline: Arc<IngestionPipeline>,
    service: IngestionService,
    retriever: Retriever,
    assembler: ContextAssembler,
    generator: Option<Arc<dyn AnswerGenerator>>,
}

impl RagEngine {
    /// Builds the configured provider and index and reads sources from disk.
    pub async fn from_config(config: EngineConfig) -> Result<Self, ConfigError> {
        Self::with_loader(config, Arc::new(FileLoader)).await
    }

    pub async fn with_loader(config: EngineConfig, loader: Arc<dyn Loader>) -> Result<Self, ConfigError> {
        config.validate()?;
        let provider = build_provider(&config.embedding_provider, config.embedding_timeout())?;
        let index = build_index(&config.index, provider.dimension()).await?;
        Self::from_parts(config, loader, provider, index)
    }

    /// Assembles an engine from explicit collaborators. Must be called
    /// within a tokio runtime, which hosts the ingestion workers.
    pub fn from_parts(
        config: EngineConfig,
        loader: Arc<dyn Loader>,
        provider: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        // Queries get their own permits so a busy ingestion queue cannot starve them.
        let embedder = EmbeddingClient::from_config(Arc::clone(&provider), &config);
        let query_embedder = EmbeddingClient::from_config(provider, &config);
        let chunker = Chunker::new(ChunkingConfig::from(&config))?;

        let pipeline = Arc::new(
            IngestionPipeline::new(loader, chunker, embedder.clone(), Arc::clone(&index))?
                .with_ingestion_timeout(config.ingestion_timeout()),
        );
        let service = IngestionService::start(
            Arc::clone(&pipeline),
            config.ingestion_concurrency,
            config.ingestion_queue_capacity,
        );
        info!(
            provider = embedder.provider_name(),
            backend = index.backend(),
            dimension = index.dimension(),
            workers = config.ingestion_concurrency,
            "engine ready"
        );
        let retriever = Retriever::new(query_embedder, Arc::clone(&index), RetrieverSettings::from(&config));

        Ok(Self {
            config,
            index,
            pipeline,
            service,
            retriever,
            assembler: ContextAssembler::new(),
            generator: None,
        })
    }

    pub fn with_answer_generator(mut self, generator: Arc<dyn AnswerGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Queues one source and waits for its outcome. Rejected with
    /// [`IngestError::QueueFull`] when the ingestion queue is at capacity.
    pub async fn ingest_source(&self, request: IngestRequest) -> Result<IngestOutcome, IngestError> {
        self.submit(request, CancelSignal::never()).await?.wait().await
    }

    pub async fn submit(
        &self,
        request: IngestRequest,
        cancel: CancelSignal,
    ) -> Result<IngestTicket, IngestError> {
        self.service.submit(request, cancel).await
    }

    /// Ingests every supported file under `folder`. One file failing does
    /// not stop the others; the report lists both outcomes.
    pub async fn ingest_folder(&self, folder: &Path) -> Result<IngestionReport, IngestError> {
        let files = discover_files(folder);
        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no supported files found in {}",
                folder.display()
            )));
        }

        let mut report = IngestionReport::default();
        let mut pending: VecDeque<IngestTicket> = VecDeque::new();

        for path in files {
            let source_uri = path.to_string_lossy().to_string();
            loop {
                match self
                    .service
                    .submit(IngestRequest::new(source_uri.clone()), CancelSignal::never())
                    .await
                {
                    Ok(ticket) => {
                        pending.push_back(ticket);
                        break;
                    }
                    Err(IngestError::QueueFull(_)) => match pending.pop_front() {
                        Some(oldest) => {
                            let uri = oldest.source_uri().to_string();
                            report.record(&uri, oldest.wait().await);
                        }
                        None => tokio::time::sleep(QUEUE_FULL_BACKOFF).await,
                    },
                    Err(error) => {
                        report.record(&source_uri, Err(error));
                        break;
                    }
                }
            }
        }

        for ticket in pending {
            let uri = ticket.source_uri().to_string();
            report.record(&uri, ticket.wait().await);
        }

        for skipped in &report.skipped {
            warn!(source_uri = %skipped.source_uri, reason = %skipped.reason, "skipped source");
        }
        info!(
            folder = %folder.display(),
            completed = report.completed.len(),
            unchanged = report.unchanged(),
            skipped = report.skipped.len(),
            "folder ingestion finished"
        );
        Ok(report)
    }

    pub async fn remove_document(&self, document_id: &str) -> Result<usize, IngestError> {
        self.pipeline.remove(document_id).await
    }

    pub async fn document_state(&self, document_id: &str) -> Option<IngestionState> {
        self.pipeline.document_state(document_id).await
    }

    /// Retrieves with the configured defaults and assembles the context.
    pub async fn query(&self, query_text: &str) -> Result<QuerySession, SearchError> {
        self.query_with(
            RetrievalRequest::new(query_text, self.config.top_k, self.config.score_threshold),
            self.config.max_context_tokens,
        )
        .await
    }

    pub async fn query_with(
        &self,
        request: RetrievalRequest,
        max_context_tokens: usize,
    ) -> Result<QuerySession, SearchError> {
        let query_text = request.query_text.clone();
        let retrieved = self.retriever.retrieve_with(request).await?;
        let context = self.assembler.assemble(&retrieved, max_context_tokens);

        Ok(QuerySession {
            query_text,
            retrieved,
            assembled_context: context.text,
            citations: context.citations,
        })
    }

    /// Runs [`RagEngine::query`] and hands the assembled context, unchanged,
    /// to the configured answer generator.
    pub async fn answer(&self, query_text: &str) -> Result<Answer, SearchError> {
        let generator = self
            .generator
            .as_ref()
            .ok_or_else(|| SearchError::Request("no answer generator configured".to_string()))?;

        let session = self.query(query_text).await?;
        let text = generator
            .generate(&session.query_text, &session.assembled_context, &session.citations)
            .await?;
        Ok(Answer { text, session })
    }

    pub async fn stats(&self) -> Result<EngineStats, IndexError> {
        let pipeline = self.pipeline.stats().await;
        Ok(EngineStats {
            backend: self.index.backend().to_string(),
            index_entries: self.index.len().await?,
            documents: pipeline.documents,
            chunks: pipeline.chunks,
            failed: pipeline.failed,
        })
    }

    /// Drains queued ingestion and stops the workers.
    pub async fn shutdown(&self) {
        self.service.shutdown().await;
    }
}
