pub mod cancel;
pub mod chunking;
pub mod config;
pub mod context;
pub mod embeddings;
pub mod error;
pub mod ingest;
pub mod loader;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod retriever;
pub mod stores;
pub mod tokens;
pub mod traits;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use chunking::{
    chunk_text, content_hash, normalize_text, reassemble, Chunker, ChunkingConfig, CONTENT_HASH_KEY,
};
pub use config::{load_config, parse_config, EngineConfig, IndexSettings, ProviderSettings};
pub use context::ContextAssembler;
pub use embeddings::{
    build_provider, cosine_similarity, CharacterNgramEmbedder, EmbeddingClient, EmbeddingProvider,
    HttpEmbeddingProvider, RetryPolicy, DEFAULT_EMBEDDING_DIMENSIONS, DEFAULT_NGRAM_SIZE,
};
pub use error::{ConfigError, EmbeddingError, IndexError, IngestError, LoaderError, SearchError};
pub use ingest::{discover_files, IngestionReport, SkippedSource};
pub use loader::{FileLoader, MemoryLoader};
pub use models::{
    AssembledContext, Chunk, Citation, Document, DocumentFormat, IndexHit, IngestOutcome,
    IngestRequest, IngestionState, Metadata, MetadataFilter, MetadataValue, QuerySession,
    RetrievalResult, StoredChunk, VectorIndexEntry,
};
pub use orchestrator::{Answer, EngineStats, RagEngine};
pub use pipeline::{IngestTicket, IngestionPipeline, IngestionService, PipelineStats};
pub use retriever::{RetrievalRequest, Retriever, RetrieverSettings};
pub use stores::{build_index, ExactIndex, QdrantIndex};
pub use tokens::count_tokens;
pub use traits::{AnswerGenerator, LoadedDocument, Loader, VectorIndex};
