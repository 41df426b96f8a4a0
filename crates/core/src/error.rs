use crate::models::IngestionState;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("ingestion cancelled")]
    Cancelled,

    #[error("ingestion queue is full (capacity {0})")]
    QueueFull(usize),

    #[error("ingestion service is shut down")]
    ShutDown,

    /// The attempt failed and undoing its index writes failed too.
    #[error("{cause}; rollback left {} orphaned entries: {source}", .orphaned.len())]
    RollbackFailed {
        orphaned: Vec<String>,
        cause: Box<IngestError>,
        #[source]
        source: IndexError,
    },

    #[error("document {document_id} failed during {stage}: {source}")]
    StageFailed {
        document_id: String,
        stage: IngestionState,
        #[source]
        source: Box<IngestError>,
    },
}

impl IngestError {
    /// Stage at which the document failed, when this is a pipeline failure.
    pub fn failed_stage(&self) -> Option<IngestionState> {
        match self {
            IngestError::StageFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The innermost error, unwrapping any stage attribution.
    pub fn root(&self) -> &IngestError {
        match self {
            IngestError::StageFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("document parse error: {0}")]
    Parse(String),

    #[error("source not found: {0}")]
    NotFound(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Timeout, rate limit, or a server-side fault worth retrying.
    #[error("transient embedding failure: {0}")]
    Transient(String),

    /// Authentication failure or malformed input; never retried.
    #[error("permanent embedding failure: {0}")]
    Permanent(String),

    #[error("embedding failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("provider returned {actual} vectors for {expected} inputs")]
    CountMismatch { expected: usize, actual: usize },

    #[error("embedding cancelled")]
    Cancelled,
}

impl EmbeddingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbeddingError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("vector dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("snapshot schema version {found} is not supported (expected {expected})")]
    SnapshotVersion { expected: u32, found: u32 },

    #[error("snapshot io error at {path}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot record {line} in {path} is malformed: {source}")]
    SnapshotRecord {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

/// Read-path failures. "No results" is never one of these.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("search cancelled")]
    Cancelled,

    #[error("search request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Ingest(#[from] IngestError),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
