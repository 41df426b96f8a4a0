use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Scalar metadata value attached to documents, chunks, and index entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(value) => write!(f, "{value}"),
            MetadataValue::Integer(value) => write!(f, "{value}"),
            MetadataValue::Float(value) => write!(f, "{value}"),
            MetadataValue::Text(value) => f.write_str(value),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Integer(value)
    }
}

impl From<u64> for MetadataValue {
    fn from(value: u64) -> Self {
        MetadataValue::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Text,
    Markdown,
    Pdf,
}

impl DocumentFormat {
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "txt" | "text" => Some(DocumentFormat::Text),
            "md" | "markdown" => Some(DocumentFormat::Markdown),
            "pdf" => Some(DocumentFormat::Pdf),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Text => "text",
            DocumentFormat::Markdown => "markdown",
            DocumentFormat::Pdf => "pdf",
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source_uri: String,
    pub format: DocumentFormat,
    pub content_hash: String,
    pub metadata: Metadata,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub sequence_index: u64,
    pub text: String,
    pub token_count: usize,
    /// Byte offset of the chunk start in the source text.
    pub start_offset: usize,
    /// Byte offset one past the chunk end in the source text.
    pub end_offset: usize,
    /// Leading tokens repeated from the previous chunk.
    pub overlap_tokens: usize,
    pub metadata: Metadata,
}

/// One stored vector plus the chunk snapshot needed to answer queries
/// without a second lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorIndexEntry {
    pub chunk_id: String,
    pub document_id: String,
    pub sequence_index: u64,
    pub text: String,
    pub token_count: usize,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
}

impl VectorIndexEntry {
    pub fn from_chunk(chunk: &Chunk, vector: Vec<f32>) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            sequence_index: chunk.sequence_index,
            text: chunk.text.clone(),
            token_count: chunk.token_count,
            vector,
            metadata: chunk.metadata.clone(),
        }
    }
}

/// Id and metadata of one stored entry, without its vector or text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredChunk {
    pub chunk_id: String,
    pub metadata: Metadata,
}

/// Key/value equality predicates applied before scoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetadataFilter {
    pub equals: BTreeMap<String, MetadataValue>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.equals.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.equals
            .iter()
            .all(|(key, expected)| metadata.get(key) == Some(expected))
    }
}

/// Raw k-NN hit as returned by a [`crate::VectorIndex`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexHit {
    pub chunk_id: String,
    pub document_id: String,
    pub sequence_index: u64,
    pub score: f32,
    pub text: String,
    pub token_count: usize,
    pub metadata: Metadata,
}

impl IndexHit {
    /// Score descending, then sequence index, document id, and chunk id ascending.
    pub fn ranking_cmp(&self, other: &Self) -> Ordering {
        ranking_cmp(
            (self.score, self.sequence_index, self.document_id.as_str(), self.chunk_id.as_str()),
            (other.score, other.sequence_index, other.document_id.as_str(), other.chunk_id.as_str()),
        )
    }
}

fn ranking_cmp(left: (f32, u64, &str, &str), right: (f32, u64, &str, &str)) -> Ordering {
    right
        .0
        .total_cmp(&left.0)
        .then_with(|| left.1.cmp(&right.1))
        .then_with(|| left.2.cmp(right.2))
        .then_with(|| left.3.cmp(right.3))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk_id: String,
    pub document_id: String,
    pub sequence_index: u64,
    pub score: f32,
    pub rank: usize,
    pub text: String,
    pub token_count: usize,
    pub metadata: Metadata,
}

impl RetrievalResult {
    pub fn ranking_cmp(&self, other: &Self) -> Ordering {
        ranking_cmp(
            (self.score, self.sequence_index, self.document_id.as_str(), self.chunk_id.as_str()),
            (other.score, other.sequence_index, other.document_id.as_str(), other.chunk_id.as_str()),
        )
    }

    pub fn source_uri(&self) -> Option<&str> {
        match self.metadata.get("source_uri") {
            Some(MetadataValue::Text(uri)) => Some(uri.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    pub chunk_id: String,
    pub document_id: String,
    pub source_uri: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssembledContext {
    pub text: String,
    pub token_count: usize,
    /// Marker (e.g. `[1]`) to the chunk it cites.
    pub citations: BTreeMap<String, Citation>,
    /// Chunk ids in the order they appear in `text`.
    pub included: Vec<String>,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.included.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySession {
    pub query_text: String,
    pub retrieved: Vec<RetrievalResult>,
    pub assembled_context: String,
    pub citations: BTreeMap<String, Citation>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum IngestionState {
    Pending,
    Loading,
    Chunking,
    Embedding,
    Indexing,
    Completed,
    Failed,
}

impl IngestionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IngestionState::Completed | IngestionState::Failed)
    }

    /// Forward-only transitions; `Failed` is reachable from any live stage.
    pub fn can_transition_to(&self, next: IngestionState) -> bool {
        use IngestionState::*;
        match (self, next) {
            (Pending, Loading)
            | (Loading, Chunking)
            | (Chunking, Embedding)
            | (Embedding, Indexing)
            | (Indexing, Completed) => true,
            (Loading, Completed) => true,
            (current, Failed) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for IngestionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IngestionState::Pending => "pending",
            IngestionState::Loading => "loading",
            IngestionState::Chunking => "chunking",
            IngestionState::Embedding => "embedding",
            IngestionState::Indexing => "indexing",
            IngestionState::Completed => "completed",
            IngestionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub source_uri: String,
    pub metadata: Metadata,
}

impl IngestRequest {
    pub fn new(source_uri: impl Into<String>) -> Self {
        Self {
            source_uri: source_uri.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub document_id: String,
    pub source_uri: String,
    pub state: IngestionState,
    pub chunk_count: usize,
    /// True when the content hash was unchanged and no stage re-ran.
    pub unchanged: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_only_moves_forward() {
        use IngestionState::*;
        assert!(Pending.can_transition_to(Loading));
        assert!(Embedding.can_transition_to(Indexing));
        assert!(Embedding.can_transition_to(Failed));
        assert!(!Indexing.can_transition_to(Embedding));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Loading));
        assert!(!Pending.can_transition_to(Chunking));
    }

    #[test]
    fn filter_requires_every_predicate() {
        let mut metadata = Metadata::new();
        metadata.insert("lang".to_string(), "en".into());
        metadata.insert("year".to_string(), 2024i64.into());

        assert!(MetadataFilter::new().matches(&metadata));
        assert!(MetadataFilter::new().with("lang", "en").matches(&metadata));
        assert!(!MetadataFilter::new()
            .with("lang", "en")
            .with("year", 2023i64)
            .matches(&metadata));
        assert!(!MetadataFilter::new().with("missing", true).matches(&metadata));
    }

    #[test]
    fn metadata_values_deserialize_as_scalars() {
        let parsed: Metadata =
            serde_json::from_str(r#"{"a": "x", "b": 3, "c": 1.5, "d": false}"#).expect("valid json");
        assert_eq!(parsed["a"], MetadataValue::Text("x".to_string()));
        assert_eq!(parsed["b"], MetadataValue::Integer(3));
        assert_eq!(parsed["c"], MetadataValue::Float(1.5));
        assert_eq!(parsed["d"], MetadataValue::Bool(false));
    }

    #[test]
    fn format_is_resolved_from_extension() {
        assert_eq!(DocumentFormat::from_extension("MD"), Some(DocumentFormat::Markdown));
        assert_eq!(DocumentFormat::from_extension("pdf"), Some(DocumentFormat::Pdf));
        assert_eq!(DocumentFormat::from_extension("docx"), None);
    }
}
