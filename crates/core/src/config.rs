use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SNAPSHOT_PATH: &str = "docqa-index.jsonl";

/// Options consumed by the engine. Field names match the keys accepted in
/// the TOML config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub boundary_lookback_ratio: f64,

    pub top_k: usize,
    pub score_threshold: f32,
    pub overfetch_factor: usize,
    pub dedup_window: u64,
    pub dedup_similarity: f64,
    pub max_context_tokens: usize,
    pub query_timeout_secs: Option<u64>,

    pub embedding_batch_size: usize,
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub embedding_timeout_secs: u64,
    pub embedding_concurrency: usize,

    pub ingestion_concurrency: usize,
    pub ingestion_queue_capacity: usize,
    pub ingestion_timeout_secs: Option<u64>,

    pub embedding_provider: ProviderSettings,
    pub index: IndexSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 50,
            boundary_lookback_ratio: 0.2,
            top_k: 5,
            score_threshold: 0.3,
            overfetch_factor: 3,
            dedup_window: 1,
            dedup_similarity: 0.9,
            max_context_tokens: 2_000,
            query_timeout_secs: None,
            embedding_batch_size: 10,
            max_retry_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 8_000,
            embedding_timeout_secs: 30,
            embedding_concurrency: 5,
            ingestion_concurrency: 4,
            ingestion_queue_capacity: 64,
            ingestion_timeout_secs: None,
            embedding_provider: ProviderSettings::default(),
            index: IndexSettings::default(),
        }
    }
}

/// Embedding backend selected at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderSettings {
    Ngram {
        dimensions: usize,
        #[serde(default = "default_ngram_size")]
        ngram_size: usize,
    },
    Http {
        endpoint: String,
        model: String,
        dimensions: usize,
        /// Name of the environment variable holding the bearer token.
        api_key_env: Option<String>,
    },
}

impl Default for ProviderSettings {
    fn default() -> Self {
        ProviderSettings::Ngram {
            dimensions: crate::embeddings::DEFAULT_EMBEDDING_DIMENSIONS,
            ngram_size: default_ngram_size(),
        }
    }
}

fn default_ngram_size() -> usize {
    crate::embeddings::DEFAULT_NGRAM_SIZE
}

/// Vector index backend selected at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexSettings {
    Memory,
    Snapshot { path: PathBuf },
    Qdrant { url: String, collection: String },
}

impl Default for IndexSettings {
    fn default() -> Self {
        IndexSettings::Snapshot {
            path: PathBuf::from(DEFAULT_SNAPSHOT_PATH),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return invalid("chunk_size must be > 0");
        }
        if self.chunk_overlap >= self.chunk_size {
            return invalid("chunk_overlap must be smaller than chunk_size");
        }
        if !(0.0..1.0).contains(&self.boundary_lookback_ratio) {
            return invalid("boundary_lookback_ratio must be in [0.0, 1.0)");
        }
        if self.top_k == 0 {
            return invalid("top_k must be >= 1");
        }
        if !(-1.0..=1.0).contains(&self.score_threshold) {
            return invalid("score_threshold must be in [-1.0, 1.0]");
        }
        if self.overfetch_factor == 0 {
            return invalid("overfetch_factor must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.dedup_similarity) {
            return invalid("dedup_similarity must be in [0.0, 1.0]");
        }
        if self.embedding_batch_size == 0 {
            return invalid("embedding_batch_size must be >= 1");
        }
        if self.max_retry_attempts == 0 {
            return invalid("max_retry_attempts must be >= 1");
        }
        if self.embedding_concurrency == 0 {
            return invalid("embedding_concurrency must be >= 1");
        }
        if self.ingestion_concurrency == 0 {
            return invalid("ingestion_concurrency must be >= 1");
        }
        if self.ingestion_queue_capacity == 0 {
            return invalid("ingestion_queue_capacity must be >= 1");
        }
        match &self.embedding_provider {
            ProviderSettings::Ngram { dimensions, .. } | ProviderSettings::Http { dimensions, .. }
                if *dimensions == 0 =>
            {
                return invalid("embedding_provider.dimensions must be >= 1");
            }
            _ => {}
        }
        if let ProviderSettings::Ngram { ngram_size: 0, .. } = &self.embedding_provider {
            return invalid("embedding_provider.ngram_size must be >= 1");
        }
        Ok(())
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding_timeout_secs)
    }

    pub fn ingestion_timeout(&self) -> Option<Duration> {
        self.ingestion_timeout_secs.map(Duration::from_secs)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_secs.map(Duration::from_secs)
    }
}

fn invalid(message: &str) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(message.to_string()))
}

pub fn parse_config(content: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().expect("defaults validate");
    }

    #[test]
    fn toml_overrides_and_tagged_backends() {
        let config = parse_config(
            r#"
            chunk_size = 200
            chunk_overlap = 50
            top_k = 2
            score_threshold = 0.1
            max_context_tokens = 100
            embedding_batch_size = 4
            max_retry_attempts = 5
            ingestion_concurrency = 2
            embedding_concurrency = 1

            [embedding_provider]
            kind = "http"
            endpoint = "http://localhost:11434/v1/embeddings"
            model = "nomic-embed-text"
            dimensions = 768
            api_key_env = "EMBEDDING_API_KEY"

            [index]
            kind = "qdrant"
            url = "http://localhost:6333"
            collection = "chunks"
            "#,
        )
        .expect("config parses");

        assert_eq!(config.chunk_size, 200);
        assert_eq!(config.top_k, 2);
        assert_eq!(config.overfetch_factor, 3);
        assert_eq!(config.embedding_concurrency, 1);
        assert!(matches!(
            config.embedding_provider,
            ProviderSettings::Http { dimensions: 768, .. }
        ));
        assert_eq!(
            config.index,
            IndexSettings::Qdrant {
                url: "http://localhost:6333".to_string(),
                collection: "chunks".to_string(),
            }
        );
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let result = parse_config("chunk_size = 50\nchunk_overlap = 50\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ngram_size_defaults_and_is_validated() {
        let config = parse_config("[embedding_provider]\nkind = \"ngram\"\ndimensions = 32\n")
            .expect("config parses");
        assert_eq!(
            config.embedding_provider,
            ProviderSettings::Ngram {
                dimensions: 32,
                ngram_size: 3,
            }
        );

        let result = parse_config(
            "[embedding_provider]\nkind = \"ngram\"\ndimensions = 32\nngram_size = 0\n",
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            parse_config("chunk_sise = 10\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_reads_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("docqa.toml");
        std::fs::write(&path, "top_k = 9\n[index]\nkind = \"memory\"\n")?;

        let config = load_config(&path)?;
        assert_eq!(config.top_k, 9);
        assert_eq!(config.index, IndexSettings::Memory);
        Ok(())
    }
}
