//! Embedding providers and the client that enforces the calling discipline
//! (batching, retry with backoff, concurrency bound, cancellation).

pub mod client;
pub mod http;
pub mod ngram;

pub use client::{EmbeddingClient, RetryPolicy};
pub use http::HttpEmbeddingProvider;
pub use ngram::{CharacterNgramEmbedder, DEFAULT_EMBEDDING_DIMENSIONS, DEFAULT_NGRAM_SIZE};

use crate::config::ProviderSettings;
use crate::error::{ConfigError, EmbeddingError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    fn dimension(&self) -> usize;

    /// One vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Builds the provider named in config.
pub fn build_provider(
    settings: &ProviderSettings,
    request_timeout: Duration,
) -> Result<Arc<dyn EmbeddingProvider>, ConfigError> {
    match settings {
        ProviderSettings::Ngram {
            dimensions,
            ngram_size,
        } => Ok(Arc::new(
            CharacterNgramEmbedder::new(*dimensions).with_ngram_size(*ngram_size),
        )),
        ProviderSettings::Http {
            endpoint,
            model,
            dimensions,
            api_key_env,
        } => {
            let api_key = match api_key_env {
                Some(variable) => Some(
                    std::env::var(variable)
                        .map_err(|_| ConfigError::MissingEnv(variable.clone()))?,
                ),
                None => None,
            };
            let provider =
                HttpEmbeddingProvider::new(endpoint, model, *dimensions, api_key, request_timeout)?;
            Ok(Arc::new(provider))
        }
    }
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty, mismatched, or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    (dot / denom).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_bounds() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn cosine_degenerate_inputs_score_zero() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn ngram_provider_is_built_from_settings() {
        let provider = build_provider(
            &ProviderSettings::Ngram {
                dimensions: 64,
                ngram_size: 3,
            },
            Duration::from_secs(1),
        )
        .expect("local provider");
        assert_eq!(provider.dimension(), 64);
        assert_eq!(provider.name(), "ngram");
    }

    #[test]
    fn http_provider_requires_its_key_variable() {
        let result = build_provider(
            &ProviderSettings::Http {
                endpoint: "http://localhost:9/v1/embeddings".to_string(),
                model: "test".to_string(),
                dimensions: 8,
                api_key_env: Some("DOCQA_TEST_UNSET_EMBEDDING_KEY".to_string()),
            },
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(ConfigError::MissingEnv(_))));
    }
}
