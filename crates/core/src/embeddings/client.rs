use super::EmbeddingProvider;
use crate::cancel::CancelSignal;
use crate::config::EngineConfig;
use crate::error::EmbeddingError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts per batch, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before `attempt` (1-based): zero for the first, then
    /// `base, 2*base, 4*base, ...` capped at `max_delay`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Shared handle to an embedding provider. Cloning shares the provider and
/// the concurrency semaphore.
#[derive(Clone)]
pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
    batch_size: usize,
    call_timeout: Duration,
}

impl std::fmt::Debug for EmbeddingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingClient")
            .field("provider", &self.provider.name())
            .field("dimension", &self.provider.dimension())
            .field("batch_size", &self.batch_size)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl EmbeddingClient {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        concurrency: usize,
        batch_size: usize,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            retry,
            batch_size: batch_size.max(1),
            call_timeout,
        }
    }

    pub fn from_config(provider: Arc<dyn EmbeddingProvider>, config: &EngineConfig) -> Self {
        Self::new(
            provider,
            config.embedding_concurrency,
            config.embedding_batch_size,
            RetryPolicy {
                max_attempts: config.max_retry_attempts.max(1),
                base_delay: Duration::from_millis(config.retry_base_delay_ms),
                max_delay: Duration::from_millis(config.retry_max_delay_ms),
            },
            config.embedding_timeout(),
        )
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Embeds `texts` in batches of at most `batch_size`, in input order.
    pub async fn embed_texts(
        &self,
        texts: &[String],
        cancel: &CancelSignal,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for (batch_number, batch) in texts.chunks(self.batch_size).enumerate() {
            debug!(batch = batch_number, size = batch.len(), "embedding batch");
            vectors.extend(self.embed_batch_with_retry(batch, cancel).await?);
        }
        Ok(vectors)
    }

    pub async fn embed_query(
        &self,
        text: &str,
        cancel: &CancelSignal,
    ) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self
            .embed_batch_with_retry(&[text.to_string()], cancel)
            .await?;
        vectors.pop().ok_or(EmbeddingError::CountMismatch {
            expected: 1,
            actual: 0,
        })
    }

    async fn embed_batch_with_retry(
        &self,
        batch: &[String],
        cancel: &CancelSignal,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut last_error: Option<EmbeddingError> = None;

        for attempt in 1..=self.retry.max_attempts {
            let delay = self.retry.delay_before(attempt);
            if !delay.is_zero() {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
                cancel
                    .run(tokio::time::sleep(delay))
                    .await
                    .ok_or(EmbeddingError::Cancelled)?;
            }

            let permit = match cancel.run(self.permits.acquire()).await {
                None => return Err(EmbeddingError::Cancelled),
                Some(Ok(permit)) => permit,
                Some(Err(_)) => {
                    return Err(EmbeddingError::Permanent(
                        "embedding semaphore closed".to_string(),
                    ))
                }
            };
            let outcome = cancel
                .run(tokio::time::timeout(
                    self.call_timeout,
                    self.provider.embed_batch(batch),
                ))
                .await;
            drop(permit);

            let error = match outcome {
                None => return Err(EmbeddingError::Cancelled),
                Some(Ok(Ok(vectors))) => {
                    self.validate(batch.len(), &vectors)?;
                    return Ok(vectors);
                }
                Some(Ok(Err(error))) => error,
                Some(Err(_elapsed)) => EmbeddingError::Transient(format!(
                    "provider call exceeded {}ms",
                    self.call_timeout.as_millis()
                )),
            };

            if !error.is_transient() {
                warn!(provider = self.provider.name(), error = %error, "permanent embedding failure");
                return Err(error);
            }

            warn!(
                provider = self.provider.name(),
                attempt,
                max_attempts = self.retry.max_attempts,
                error = %error,
                "transient embedding failure"
            );
            last_error = Some(error);
        }

        Err(EmbeddingError::Exhausted {
            attempts: self.retry.max_attempts,
            last: last_error
                .map(|error| error.to_string())
                .unwrap_or_default(),
        })
    }

    fn validate(&self, expected: usize, vectors: &[Vec<f32>]) -> Result<(), EmbeddingError> {
        if vectors.len() != expected {
            return Err(EmbeddingError::CountMismatch {
                expected,
                actual: vectors.len(),
            });
        }
        let dimension = self.provider.dimension();
        if let Some(vector) = vectors.iter().find(|vector| vector.len() != dimension) {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}
