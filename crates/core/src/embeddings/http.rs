use super::EmbeddingProvider;
use crate::error::{ConfigError, EmbeddingError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// OpenAI-compatible embeddings endpoint (`POST {endpoint}` with
/// `{"model", "input"}`), as served by OpenAI, Ollama, vLLM and similar.
pub struct HttpEmbeddingProvider {
    endpoint: Url,
    model: String,
    dimensions: usize,
    api_key: Option<String>,
    client: Client,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

impl HttpEmbeddingProvider {
    pub fn new(
        endpoint: &str,
        model: &str,
        dimensions: usize,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|error| ConfigError::Invalid(format!("embedding endpoint {endpoint}: {error}")))?;
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|error| ConfigError::Invalid(format!("http client: {error}")))?;

        Ok(Self {
            endpoint,
            model: model.to_string(),
            dimensions,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(classify_transport_error)?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|error| EmbeddingError::Permanent(format!("malformed response: {error}")))?;

        Ok(order_by_index(parsed.data))
    }
}

fn order_by_index(mut data: Vec<EmbeddingDatum>) -> Vec<Vec<f32>> {
    if data.iter().all(|datum| datum.index.is_some()) {
        data.sort_by_key(|datum| datum.index);
    }
    data.into_iter().map(|datum| datum.embedding).collect()
}

/// 429 and 5xx are worth retrying; every other failure status is not.
fn classify_status(status: StatusCode, body: &str) -> EmbeddingError {
    let detail = format!("{status}: {}", body.chars().take(200).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        EmbeddingError::Transient(detail)
    } else {
        EmbeddingError::Permanent(detail)
    }
}

fn classify_transport_error(error: reqwest::Error) -> EmbeddingError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        EmbeddingError::Transient(error.to_string())
    } else {
        EmbeddingError::Permanent(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_and_server_errors_are_transient() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "bad key").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "too long").is_transient());
    }

    #[test]
    fn response_is_reordered_by_index() {
        let parsed: EmbeddingResponse = serde_json::from_str(
            r#"{"data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]}"#,
        )
        .expect("valid response");
        let vectors = order_by_index(parsed.data);
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn invalid_endpoint_is_a_config_error() {
        let result = HttpEmbeddingProvider::new("not a url", "m", 4, None, Duration::from_secs(1));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transient() {
        let provider = HttpEmbeddingProvider::new(
            "http://127.0.0.1:9/v1/embeddings",
            "m",
            4,
            None,
            Duration::from_secs(2),
        )
        .expect("valid endpoint");
        let error = provider
            .embed_batch(&["hello".to_string()])
            .await
            .expect_err("nothing listens on the discard port");
        assert!(error.is_transient());
    }
}
