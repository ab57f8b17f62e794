use crate::config::RemoteEmbeddingConfig;
use crate::database::EmbeddingProviderKind;
use crate::utils::error::ApiError;
use crate::utils::retry::{parse_retry_after, RetryConfig};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Remote 1536-dim embedding backend. Each request is bounded to 30 s;
/// rate limits, timeouts and 5xx responses are retried with bounded
/// exponential backoff, honoring `Retry-After` when present.
pub struct RemoteEmbedder {
    client: Client,
    config: RemoteEmbeddingConfig,
    retry: RetryConfig,
}

impl RemoteEmbedder {
    pub fn new(config: RemoteEmbeddingConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            config,
            retry: RetryConfig::default(),
        })
    }

    pub fn kind(&self) -> EmbeddingProviderKind {
        EmbeddingProviderKind::Remote
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, ApiError> {
        let mut batch = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        batch
            .pop()
            .ok_or_else(|| ApiError::Internal("empty embedding batch".to_string()))
    }

    /// One provider call embedding up to a batch of texts, with the same
    /// retry policy as single embeds. Result order matches input order.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        let url = format!("{}/v1/embeddings", self.config.base_url);
        let mut last_error = String::new();

        for attempt in 0..self.retry.max_attempts {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(&EmbeddingRequest {
                    input: texts,
                    model: &self.config.model,
                })
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    return self.parse_response(resp, texts.len()).await;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = parse_retry_after(
                        resp.headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok()),
                    );
                    let body = resp.text().await.unwrap_or_default();
                    last_error = format!("embedding API {}: {}", status, body);

                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        let delay = self.retry.delay_for_attempt(attempt + 1, retry_after);
                        warn!(
                            "Embedding attempt {}/{} failed ({}), retrying in {:?}",
                            attempt + 1,
                            self.retry.max_attempts,
                            status,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    // Other 4xx is not transient.
                    return Err(ApiError::ProviderRejected(last_error));
                }
                Err(e) if e.is_timeout() => {
                    last_error = format!("embedding request timed out: {}", e);
                    let delay = self.retry.delay_for_attempt(attempt + 1, None);
                    warn!(
                        "Embedding attempt {}/{} timed out, retrying in {:?}",
                        attempt + 1,
                        self.retry.max_attempts,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(ApiError::ServiceUnavailable(format!(
                        "embedding provider unreachable: {}",
                        e
                    )));
                }
            }
        }

        Err(ApiError::UpstreamTimeout(last_error))
    }

    async fn parse_response(
        &self,
        resp: reqwest::Response,
        expected: usize,
    ) -> Result<Vec<Vec<f32>>, ApiError> {
        let body: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| ApiError::Internal(format!("malformed embedding response: {}", e)))?;

        if body.data.len() != expected {
            return Err(ApiError::Internal(format!(
                "embedding count mismatch: expected {}, got {}",
                expected,
                body.data.len()
            )));
        }

        let embeddings: Vec<Vec<f32>> = body.data.into_iter().map(|d| d.embedding).collect();

        for embedding in &embeddings {
            if embedding.len() != self.config.dimension {
                return Err(ApiError::Internal(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.config.dimension,
                    embedding.len()
                )));
            }
        }

        debug!("Remote embeddings generated ({} vectors)", embeddings.len());

        Ok(embeddings)
    }
}
