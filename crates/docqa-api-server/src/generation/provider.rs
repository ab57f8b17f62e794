use crate::config::LlmConfig;
use crate::utils::error::ApiError;
use crate::utils::retry::{parse_retry_after, RetryConfig};
use futures::stream::Stream;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: usize,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ChatMessage,
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, ApiError>> + Send>>;

/// Chat-completion client over an OpenAI-style provider.
///
/// Establishing the response retries rate limits and 5xx with bounded
/// backoff (honoring `Retry-After`); other 4xx surface as `ProviderRejected`
/// unretried. Each attempt is bounded by the configured timeout. Once the
/// stream is established, errors surface to the consumer — a partially
/// delivered answer is never silently restarted.
pub struct LlmClient {
    client: Client,
    config: LlmConfig,
    retry: RetryConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> anyhow::Result<Self> {
        // No whole-request timeout: streams outlive it. Connect + per-attempt
        // deadlines are applied where the request is issued.
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            config,
            retry: RetryConfig::default(),
        })
    }

    pub fn default_model(&self) -> &str {
        &self.config.default_model
    }

    /// Open a streaming completion and return an ordered stream of text
    /// deltas, terminated by the provider's completion sentinel. Dropping
    /// the stream or tripping `cancel` stops upstream token consumption.
    pub async fn stream_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        cancel: CancellationToken,
    ) -> Result<DeltaStream, ApiError> {
        if !self.config.stream_response {
            // Non-streaming provider: adapt by emitting one delta.
            let text = self.complete(model, messages).await?;
            let single = async_stream::stream! {
                if !cancel.is_cancelled() {
                    yield Ok(text);
                }
            };
            return Ok(Box::pin(single));
        }

        let response = self.send_with_retry(model, messages, true).await?;
        let mut bytes = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut buffer = String::new();

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("Generation cancelled, dropping upstream stream");
                        break;
                    }
                    next = bytes.next() => next,
                };

                let Some(item) = next else { break };

                let data = match item {
                    Ok(data) => data,
                    Err(e) => {
                        yield Err(ApiError::ProviderRejected(format!("stream error: {}", e)));
                        break;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&data));

                // Only parse complete lines; partial SSE frames stay buffered.
                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);

                    let Some(payload) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if payload == "[DONE]" {
                        return;
                    }
                    if let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(payload) {
                        if let Some(content) = chunk
                            .choices
                            .first()
                            .and_then(|c| c.delta.content.as_ref())
                        {
                            if !content.is_empty() {
                                yield Ok(content.clone());
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    /// Non-streaming completion, used by ingestion synthesis and quizzes.
    pub async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<String, ApiError> {
        let response = self.send_with_retry(model, messages, false).await?;

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ApiError::ProviderRejected(format!("malformed completion: {}", e)))?;

        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ApiError::ProviderRejected("empty completion".to_string()))
    }

    async fn send_with_retry(
        &self,
        model: &str,
        messages: &[ChatMessage],
        stream: bool,
    ) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let request = ChatCompletionRequest {
            model,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: 0.2,
            stream,
        };
        let attempt_timeout = std::time::Duration::from_secs(self.config.timeout_seconds);
        let mut last_error = String::new();

        for attempt in 0..self.retry.max_attempts {
            let send = self
                .client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(&request)
                .send();

            // Bound the time to response headers; the delta stream itself is
            // paced by the consumer and must not be cut off mid-answer.
            let outcome = match tokio::time::timeout(attempt_timeout, send).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    last_error = "LLM request exceeded attempt budget".to_string();
                    let delay = self.retry.delay_for_attempt(attempt + 1, None);
                    warn!(
                        "LLM attempt {}/{} timed out, retrying in {:?}",
                        attempt + 1,
                        self.retry.max_attempts,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            match outcome {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = parse_retry_after(
                        resp.headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok()),
                    );
                    let body = resp.text().await.unwrap_or_default();
                    last_error = format!("LLM API {}: {}", status, body);

                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        let delay = self.retry.delay_for_attempt(attempt + 1, retry_after);
                        warn!(
                            "LLM attempt {}/{} failed ({}), retrying in {:?}",
                            attempt + 1,
                            self.retry.max_attempts,
                            status,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(ApiError::ProviderRejected(last_error));
                }
                Err(e) if e.is_timeout() => {
                    last_error = format!("LLM request timed out: {}", e);
                    let delay = self.retry.delay_for_attempt(attempt + 1, None);
                    warn!(
                        "LLM attempt {}/{} timed out, retrying in {:?}",
                        attempt + 1,
                        self.retry.max_attempts,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(ApiError::ServiceUnavailable(format!(
                        "LLM provider unreachable: {}",
                        e
                    )));
                }
            }
        }

        Err(ApiError::UpstreamTimeout(last_error))
    }
}
