use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::http::{HttpReply, HttpRequest, HttpTransport};

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "perplexity/sonar-pro";
pub const DEFAULT_TEMPERATURE: f32 = 0.2;
pub const DEFAULT_MAX_TOKENS: u32 = 5000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

const REFERER: &str = "https://ballot.app";
const TITLE: &str = "Ballot";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompletionError {
    #[error("OPENROUTER_API_KEY is not configured")]
    Auth,
    #[error("Rate limit exceeded. Please try again in {retry_after_secs}s.")]
    RateLimit { retry_after_secs: u64 },
    #[error("Server error: {status}")]
    Server { status: u16 },
    #[error("API error: {status} - {body}")]
    Client { status: u16, body: String },
    #[error("Network request failed: {0}")]
    Network(String),
    #[error("No response from API")]
    EmptyResponse,
    #[error("Invalid response from API: {0}")]
    InvalidResponse(String),
    #[error("Could not build request: {0}")]
    InvalidRequest(String),
}

impl CompletionError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CompletionError::RateLimit { .. }
                | CompletionError::Server { .. }
                | CompletionError::Network(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    /// Used when a 429 carries no usable Retry-After header.
    pub default_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            default_retry_after: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
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
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub timeout: Duration,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub raw: Value,
}

pub struct CompletionClient {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl CompletionClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            api_key: api_key
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty()),
            retry,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    pub async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        let key = self.api_key.as_deref().ok_or(CompletionError::Auth)?;

        let body = request_body(request)?;

        let http_request = HttpRequest::post_json(self.endpoint(), body, request.timeout)
            .header("Authorization", format!("Bearer {key}"))
            .header("HTTP-Referer", REFERER)
            .header("X-Title", TITLE);

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let exhausted = attempt >= max_attempts;

            let reply = match self.transport.send(http_request.clone()).await {
                Ok(reply) => reply,
                Err(err) => {
                    if exhausted {
                        return Err(CompletionError::Network(err.to_string()));
                    }
                    let delay = self.retry.backoff(attempt);
                    warn!(attempt, ?delay, "completion transport error: {err}; retrying");
                    sleep(delay).await;
                    continue;
                }
            };

            match reply.status {
                429 => {
                    let retry_after = retry_after(&reply).unwrap_or(self.retry.default_retry_after);
                    if exhausted {
                        return Err(CompletionError::RateLimit {
                            retry_after_secs: retry_after.as_secs(),
                        });
                    }
                    warn!(attempt, ?retry_after, "completion rate limited; retrying");
                    sleep(retry_after).await;
                }
                status @ 500..=599 => {
                    if exhausted {
                        return Err(CompletionError::Server { status });
                    }
                    let delay = self.retry.backoff(attempt);
                    warn!(attempt, status, ?delay, "completion server error; retrying");
                    sleep(delay).await;
                }
                status if !reply.is_success() => {
                    return Err(CompletionError::Client {
                        status,
                        body: reply.body,
                    });
                }
                _ => return extract_completion(&reply.body),
            }
        }
    }
}

fn request_body(request: &CompletionRequest) -> Result<Value, CompletionError> {
    serde_json::to_value(ChatBody {
        model: &request.model,
        messages: &request.messages,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
    })
    .map_err(|err| CompletionError::InvalidRequest(err.to_string()))
}

fn retry_after(reply: &HttpReply) -> Option<Duration> {
    reply
        .header("retry-after")
        .and_then(|value| value.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

fn extract_completion(body: &str) -> Result<Completion, CompletionError> {
    let raw: Value = serde_json::from_str(body)
        .map_err(|err| CompletionError::InvalidResponse(err.to_string()))?;

    let text = raw
        .get("choices")
        .and_then(|choices| choices.as_array())
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(CompletionError::EmptyResponse)?;

    debug!(chars = text.len(), "completion received");
    Ok(Completion { text, raw })
}
