//! Retrying client for the external text-generation endpoint

use crate::config::GenerationConfig;
use crate::error::{GuardError, Result};
use crate::types::ChatMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One call to the completion endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    /// Total characters across all message contents
    pub fn content_length(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }
}

/// Successful generation
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    /// Attempts it took, the successful one included
    pub attempts: u32,
}

/// Classified failure of a single attempt
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamFailure {
    /// 401 or 403
    Auth(u16),
    /// 429
    RateLimited,
    /// Anything else: server errors, timeouts, broken bodies
    Transient(String),
}

impl UpstreamFailure {
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => UpstreamFailure::Auth(status),
            429 => UpstreamFailure::RateLimited,
            _ => UpstreamFailure::Transient(format!("status {}: {}", status, truncate(body, 200))),
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Something that turns messages into text
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<String, UpstreamFailure>;
}

/// OpenAI-compatible chat completions over HTTP
#[cfg(feature = "http")]
pub struct HttpBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[cfg(feature = "http")]
impl HttpBackend {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| GuardError::Config("generation API key not set".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.api_endpoint.clone(),
            api_key,
        })
    }

    fn parse_content(body: &serde_json::Value) -> Option<String> {
        body["choices"]
            .get(0)?
            .get("message")?
            .get("content")?
            .as_str()
            .map(str::to_string)
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl CompletionBackend for HttpBackend {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<String, UpstreamFailure> {
        let body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| UpstreamFailure::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UpstreamFailure::from_status(status.as_u16(), &text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| UpstreamFailure::Transient(format!("invalid response body: {}", e)))?;

        Self::parse_content(&json)
            .ok_or_else(|| UpstreamFailure::Transient("no completion in response".to_string()))
    }
}

/// Wraps a backend with a size precondition and bounded exponential backoff.
///
/// Auth (401/403) and rate-limit (429) failures return immediately; all
/// others are retried until `max_retries` attempts have been made.
pub struct GenerationClient {
    backend: Arc<dyn CompletionBackend>,
    config: GenerationConfig,
}

impl GenerationClient {
    pub fn new(backend: Arc<dyn CompletionBackend>, config: GenerationConfig) -> Self {
        Self { backend, config }
    }

    /// Client talking to the configured HTTP endpoint
    #[cfg(feature = "http")]
    pub fn from_config(config: GenerationConfig) -> Result<Self> {
        let backend = HttpBackend::new(&config)?;
        Ok(Self::new(Arc::new(backend), config))
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Build a request, filling unset parameters from config
    pub fn request(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> CompletionRequest {
        CompletionRequest {
            model: self.config.model.clone(),
            messages,
            max_tokens: max_tokens.unwrap_or(self.config.default_max_tokens),
            temperature: temperature.unwrap_or(self.config.default_temperature),
        }
    }

    /// Delay after failed attempt `attempt` (1-based): base doubling, capped
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.config.backoff_cap_ms);
        Duration::from_millis(ms)
    }

    pub async fn generate(&self, request: &CompletionRequest) -> Result<Completion> {
        let length = request.content_length();
        if length > self.config.max_prompt_chars {
            warn!(length, max = self.config.max_prompt_chars, "Prompt rejected before sending");
            return Err(GuardError::PromptTooLarge {
                length,
                max: self.config.max_prompt_chars,
            });
        }

        let max_attempts = self.config.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            info!(attempt, max_attempts, content_length = length, "Generation attempt");

            match self.backend.complete(request).await {
                Ok(text) => {
                    debug!(attempt, output_length = text.chars().count(), "Generation succeeded");
                    return Ok(Completion {
                        text,
                        attempts: attempt,
                    });
                }
                Err(UpstreamFailure::Auth(status)) => {
                    warn!(attempt, status, "Generation endpoint rejected credentials");
                    return Err(GuardError::UpstreamAuth { status });
                }
                Err(UpstreamFailure::RateLimited) => {
                    warn!(attempt, "Generation endpoint rate limited");
                    return Err(GuardError::UpstreamRateLimited);
                }
                Err(UpstreamFailure::Transient(message)) => {
                    warn!(attempt, error = %message, "Generation attempt failed");
                    last_error = message;
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.backoff_delay(attempt)).await;
            }
        }

        Err(GuardError::TransientUpstream {
            attempts: max_attempts,
            message: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<VecDeque<std::result::Result<String, UpstreamFailure>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(replies: Vec<std::result::Result<String, UpstreamFailure>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl CompletionBackend for Scripted {
        async fn complete(
            &self,
            _request: &CompletionRequest,
        ) -> std::result::Result<String, UpstreamFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(UpstreamFailure::Transient("exhausted".to_string())))
        }
    }

    fn client(backend: Arc<Scripted>) -> GenerationClient {
        GenerationClient::new(backend, GenerationConfig::default())
    }

    fn server_error() -> std::result::Result<String, UpstreamFailure> {
        Err(UpstreamFailure::from_status(500, "internal"))
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(UpstreamFailure::from_status(401, ""), UpstreamFailure::Auth(401));
        assert_eq!(UpstreamFailure::from_status(403, ""), UpstreamFailure::Auth(403));
        assert_eq!(UpstreamFailure::from_status(429, ""), UpstreamFailure::RateLimited);
        assert!(matches!(
            UpstreamFailure::from_status(503, "down"),
            UpstreamFailure::Transient(_)
        ));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let c = client(Scripted::new(vec![]));
        assert_eq!(c.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(c.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(c.backoff_delay(4), Duration::from_secs(8));
        assert_eq!(c.backoff_delay(5), Duration::from_secs(10));
        assert_eq!(c.backoff_delay(40), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let backend = Scripted::new(vec![server_error(), server_error(), Ok("talk".to_string())]);
        let c = client(backend.clone());
        let request = c.request(vec![ChatMessage::user("faith")], None, None);

        let started = tokio::time::Instant::now();
        let completion = c.generate(&request).await.unwrap();

        assert_eq!(completion.text, "talk");
        assert_eq!(completion.attempts, 3);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        // 1s then 2s of backoff
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(3) && waited < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_is_not_retried() {
        let backend = Scripted::new(vec![Err(UpstreamFailure::RateLimited), Ok("x".to_string())]);
        let c = client(backend.clone());
        let request = c.request(vec![ChatMessage::user("faith")], None, None);

        let err = c.generate(&request).await.unwrap_err();
        assert!(matches!(err, GuardError::UpstreamRateLimited));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_is_not_retried() {
        let backend = Scripted::new(vec![Err(UpstreamFailure::Auth(401))]);
        let c = client(backend.clone());
        let request = c.request(vec![ChatMessage::user("faith")], None, None);

        let err = c.generate(&request).await.unwrap_err();
        assert!(matches!(err, GuardError::UpstreamAuth { status: 401 }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_report_attempts() {
        let backend = Scripted::new(vec![server_error(), server_error(), server_error()]);
        let c = client(backend.clone());
        let request = c.request(vec![ChatMessage::user("faith")], None, None);

        match c.generate(&request).await {
            Err(GuardError::TransientUpstream { attempts, message }) => {
                assert_eq!(attempts, 3);
                assert!(message.contains("500"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_prompt_skips_backend() {
        let backend = Scripted::new(vec![Ok("x".to_string())]);
        let c = client(backend.clone());
        let request = c.request(vec![ChatMessage::user("a".repeat(100_001))], None, None);

        let err = c.generate(&request).await.unwrap_err();
        assert!(matches!(err, GuardError::PromptTooLarge { length: 100_001, .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_request_defaults() {
        let c = client(Scripted::new(vec![]));
        let request = c.request(vec![], None, Some(0.2));
        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.max_tokens, 2000);
        assert_eq!(request.temperature, 0.2);
    }

    #[cfg(feature = "http")]
    #[test]
    fn test_http_backend_needs_key() {
        assert!(matches!(
            HttpBackend::new(&GenerationConfig::default()),
            Err(GuardError::Config(_))
        ));
        let body = serde_json::json!({"choices": [{"message": {"content": "hi"}}]});
        assert_eq!(HttpBackend::parse_content(&body), Some("hi".to_string()));
    }
}
