//! OpenAI-compatible chat client for the planning roles
//!
//! Each call is stateless: the caller passes the full message list, built
//! from the session's bounded history.

use crate::circuit_breaker::CircuitBreaker;
use crate::types::{ChatMessage, ChatRequest, ChatResponse};
use std::sync::Arc;
use std::time::Duration;
use triad_core::config::LlmConfig;
use triad_core::{Result, TriadError};

// Rate limit retry configuration
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2_000;
const MAX_BACKOFF_MS: u64 = 30_000;

/// Chat-completions client
#[derive(Clone)]
pub struct LlmClient {
    config: LlmConfig,
    http: reqwest::Client,
    breaker: Option<Arc<CircuitBreaker>>,
    initial_backoff: Duration,
}

impl LlmClient {
    /// Create a new client for the configured endpoint
    pub fn new(config: LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| TriadError::Llm(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            config,
            http,
            breaker: None,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    /// Route every request through a circuit breaker
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Override the first retry delay
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Send the messages and return the first choice's text
    pub async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String> {
        match &self.breaker {
            Some(breaker) => breaker.execute(|| self.send(messages)).await,
            None => self.send(messages).await,
        }
    }

    async fn send(&self, messages: Vec<ChatMessage>) -> Result<String> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };
        let api_key = self
            .config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());

        // Retry loop with exponential backoff for rate limits and 5xx
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            tracing::debug!(
                model = %self.config.model,
                messages = request.messages.len(),
                "Sending chat request (attempt {})",
                retries + 1
            );

            let mut builder = self.http.post(&self.config.endpoint).json(&request);
            if let Some(key) = &api_key {
                builder = builder.bearer_auth(key);
            }
            let response = builder
                .send()
                .await
                .map_err(|e| TriadError::Llm(format!("Failed to send request: {}", e)))?;

            let status = response.status();
            let retryable = status.as_u16() == 429 || status.is_server_error();
            if !status.is_success() {
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown".to_string());

                if retryable && retries < MAX_RETRIES {
                    retries += 1;
                    tracing::warn!(
                        "LLM endpoint returned {}. Waiting {:?} before retry {}/{}",
                        status,
                        backoff,
                        retries,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_millis(MAX_BACKOFF_MS));
                    continue;
                }

                return Err(TriadError::Llm(format!(
                    "LLM API error {}: {}",
                    status, error_text
                )));
            }

            let chat: ChatResponse = response
                .json()
                .await
                .map_err(|e| TriadError::Llm(format!("Failed to parse response: {}", e)))?;

            let output = chat
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .ok_or_else(|| TriadError::Llm("No content in response".to_string()))?;

            match chat.usage {
                Some(usage) => tracing::info!(
                    "Chat completion ({} chars, {} prompt tokens, {} completion tokens)",
                    output.len(),
                    usage.prompt_tokens,
                    usage.completion_tokens
                ),
                None => tracing::info!("Chat completion ({} chars)", output.len()),
            }

            return Ok(output);
        }
    }
}
