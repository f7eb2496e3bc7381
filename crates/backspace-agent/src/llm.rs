//! LLM-backed patch generator
//!
//! Talks to either a local Ollama server (`/api/generate`) or an
//! OpenAI-compatible endpoint (`/v1/chat/completions`). Each call is
//! stateless: the prompt carries the snapshot and any prior diagnostics.

use async_trait::async_trait;
use backspace_core::config::{ModelBackend, ModelConfig};
use backspace_core::{BackspaceError, EditSet, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::generator::{GenerationRequest, PatchGenerator};
use crate::prompt::{build_prompt, parse_response, SYSTEM_PROMPT};

const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com";
const OLLAMA_DEFAULT_BASE: &str = "http://localhost:11434";
const TEMPERATURE: f32 = 0.1;
const MAX_TOKENS: u32 = 4000;

// Retry configuration for 429 and 5xx
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_BACKOFF_SECS: u64 = 30;

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    top_p: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Patch generator backed by an inference server
#[derive(Debug, Clone)]
pub struct LlmGenerator {
    client: reqwest::Client,
    backend: ModelBackend,
    model: String,
    base_url: String,
    api_key: Option<String>,
    breaker: Arc<CircuitBreaker>,
    initial_backoff: Duration,
}

impl LlmGenerator {
    pub fn new(backend: ModelBackend, model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            backend,
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            breaker: Arc::new(CircuitBreaker::default()),
            initial_backoff: Duration::from_secs(INITIAL_BACKOFF_SECS),
        }
    }

    /// Build from configuration, reading the API key for OpenAI-compatible backends
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        match config.backend {
            ModelBackend::Ollama => Ok(Self::new(
                ModelBackend::Ollama,
                &config.name,
                &config.base_url,
            )),
            ModelBackend::OpenAi => {
                let key = std::env::var(&config.api_key_env).map_err(|_| {
                    BackspaceError::Auth(format!(
                        "No API key found. Set {} for the openai backend",
                        config.api_key_env
                    ))
                })?;
                // The shared base_url default points at Ollama
                let base = if config.base_url == OLLAMA_DEFAULT_BASE {
                    OPENAI_DEFAULT_BASE
                } else {
                    config.base_url.as_str()
                };
                Ok(Self::new(ModelBackend::OpenAi, &config.name, base).with_api_key(key))
            }
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Share a circuit breaker with other generators
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Send one prompt and return the raw completion text
    #[instrument(skip(self, prompt), fields(backend = %self.backend, model = %self.model))]
    pub async fn complete(&self, prompt: &str) -> Result<String> {
        if !self.breaker.can_execute() {
            return Err(BackspaceError::ApiLimit(format!(
                "Circuit breaker is OPEN after repeated backend failures. Wait {} seconds.",
                self.breaker.time_until_retry() / 1000
            )));
        }

        let mut retries = 0;
        let mut backoff = self.initial_backoff;
        loop {
            debug!("Sending completion request (attempt {})", retries + 1);
            let response = self.send(prompt).await.inspect_err(|_| {
                self.breaker.record_failure();
            })?;
            let status = response.status();

            if status.as_u16() == 429 || status.is_server_error() {
                retries += 1;
                if retries > MAX_RETRIES {
                    self.breaker.record_failure();
                    let body = response.text().await.unwrap_or_default();
                    return Err(BackspaceError::ApiLimit(format!(
                        "Backend returned {} after {} retries: {}",
                        status, MAX_RETRIES, body
                    )));
                }
                let wait = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(backoff);
                warn!(
                    "Backend returned {}. Waiting {:?} before retry {}/{}",
                    status, wait, retries, MAX_RETRIES
                );
                tokio::time::sleep(wait).await;
                backoff = (backoff * 2).min(Duration::from_secs(MAX_BACKOFF_SECS));
                continue;
            }

            if !status.is_success() {
                self.breaker.record_failure();
                let body = response.text().await.unwrap_or_default();
                let message = format!("Backend error {}: {}", status, body);
                return Err(if status.as_u16() == 401 || status.as_u16() == 403 {
                    BackspaceError::Auth(message)
                } else {
                    BackspaceError::Api(message)
                });
            }

            let text = self.read_completion(response).await?;
            self.breaker.record_success();
            return Ok(text);
        }
    }

    async fn send(&self, prompt: &str) -> Result<reqwest::Response> {
        let request = match self.backend {
            ModelBackend::Ollama => self
                .client
                .post(format!("{}/api/generate", self.base_url))
                .json(&OllamaRequest {
                    model: &self.model,
                    prompt: format!("{}\n\n{}", SYSTEM_PROMPT, prompt),
                    stream: false,
                    options: OllamaOptions {
                        temperature: TEMPERATURE,
                        top_p: 0.9,
                        num_predict: MAX_TOKENS,
                    },
                }),
            ModelBackend::OpenAi => {
                let mut request = self
                    .client
                    .post(format!("{}/v1/chat/completions", self.base_url))
                    .json(&ChatRequest {
                        model: &self.model,
                        messages: vec![
                            ChatMessage {
                                role: "system".to_string(),
                                content: SYSTEM_PROMPT.to_string(),
                            },
                            ChatMessage {
                                role: "user".to_string(),
                                content: prompt.to_string(),
                            },
                        ],
                        max_tokens: MAX_TOKENS,
                        temperature: TEMPERATURE,
                    });
                if let Some(key) = &self.api_key {
                    request = request.bearer_auth(key);
                }
                request
            }
        };

        request
            .send()
            .await
            .map_err(|e| BackspaceError::Api(format!("Failed to send request: {}", e)))
    }

    async fn read_completion(&self, response: reqwest::Response) -> Result<String> {
        match self.backend {
            ModelBackend::Ollama => {
                let body: OllamaResponse = response
                    .json()
                    .await
                    .map_err(|e| BackspaceError::Api(format!("Failed to parse response: {}", e)))?;
                Ok(body.response)
            }
            ModelBackend::OpenAi => {
                let body: ChatResponse = response
                    .json()
                    .await
                    .map_err(|e| BackspaceError::Api(format!("Failed to parse response: {}", e)))?;
                body.choices
                    .into_iter()
                    .next()
                    .map(|c| c.message.content)
                    .ok_or_else(|| BackspaceError::Api("Response had no choices".to_string()))
            }
        }
    }
}

#[async_trait]
impl PatchGenerator for LlmGenerator {
    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<EditSet> {
        info!(
            "Generating edits for job {} attempt {}",
            request.job_id, request.attempt
        );
        let completion = self.complete(&build_prompt(request)).await?;
        parse_response(&completion)
    }
}
