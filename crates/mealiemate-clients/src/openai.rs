//! OpenAI-compatible chat-completion client in JSON mode.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use mealiemate_core::services::{ChatMessage, CompletionRequest, LanguageModel};

use crate::config::LlmConfig;
use crate::error::{HttpStatusError, check_status};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completion client. Transient failures (timeouts, connection
/// errors, 429 and 5xx) are retried up to `max_retries` times.
#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    config: LlmConfig,
}

impl OpenAiClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build completion HTTP client")?;
        Ok(Self { http, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    async fn attempt(&self, request: &CompletionRequest) -> Result<serde_json::Value> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: &request.messages,
            temperature: request.temperature.unwrap_or(self.config.temperature),
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };
        let url = self.config.completions_url();
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;
        let response: ChatResponse = check_status(response, "POST", "/chat/completions")
            .await?
            .json()
            .await
            .context("invalid completion response")?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("completion response has no content"))?;
        serde_json::from_str(&content).context("model did not return valid JSON")
    }
}

fn is_transient(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        if let Some(status) = cause.downcast_ref::<HttpStatusError>() {
            return status.is_transient();
        }
        cause
            .downcast_ref::<reqwest::Error>()
            .is_some_and(|e| e.is_timeout() || e.is_connect())
    })
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete_json(&self, request: &CompletionRequest) -> Result<serde_json::Value> {
        let mut attempt = 0;
        loop {
            tracing::debug!(model = %self.config.model, attempt, "requesting completion");
            match self.attempt(request).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.config.max_retries && is_transient(&e) => {
                    attempt += 1;
                    tracing::warn!(
                        error = %format!("{e:#}"),
                        attempt,
                        max_retries = self.config.max_retries,
                        "completion failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("model", &self.config.model)
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}
