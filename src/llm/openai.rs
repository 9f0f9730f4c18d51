//! OpenAI API Provider.
//!
//! Implements the `LLMProvider` trait for OpenAI-compatible Chat Completions APIs.

use super::provider::{LLMProvider, ModelMetadata};
use super::types::{CompletionResponse, Message, ModelId, Role, Usage};
use crate::config::BackendConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// How deep error bodies are searched for a `message` field.
pub const ERROR_SEARCH_DEPTH: usize = 8;

/// OpenAI Provider configuration and state.
pub struct OpenAIProvider {
    client: Client,
    config: BackendConfig,
    metadata: ModelMetadata,
}

impl OpenAIProvider {
    pub fn new(config: BackendConfig) -> Result<Self> {
        anyhow::ensure!(
            !config.api_key.is_empty(),
            "No API key configured. Set backend.api_key or OPENAI_API_KEY."
        );

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        let metadata = ModelMetadata::for_model(&ModelId::new(config.model.clone()));

        Ok(Self {
            client,
            config,
            metadata,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    fn metadata(&self) -> ModelMetadata {
        self.metadata.clone()
    }

    async fn completion(&self, messages: &[Message]) -> Result<CompletionResponse> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: messages.iter().map(ApiMessage::from).collect(),
            temperature: self.config.temperature,
        };
        debug!(model = %request.model, messages = messages.len(), "sending chat completion");

        let response = self.client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to completion backend")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<Value>(&error_text)
                .ok()
                .and_then(|body| first_error_message(&body, ERROR_SEARCH_DEPTH))
                .unwrap_or(error_text);
            warn!(%status, "completion backend returned an error");
            return Err(anyhow::anyhow!("Completion API error ({}): {}", status, detail));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .context("Failed to parse completion response")?;

        let choice = chat_response.choices.first().context("No choices returned from completion backend")?;

        Ok(CompletionResponse {
            content: choice.message.content.clone(),
            usage: chat_response.usage.into(),
        })
    }
}

/// Depth-first search for the first non-empty string `message` field.
///
/// Objects are checked for their own `message` before their children are
/// visited. Nothing deeper than `max_depth` levels is looked at.
pub fn first_error_message(value: &Value, max_depth: usize) -> Option<String> {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(message)) = map.get("message") {
                if !message.is_empty() {
                    return Some(message.clone());
                }
            }
            if max_depth == 0 {
                return None;
            }
            map.values()
                .find_map(|child| first_error_message(child, max_depth - 1))
        }
        Value::Array(items) => {
            if max_depth == 0 {
                return None;
            }
            items
                .iter()
                .find_map(|child| first_error_message(child, max_depth - 1))
        }
        _ => None,
    }
}

// -----------------------------------------------------------------------------
// OpenAI DTOs (Data Transfer Objects)
// -----------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ApiMessage>,
    temperature: f32,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

impl From<&Message> for ApiMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: msg.content.clone(),
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Deserialize)]
struct Choice {
    message: ApiResponseMessage,
}

#[derive(Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize, Default)]
struct ApiUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_tokens: usize,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Self {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}
