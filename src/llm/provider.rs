//! The Provider Abstraction.
//!
//! This trait defines the interface of the completion backend a selected window
//! is forwarded to.

use anyhow::Result;
use async_trait::async_trait;
use super::types::{CompletionResponse, Message, ModelId};

/// Context window used for models nobody told us about.
pub const DEFAULT_CONTEXT_WINDOW: usize = 4_096;

/// Metadata about a model's capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelMetadata {
    pub id: ModelId,
    pub context_window: usize,
}

impl ModelMetadata {
    /// Known context windows of the OpenAI chat models.
    pub fn for_model(id: &ModelId) -> Self {
        let context_window = match id.as_str() {
            "gpt-4-turbo" | "gpt-4-turbo-preview" => 128_000,
            "gpt-4-32k" => 32_768,
            "gpt-4" => 8_192,
            "gpt-3.5-turbo" => 16_385,
            _ => DEFAULT_CONTEXT_WINDOW,
        };

        Self {
            id: id.clone(),
            context_window,
        }
    }
}

/// The core trait for completion backends.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Get the model's metadata (context window, ID).
    fn metadata(&self) -> ModelMetadata;

    /// Send a chat completion request with an already selected window.
    async fn completion(&self, messages: &[Message]) -> Result<CompletionResponse>;
}
