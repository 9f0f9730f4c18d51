//! Token counting.
//!
//! The window logic never tokenizes on its own; it asks a [`TokenCounter`] for the
//! size of the exact message list it intends to send.

use super::types::{Message, ModelId};
use crate::config::TokenizerConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use hf_hub::{api::sync::ApiBuilder, Repo, RepoType};
use std::path::Path;
use std::sync::Arc;
use tokenizers::Tokenizer;

/// Framing tokens OpenAI chat models spend per message (`<|start|>role\n ... <|end|>`).
pub const CHAT_MESSAGE_OVERHEAD: usize = 4;
/// Tokens spent priming the assistant reply.
pub const CHAT_REPLY_PRIMING: usize = 3;

/// Counts the tokens a message list costs for a given model.
#[async_trait]
pub trait TokenCounter: Send + Sync {
    /// Must be deterministic for identical inputs.
    async fn count_tokens(&self, model: &ModelId, messages: &[Message]) -> Result<usize>;
}

/// Rule-of-thumb counter: one token per `chars_per_token` characters.
#[derive(Debug, Clone)]
pub struct CharEstimateCounter {
    pub chars_per_token: usize,
    pub per_message_overhead: usize,
}

impl CharEstimateCounter {
    pub fn new(chars_per_token: usize, per_message_overhead: usize) -> Self {
        Self {
            chars_per_token,
            per_message_overhead,
        }
    }

    /// Synchronous version of the count, for callers outside an async context.
    pub fn estimate(&self, messages: &[Message]) -> usize {
        let chars: usize = messages.iter().map(|m| m.content.chars().count()).sum();
        chars / self.chars_per_token.max(1) + self.per_message_overhead * messages.len()
    }
}

impl Default for CharEstimateCounter {
    fn default() -> Self {
        Self::new(4, 0)
    }
}

#[async_trait]
impl TokenCounter for CharEstimateCounter {
    async fn count_tokens(&self, _model: &ModelId, messages: &[Message]) -> Result<usize> {
        Ok(self.estimate(messages))
    }
}

/// Counter backed by a real HuggingFace tokenizer.
pub struct HfTokenCounter {
    tokenizer: Tokenizer,
    per_message_overhead: usize,
}

impl HfTokenCounter {
    pub fn new(tokenizer: Tokenizer) -> Self {
        Self {
            tokenizer,
            per_message_overhead: CHAT_MESSAGE_OVERHEAD,
        }
    }

    pub fn with_message_overhead(mut self, overhead: usize) -> Self {
        self.per_message_overhead = overhead;
        self
    }

    /// Load a `tokenizer.json` from disk
    pub fn from_file(path: &Path) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer from {:?}: {}", path, e))?;
        Ok(Self::new(tokenizer))
    }

    /// Download (or reuse the cached) `tokenizer.json` of a hub repository
    pub fn from_hub(repo_id: &str, show_progress: bool) -> Result<Self> {
        let api = ApiBuilder::new()
            .with_progress(show_progress)
            .build()
            .context("Failed to create HuggingFace API")?;
        let repo = api.repo(Repo::new(repo_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .with_context(|| format!("Failed to get tokenizer.json from {}", repo_id))?;
        Self::from_file(&tokenizer_path)
    }

    fn encoded_len(&self, text: &str) -> Result<usize> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;
        Ok(encoding.get_ids().len())
    }
}

#[async_trait]
impl TokenCounter for HfTokenCounter {
    async fn count_tokens(&self, _model: &ModelId, messages: &[Message]) -> Result<usize> {
        let mut total = CHAT_REPLY_PRIMING;
        for msg in messages {
            total += self.per_message_overhead + self.encoded_len(&msg.content)?;
        }
        Ok(total)
    }
}

/// Build the counter selected in configuration.
pub fn counter_from_config(config: &TokenizerConfig) -> Result<Arc<dyn TokenCounter>> {
    let counter: Arc<dyn TokenCounter> = match config {
        TokenizerConfig::Estimate {
            chars_per_token,
            per_message_overhead,
        } => Arc::new(CharEstimateCounter::new(*chars_per_token, *per_message_overhead)),
        TokenizerConfig::File {
            path,
            per_message_overhead,
        } => Arc::new(HfTokenCounter::from_file(path)?.with_message_overhead(*per_message_overhead)),
        TokenizerConfig::Hub {
            repo,
            per_message_overhead,
        } => Arc::new(HfTokenCounter::from_hub(repo, true)?.with_message_overhead(*per_message_overhead)),
    };
    Ok(counter)
}
