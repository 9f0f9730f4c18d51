//! LLM Layer
//!
//! This module handles everything between a stored conversation and the
//! completion backend:
//! - Conversation types (turns, messages, model ids)
//! - Token counting (estimate or real tokenizer)
//! - Context management (window selection, system prompt packing)
//! - The OpenAI-compatible backend client

pub mod types;
pub mod tokens;
pub mod provider;
pub mod context;
pub mod openai;

// Re-export key types
pub use types::{CompletionResponse, Message, ModelId, Role, Speaker, Turn, Usage};
pub use tokens::{counter_from_config, CharEstimateCounter, HfTokenCounter, TokenCounter};
pub use provider::{LLMProvider, ModelMetadata};
pub use context::{OverflowPolicy, PromptParts, WindowManager};
pub use openai::OpenAIProvider;
