//! chatwindow: fit chat history and knowledge into a model's token budget.
//!
//! The [`WindowManager`] selects the most recent turns of a conversation (keeping
//! the leading system prompt) and packs ranked knowledge snippets into a system
//! prompt, asking an injected [`TokenCounter`] for token counts.

pub mod config;
pub mod error;
pub mod llm;
pub mod logging;
pub mod normalize;

pub use config::{BackendConfig, Config, LogFormat, LoggingConfig, TokenizerConfig, WindowConfig};
pub use error::WindowError;
pub use llm::{
    counter_from_config, CharEstimateCounter, CompletionResponse, HfTokenCounter, LLMProvider,
    Message, ModelId, ModelMetadata, OpenAIProvider, OverflowPolicy, PromptParts, Role, Speaker,
    TokenCounter, Turn, Usage, WindowManager,
};
pub use logging::init_logging;
pub use normalize::normalize;
