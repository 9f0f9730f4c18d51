//! Configuration management for chatwindow
//!
//! Handles backend, window policy, tokenizer and logging settings persisted in
//! `~/.chatwindow/config.toml`.

use crate::llm::context::OverflowPolicy;
use crate::llm::tokens::CHAT_MESSAGE_OVERHEAD;
use crate::llm::types::ModelId;
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Completion backend connection settings.
///
/// Built once by the entry point and handed to the client; nothing reads the
/// environment after that.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of an OpenAI-compatible API
    pub base_url: String,
    /// API key (falls back to OPENAI_API_KEY when empty)
    pub api_key: String,
    /// Chat model used for completions and token counting
    pub model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            timeout_secs: 60,
        }
    }
}

impl BackendConfig {
    pub fn model_id(&self) -> ModelId {
        ModelId::new(self.model.clone())
    }
}

/// Window selection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    /// What to do with the turn/snippet that crosses the budget
    pub overflow: OverflowPolicy,
    /// Skip token counting when total characters < budget * ratio
    pub fast_path_ratio: f64,
    /// Tokens reserved for the model's answer
    pub output_buffer: usize,
    /// Token budget for packed knowledge snippets
    pub knowledge_budget: i64,
    /// Override of the model's context window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<usize>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            overflow: OverflowPolicy::default(),
            fast_path_ratio: 0.5,
            output_buffer: 512,
            knowledge_budget: 1_500,
            context_window: None,
        }
    }
}

/// Which token counter to use
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TokenizerConfig {
    /// Character-count estimate, no model files needed
    Estimate {
        #[serde(default = "default_chars_per_token")]
        chars_per_token: usize,
        #[serde(default)]
        per_message_overhead: usize,
    },
    /// Local tokenizer.json
    File {
        path: PathBuf,
        #[serde(default = "default_message_overhead")]
        per_message_overhead: usize,
    },
    /// tokenizer.json fetched from the HuggingFace hub
    Hub {
        repo: String,
        #[serde(default = "default_message_overhead")]
        per_message_overhead: usize,
    },
}

fn default_chars_per_token() -> usize {
    4
}

fn default_message_overhead() -> usize {
    CHAT_MESSAGE_OVERHEAD
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self::Estimate {
            chars_per_token: default_chars_per_token(),
            per_message_overhead: 0,
        }
    }
}

impl TokenizerConfig {
    /// Display name
    pub fn name(&self) -> String {
        match self {
            Self::Estimate { chars_per_token, .. } => format!("estimate ({} chars/token)", chars_per_token),
            Self::File { path, .. } => format!("file ({})", path.display()),
            Self::Hub { repo, .. } => format!("hub ({})", repo),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human readable output
    #[default]
    Compact,
    /// JSON lines for log aggregators
    Json,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::default(),
        }
    }
}

/// chatwindow configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Version of config schema (for future migrations)
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            backend: BackendConfig::default(),
            window: WindowConfig::default(),
            tokenizer: TokenizerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Get the config file path (~/.chatwindow/config.toml)
    pub fn path() -> Result<PathBuf> {
        Ok(base_dir()?.join("config.toml"))
    }

    /// Load config from disk, or return None if it doesn't exist
    pub fn load() -> Result<Option<Self>> {
        let path = Self::path()?;
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    /// Load and validate config from a specific file
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: Self = toml::from_str(&content)
            .context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;
        std::fs::write(path, content)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Write the default config to `path` unless a file is already there.
    ///
    /// Returns whether anything was written.
    pub fn write_default(path: &std::path::Path, force: bool) -> Result<bool> {
        if path.exists() && !force {
            return Ok(false);
        }
        Self::default().save_to(path)?;
        Ok(true)
    }

    /// Reject values the window logic cannot work with
    pub fn validate(&self) -> Result<()> {
        let ratio = self.window.fast_path_ratio;
        ensure!(
            ratio.is_finite() && ratio >= 0.0,
            "window.fast_path_ratio must be a finite, non-negative number (got {})",
            ratio
        );
        ensure!(
            self.window.knowledge_budget > 0,
            "window.knowledge_budget must be positive (got {})",
            self.window.knowledge_budget
        );
        if let TokenizerConfig::Estimate { chars_per_token, .. } = self.tokenizer {
            ensure!(chars_per_token > 0, "tokenizer.chars_per_token must be at least 1");
        }
        ensure!(
            self.backend.timeout_secs > 0,
            "backend.timeout_secs must be at least 1"
        );
        Ok(())
    }

    /// Fold OPENAI_API_KEY / OPENAI_BASE_URL into the backend section.
    ///
    /// Values already present in the file win over the environment.
    pub fn with_env_overrides(mut self) -> Self {
        if self.backend.api_key.is_empty() {
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                self.backend.api_key = key;
            }
        }
        if self.backend.base_url == DEFAULT_BASE_URL {
            if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
                if !url.is_empty() {
                    self.backend.base_url = url;
                }
            }
        }
        self
    }
}

/// Get the base directory path (~/.chatwindow)
pub fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(".chatwindow"))
}
