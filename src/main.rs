//! chatwindow CLI
//!
//! Commands:
//!   normalize - Print normalized text
//!   window - Select the part of a chat history that fits a token budget
//!   pack - Pack ranked knowledge snippets into a system prompt
//!   chat - Assemble a prompt and send it to the completion backend
//!   init - Write the default config
//!   info - Show config and model limits

use anyhow::{Context, Result};
use chatwindow::{
    counter_from_config, init_logging, normalize, Config, LLMProvider, ModelId, OpenAIProvider,
    OverflowPolicy, PromptParts, Role, Turn, WindowManager,
};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "chatwindow")]
#[command(about = "Fit chat history and knowledge into a model's token budget")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.chatwindow/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print normalized text (reads stdin when no file is given)
    Normalize {
        file: Option<PathBuf>,
    },

    /// Select the window of a chat history (JSON array of turns)
    Window {
        /// Path to the history file
        history: PathBuf,

        /// Token budget (defaults to the model's context window minus the output buffer)
        #[arg(short, long, allow_hyphen_values = true)]
        budget: Option<i64>,

        /// Model to count tokens for
        #[arg(short, long)]
        model: Option<String>,

        /// Drop the turn that crosses the budget
        #[arg(long)]
        strict: bool,
    },

    /// Pack knowledge snippets (JSON array of strings, most relevant first)
    Pack {
        /// Path to the snippets file
        snippets: PathBuf,

        /// Token budget (defaults to window.knowledge_budget)
        #[arg(short, long, allow_hyphen_values = true)]
        budget: Option<i64>,

        /// Model to count tokens for
        #[arg(short, long)]
        model: Option<String>,

        /// Drop the snippet that crosses the budget
        #[arg(long)]
        strict: bool,
    },

    /// Assemble persona, knowledge and history, then ask the backend
    Chat {
        /// Path to the history file
        history: PathBuf,

        /// Persona / instruction prompt
        #[arg(short, long, default_value = "")]
        system: String,

        /// Knowledge snippets file
        #[arg(long)]
        snippets: Option<PathBuf>,
    },

    /// Write the default config
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Show config and model limits
    Info,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?.unwrap_or_default(),
    };
    Ok(config.with_env_overrides())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
}

fn window_manager(config: &Config, strict: bool) -> WindowManager {
    let mut manager = WindowManager::from_config(&config.window);
    if strict {
        manager.policy = OverflowPolicy::Strict;
    }
    manager
}

/// Token that fires on Ctrl-C
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The file may not exist yet, so init must not load it
    if let Commands::Init { force } = cli.command {
        let path = match cli.config {
            Some(path) => path,
            None => Config::path()?,
        };
        if Config::write_default(&path, force)? {
            println!("{} Wrote default config to {}", "✓".green(), path.display());
        } else {
            println!("Config already exists at {}. Use --force to overwrite.", path.display());
        }
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    init_logging(&config.logging);

    match cli.command {
        Commands::Normalize { file } => {
            let text = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {:?}", path))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            println!("{}", normalize(&text));
        }

        Commands::Window { history, budget, model, strict } => {
            let turns: Vec<Turn> = read_json(&history)?;
            let model = model.map(ModelId::from).unwrap_or_else(|| config.backend.model_id());
            let manager = window_manager(&config, strict);
            let budget = match budget {
                Some(budget) => budget,
                None => manager.history_budget(&model)?,
            };
            let counter = counter_from_config(&config.tokenizer)?;

            info!(turns = turns.len(), budget, model = %model, "selecting window");
            let window = manager
                .select_window_cancellable(counter.as_ref(), &turns, &model, budget, &ctrl_c_token())
                .await?;

            eprintln!(
                "{} {} of {} turns kept",
                "✓".green(),
                window.len(),
                turns.len()
            );
            println!("{}", serde_json::to_string_pretty(&window)?);
        }

        Commands::Pack { snippets, budget, model, strict } => {
            let snippets: Vec<String> = read_json(&snippets)?;
            let model = model.map(ModelId::from).unwrap_or_else(|| config.backend.model_id());
            let manager = window_manager(&config, strict);
            let budget = budget.unwrap_or(config.window.knowledge_budget);
            let counter = counter_from_config(&config.tokenizer)?;

            info!(snippets = snippets.len(), budget, model = %model, "packing system prompt");
            let packed = manager
                .pack_system_prompt_cancellable(counter.as_ref(), &snippets, &model, budget, &ctrl_c_token())
                .await?;

            eprintln!(
                "{} {} chars packed from {} snippets",
                "✓".green(),
                packed.chars().count(),
                snippets.len()
            );
            println!("{}", packed);
        }

        Commands::Chat { history, system, snippets } => {
            let turns: Vec<Turn> = read_json(&history)?;
            let snippets: Vec<String> = match snippets {
                Some(path) => read_json(&path)?,
                None => Vec::new(),
            };
            let model = config.backend.model_id();
            let manager = window_manager(&config, false);
            let counter = counter_from_config(&config.tokenizer)?;

            let parts = PromptParts {
                persona: &system,
                snippets: &snippets,
                knowledge_budget: config.window.knowledge_budget,
                history: &turns,
            };
            let token = ctrl_c_token();
            let window = manager
                .assemble(counter.as_ref(), &model, &parts, Some(&token))
                .await?;
            let system_text = window
                .first()
                .filter(|m| m.role == Role::System)
                .map_or("", |m| m.content.as_str());
            let available = manager
                .available_tokens(counter.as_ref(), &model, system_text)
                .await?;
            info!(messages = window.len(), available, model = %model, "sending window to backend");

            let provider = OpenAIProvider::new(config.backend.clone())?;
            let response = provider.completion(&window).await?;

            println!("{}", response.content);
            eprintln!(
                "\n{}",
                format!(
                    "{} messages sent · {} tokens left after the system prompt · {} prompt + {} completion = {} tokens",
                    window.len(),
                    available,
                    response.usage.prompt_tokens,
                    response.usage.completion_tokens,
                    response.usage.total_tokens
                )
                .as_str()
                .dimmed()
            );
        }

        Commands::Init { .. } => unreachable!("handled before the config is loaded"),

        Commands::Info => {
            let model = config.backend.model_id();
            let manager = window_manager(&config, false);

            println!("{}", "chatwindow".bold());
            match cli.config {
                Some(path) => println!("  Config:          {}", path.display()),
                None => println!("  Config:          {}", Config::path()?.display()),
            }
            println!("  Backend:         {}", config.backend.base_url);
            println!("  Model:           {}", model);
            println!("  Context window:  {}", manager.context_window(&model));
            match manager.history_budget(&model) {
                Ok(budget) => println!("  History budget:  {}", budget),
                Err(e) => println!("  History budget:  {}", e.to_string().as_str().red()),
            }
            println!("  Knowledge:       {} tokens", config.window.knowledge_budget);
            println!("  Overflow policy: {:?}", config.window.overflow);
            println!("  Tokenizer:       {}", config.tokenizer.name());
            let key_state = if config.backend.api_key.is_empty() { "not set".yellow() } else { "set".green() };
            println!("  API key:         {}", key_state);
        }
    }

    Ok(())
}
