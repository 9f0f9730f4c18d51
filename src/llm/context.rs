//! Context Window Management.
//!
//! This module handles the "scarce resource" of the LLM context window.
//! It decides which part of an ever-growing conversation, and which ranked
//! knowledge snippets, fit into the token budget of the completion backend.
//!
//! Both walks stop at the first step whose token count reaches the budget.
//! [`OverflowPolicy`] decides whether that last turn/snippet is kept (the budget
//! acts as a ceiling that may be crossed by one inclusion) or dropped (the budget
//! acts as a hard cap).

use super::provider::ModelMetadata;
use super::tokens::TokenCounter;
use super::types::{Message, ModelId, Role, Speaker, Turn};
use crate::config::WindowConfig;
use crate::error::WindowError;
use crate::normalize::normalize;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Line placed between the persona prompt and packed knowledge.
pub const KNOWLEDGE_LEAD_IN: &str = "The knowledge base is up to date. Relevant entries follow:";

/// What to do with the turn or snippet whose inclusion reaches the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Keep it. The result may exceed the budget by that one inclusion.
    #[default]
    KeepOverflow,
    /// Drop it. The most recent turn is still kept when it alone reaches the budget.
    Strict,
}

/// Inputs for a complete prompt: persona, ranked knowledge and history.
#[derive(Debug, Clone, Copy)]
pub struct PromptParts<'a> {
    /// The model's persona / instruction prompt
    pub persona: &'a str,
    /// Knowledge snippets, most relevant first
    pub snippets: &'a [String],
    /// Token budget for the packed snippets
    pub knowledge_budget: i64,
    /// Stored conversation, oldest first
    pub history: &'a [Turn],
}

/// Manages the context window for a conversation.
#[derive(Debug, Clone)]
pub struct WindowManager {
    pub policy: OverflowPolicy,
    /// History shorter than `budget * fast_path_ratio` characters is sent as-is.
    pub fast_path_ratio: f64,
    /// Reserve some tokens for the answer (output buffer).
    pub output_buffer: usize,
    /// Overrides the model's known context window.
    pub context_window: Option<usize>,
}

impl Default for WindowManager {
    fn default() -> Self {
        Self::from_config(&WindowConfig::default())
    }
}

impl WindowManager {
    pub fn new(policy: OverflowPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn from_config(config: &WindowConfig) -> Self {
        Self {
            policy: config.overflow,
            fast_path_ratio: config.fast_path_ratio,
            output_buffer: config.output_buffer,
            context_window: config.context_window,
        }
    }

    /// Select the part of `history` that may be sent for `model` within `budget` tokens.
    ///
    /// The result is a contiguous suffix of the non-system turns, prefixed by the
    /// leading system turn when the history starts with one.
    pub async fn select_window<C>(
        &self,
        counter: &C,
        history: &[Turn],
        model: &ModelId,
        budget: i64,
    ) -> Result<Vec<Message>, WindowError>
    where
        C: TokenCounter + ?Sized,
    {
        self.select(counter, history, model, budget, None).await
    }

    /// [`select_window`](Self::select_window) that fails with `Cancelled` once `cancel` fires.
    pub async fn select_window_cancellable<C>(
        &self,
        counter: &C,
        history: &[Turn],
        model: &ModelId,
        budget: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>, WindowError>
    where
        C: TokenCounter + ?Sized,
    {
        self.select(counter, history, model, budget, Some(cancel)).await
    }

    /// Pack ranked snippets into a single system prompt of at most `budget` tokens.
    ///
    /// Snippets are taken from the front, whole or not at all, and joined by newlines.
    pub async fn pack_system_prompt<C, S>(
        &self,
        counter: &C,
        snippets: &[S],
        model: &ModelId,
        budget: i64,
    ) -> Result<String, WindowError>
    where
        C: TokenCounter + ?Sized,
        S: AsRef<str>,
    {
        self.pack(counter, snippets, model, budget, None).await
    }

    /// [`pack_system_prompt`](Self::pack_system_prompt) that fails with `Cancelled` once `cancel` fires.
    pub async fn pack_system_prompt_cancellable<C, S>(
        &self,
        counter: &C,
        snippets: &[S],
        model: &ModelId,
        budget: i64,
        cancel: &CancellationToken,
    ) -> Result<String, WindowError>
    where
        C: TokenCounter + ?Sized,
        S: AsRef<str>,
    {
        self.pack(counter, snippets, model, budget, Some(cancel)).await
    }

    /// Context window of `model`, honouring the configured override.
    pub fn context_window(&self, model: &ModelId) -> usize {
        self.context_window
            .unwrap_or_else(|| ModelMetadata::for_model(model).context_window)
    }

    /// Token budget left for the whole message list of `model`.
    ///
    /// history_budget = context_window - output_buffer
    pub fn history_budget(&self, model: &ModelId) -> Result<i64, WindowError> {
        let budget = self.context_window(model) as i64 - self.output_buffer as i64;
        if budget <= 0 {
            return Err(WindowError::InvalidBudget(budget));
        }
        Ok(budget)
    }

    /// Tokens still available for conversation turns once `system_prompt` is sent.
    pub async fn available_tokens<C>(
        &self,
        counter: &C,
        model: &ModelId,
        system_prompt: &str,
    ) -> Result<usize, WindowError>
    where
        C: TokenCounter + ?Sized,
    {
        let budget = self.history_budget(model)? as usize;
        let system = [Message::system(normalize(system_prompt))];
        let used = count_tokens(counter, model, &system, None).await?;
        Ok(budget.saturating_sub(used))
    }

    /// Build the final message list for `model`.
    ///
    /// Knowledge snippets are packed within `knowledge_budget` and appended to the
    /// persona; the result becomes the leading system turn (replacing one already at
    /// the head of the history). The window is then selected against
    /// [`history_budget`](Self::history_budget).
    pub async fn assemble<C>(
        &self,
        counter: &C,
        model: &ModelId,
        parts: &PromptParts<'_>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Message>, WindowError>
    where
        C: TokenCounter + ?Sized,
    {
        let budget = self.history_budget(model)?;

        let knowledge = if parts.snippets.is_empty() {
            String::new()
        } else {
            self.pack(counter, parts.snippets, model, parts.knowledge_budget, cancel)
                .await?
        };
        let system_text = compose_system_prompt(parts.persona, &knowledge);

        let mut history = parts.history;
        if !system_text.is_empty() {
            if let Some((first, rest)) = history.split_first() {
                if first.speaker == Speaker::System {
                    debug!("replacing leading system turn with composed prompt");
                    history = rest;
                }
            }
        }

        let mut turns = Vec::with_capacity(history.len() + 1);
        if !system_text.is_empty() {
            turns.push(Turn::system(system_text));
        }
        turns.extend_from_slice(history);

        self.select(counter, &turns, model, budget, cancel).await
    }

    async fn select<C>(
        &self,
        counter: &C,
        history: &[Turn],
        model: &ModelId,
        budget: i64,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Message>, WindowError>
    where
        C: TokenCounter + ?Sized,
    {
        let limit = check_budget(budget)?;
        check_cancelled(cancel)?;

        let mut messages: Vec<Message> = history.iter().map(Turn::to_message).collect();
        if messages.iter().skip(1).any(|m| m.role == Role::System) {
            warn!(model = %model, "system turn found after the start of the history");
        }

        // Characters are a cheap stand-in for tokens on short conversations
        let total_len: usize = messages.iter().map(|m| m.content.chars().count()).sum();
        if (total_len as f64) < budget as f64 * self.fast_path_ratio {
            debug!(
                model = %model,
                budget,
                total_len,
                turns = messages.len(),
                "history below fast-path threshold, skipping token count"
            );
            return Ok(messages);
        }

        let has_system = messages.first().is_some_and(|m| m.role == Role::System);
        let system_prompt = if has_system { Some(messages.remove(0)) } else { None };
        let offset = usize::from(system_prompt.is_some());

        let mut window = Vec::with_capacity(messages.len() + offset);
        window.extend(system_prompt);

        // Newest first; each turn goes in right after the system prompt
        for msg in messages.into_iter().rev() {
            window.insert(offset, msg);
            let tokens = count_tokens(counter, model, &window, cancel).await?;
            if tokens >= limit {
                let kept = window.len() - offset;
                if self.policy == OverflowPolicy::Strict && kept > 1 {
                    window.remove(offset);
                }
                debug!(
                    model = %model,
                    budget,
                    tokens,
                    turns = window.len() - offset,
                    policy = ?self.policy,
                    "window reached token budget"
                );
                return Ok(window);
            }
        }

        Ok(window)
    }

    async fn pack<C, S>(
        &self,
        counter: &C,
        snippets: &[S],
        model: &ModelId,
        budget: i64,
        cancel: Option<&CancellationToken>,
    ) -> Result<String, WindowError>
    where
        C: TokenCounter + ?Sized,
        S: AsRef<str>,
    {
        let limit = check_budget(budget)?;
        check_cancelled(cancel)?;

        let mut packed = String::new();
        for (index, snippet) in snippets.iter().enumerate() {
            let before = packed.len();
            packed.push_str(&normalize(snippet.as_ref()));
            packed.push('\n');

            let candidate = [Message::system(packed.as_str())];
            let tokens = count_tokens(counter, model, &candidate, cancel).await?;
            if tokens >= limit {
                if self.policy == OverflowPolicy::Strict {
                    packed.truncate(before);
                }
                debug!(
                    model = %model,
                    budget,
                    tokens,
                    snippet = index,
                    total = snippets.len(),
                    policy = ?self.policy,
                    "system prompt reached token budget"
                );
                break;
            }
        }

        if packed.ends_with('\n') {
            packed.pop();
        }
        Ok(packed)
    }
}

/// Join persona and packed knowledge into one system prompt text.
pub fn compose_system_prompt(persona: &str, knowledge: &str) -> String {
    let persona = normalize(persona);
    if knowledge.is_empty() {
        return persona;
    }
    if persona.is_empty() {
        format!("{}\n{}", KNOWLEDGE_LEAD_IN, knowledge)
    } else {
        format!("{}\n{}\n{}", persona, KNOWLEDGE_LEAD_IN, knowledge)
    }
}

fn check_budget(budget: i64) -> Result<usize, WindowError> {
    if budget <= 0 {
        return Err(WindowError::InvalidBudget(budget));
    }
    usize::try_from(budget).map_err(|_| WindowError::InvalidBudget(budget))
}

fn check_cancelled(cancel: Option<&CancellationToken>) -> Result<(), WindowError> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(WindowError::Cancelled),
        _ => Ok(()),
    }
}

async fn count_tokens<C>(
    counter: &C,
    model: &ModelId,
    messages: &[Message],
    cancel: Option<&CancellationToken>,
) -> Result<usize, WindowError>
where
    C: TokenCounter + ?Sized,
{
    let counted = match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => return Err(WindowError::Cancelled),
            counted = counter.count_tokens(model, messages) => counted,
        },
        None => counter.count_tokens(model, messages).await,
    };
    counted.map_err(WindowError::OracleFailure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::tokens::CharEstimateCounter;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// chars / 4, remembering how often it was asked
    #[derive(Default)]
    struct CountingCounter {
        inner: CharEstimateCounter,
        calls: AtomicUsize,
    }

    impl CountingCounter {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenCounter for CountingCounter {
        async fn count_tokens(&self, _model: &ModelId, messages: &[Message]) -> anyhow::Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.inner.estimate(messages))
        }
    }

    /// Fixed answers keyed by the content of a single system message
    struct TableCounter(HashMap<&'static str, usize>);

    #[async_trait]
    impl TokenCounter for TableCounter {
        async fn count_tokens(&self, _model: &ModelId, messages: &[Message]) -> anyhow::Result<usize> {
            let content = messages[0].content.as_str();
            self.0
                .get(content)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("unexpected input {:?}", content))
        }
    }

    struct FailingCounter;

    #[async_trait]
    impl TokenCounter for FailingCounter {
        async fn count_tokens(&self, _model: &ModelId, _messages: &[Message]) -> anyhow::Result<usize> {
            Err(anyhow::anyhow!("tokenizer offline"))
        }
    }

    /// Cancels the token on first use, then never answers
    struct CancelOnCall(CancellationToken);

    #[async_trait]
    impl TokenCounter for CancelOnCall {
        async fn count_tokens(&self, _model: &ModelId, _messages: &[Message]) -> anyhow::Result<usize> {
            self.0.cancel();
            std::future::pending().await
        }
    }

    fn model() -> ModelId {
        ModelId::from("gpt-3.5-turbo")
    }

    fn strict() -> WindowManager {
        WindowManager::new(OverflowPolicy::Strict)
    }

    fn long_conversation(turns: usize, chars: usize) -> Vec<Turn> {
        (0..turns)
            .map(|i| {
                let text = format!("{}{}", i % 10, "x".repeat(chars - 1));
                if i % 2 == 0 {
                    Turn::human(text)
                } else {
                    Turn::ai(text)
                }
            })
            .collect()
    }

    /// system = 10 tokens, turns = 100, 10, 20, 30 tokens (oldest first)
    fn graded_history() -> Vec<Turn> {
        vec![
            Turn::system("s".repeat(40)),
            Turn::human("a".repeat(400)),
            Turn::ai("b".repeat(40)),
            Turn::human("c".repeat(80)),
            Turn::ai("d".repeat(120)),
        ]
    }

    #[tokio::test]
    async fn test_fast_path_returns_everything_without_counting() {
        let counter = CountingCounter::default();
        let history = vec![Turn::system("You are helpful"), Turn::human("hi")];

        let window = WindowManager::default()
            .select_window(&counter, &history, &model(), 1_000_000)
            .await
            .unwrap();

        assert_eq!(window, vec![Message::system("You are helpful"), Message::user("hi")]);
        assert_eq!(counter.calls(), 0);
    }

    #[tokio::test]
    async fn test_fast_path_still_normalizes() {
        let counter = CountingCounter::default();
        let history = vec![Turn::human("  hi \n\n there ")];

        let window = WindowManager::default()
            .select_window(&counter, &history, &model(), 1_000)
            .await
            .unwrap();

        assert_eq!(window, vec![Message::user("hi \n there")]);
    }

    #[tokio::test]
    async fn test_long_history_keeps_recent_turns() {
        let counter = CountingCounter::default();
        let history = long_conversation(50, 500);

        let window = WindowManager::default()
            .select_window(&counter, &history, &model(), 200)
            .await
            .unwrap();

        // 125 tokens per turn: the second turn crosses 200 and is kept
        assert_eq!(window.len(), 2);
        assert_eq!(window[0], history[48].to_message());
        assert_eq!(window[1], history[49].to_message());
        assert_ne!(window[0].role, Role::System);
        assert_eq!(counter.calls(), 2);
    }

    #[tokio::test]
    async fn test_strict_drops_the_overflowing_turn() {
        let counter = CountingCounter::default();
        let history = long_conversation(50, 500);

        let window = strict()
            .select_window(&counter, &history, &model(), 200)
            .await
            .unwrap();

        assert_eq!(window, vec![history[49].to_message()]);
    }

    #[tokio::test]
    async fn test_strict_keeps_single_oversized_recent_turn() {
        let counter = CountingCounter::default();
        let history = vec![Turn::system("rules"), Turn::human("z".repeat(4_000))];

        let window = strict()
            .select_window(&counter, &history, &model(), 100)
            .await
            .unwrap();

        assert_eq!(window.len(), 2);
        assert_eq!(window[0].role, Role::System);
        assert_eq!(window[1].content.len(), 4_000);
    }

    #[tokio::test]
    async fn test_window_is_longest_suffix_reaching_budget() {
        let counter = CountingCounter::default();
        let history = graded_history();
        let expected: Vec<Message> = history.iter().map(Turn::to_message).collect();

        // 40 -> 60 -> 70 tokens: the third step crosses 65
        let window = WindowManager::default()
            .select_window(&counter, &history, &model(), 65)
            .await
            .unwrap();
        assert_eq!(window, vec![expected[0].clone(), expected[2].clone(), expected[3].clone(), expected[4].clone()]);
        assert_eq!(counter.calls(), 3);

        let window = strict()
            .select_window(&counter, &history, &model(), 65)
            .await
            .unwrap();
        assert_eq!(window, vec![expected[0].clone(), expected[3].clone(), expected[4].clone()]);
    }

    #[tokio::test]
    async fn test_whole_history_fits_after_counting() {
        let counter = CountingCounter::default();
        let history = graded_history();

        // 680 chars is over the fast-path threshold of 500 but only 170 tokens
        let window = WindowManager::default()
            .select_window(&counter, &history, &model(), 1_000)
            .await
            .unwrap();

        assert_eq!(window.len(), history.len());
        assert_eq!(counter.calls(), 4);
    }

    #[tokio::test]
    async fn test_system_message_survives_truncation() {
        let counter = CountingCounter::default();
        let mut history = vec![Turn::system("You answer in French.")];
        history.extend(long_conversation(30, 300));

        for manager in [WindowManager::default(), strict()] {
            for budget in [1, 50, 120, 400, 2_000] {
                let window = manager
                    .select_window(&counter, &history, &model(), budget)
                    .await
                    .unwrap();
                assert_eq!(window[0], Message::system("You answer in French."));
                assert!(window[1..].iter().all(|m| m.role != Role::System));
                // Contiguous suffix of the non-system turns
                let tail: Vec<Message> = history[history.len() - (window.len() - 1)..]
                    .iter()
                    .map(Turn::to_message)
                    .collect();
                assert_eq!(&window[1..], tail.as_slice());
            }
        }
    }

    #[tokio::test]
    async fn test_selection_is_idempotent() {
        let counter = CountingCounter::default();
        let history = long_conversation(40, 220);
        let manager = WindowManager::default();

        let first = manager.select_window(&counter, &history, &model(), 300).await.unwrap();
        let second = manager.select_window(&counter, &history, &model(), 300).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_empty_history() {
        let counter = CountingCounter::default();
        let window = WindowManager::default()
            .select_window(&counter, &[], &model(), 10)
            .await
            .unwrap();
        assert!(window.is_empty());
        assert_eq!(counter.calls(), 0);
    }

    #[tokio::test]
    async fn test_system_only_history() {
        let counter = CountingCounter::default();
        let history = vec![Turn::system("p".repeat(400))];

        let window = WindowManager::default()
            .select_window(&counter, &history, &model(), 10)
            .await
            .unwrap();

        assert_eq!(window, vec![history[0].to_message()]);
        assert_eq!(counter.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_budget() {
        let counter = CountingCounter::default();
        let manager = WindowManager::default();
        let history = vec![Turn::human("hi")];

        for budget in [0, -5] {
            let err = manager
                .select_window(&counter, &history, &model(), budget)
                .await
                .unwrap_err();
            assert!(matches!(err, WindowError::InvalidBudget(b) if b == budget));

            let err = manager
                .pack_system_prompt(&counter, &["fact"], &model(), budget)
                .await
                .unwrap_err();
            assert!(matches!(err, WindowError::InvalidBudget(_)));
        }

        // Checked before anything else, even for empty input
        let empty: [&str; 0] = [];
        assert!(manager.select_window(&counter, &[], &model(), 0).await.is_err());
        assert!(manager.pack_system_prompt(&counter, &empty, &model(), 0).await.is_err());
        assert_eq!(counter.calls(), 0);
    }

    #[tokio::test]
    async fn test_oracle_failure_propagates() {
        let history = long_conversation(10, 400);
        let err = WindowManager::default()
            .select_window(&FailingCounter, &history, &model(), 50)
            .await
            .unwrap_err();
        assert!(matches!(err, WindowError::OracleFailure(_)));
        assert!(err.to_string().contains("tokenizer offline"));

        let err = WindowManager::default()
            .pack_system_prompt(&FailingCounter, &["fact A"], &model(), 50)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "oracle_failure");
    }

    #[tokio::test]
    async fn test_works_through_trait_object() {
        let counter: std::sync::Arc<dyn TokenCounter> = std::sync::Arc::new(CharEstimateCounter::default());
        let history = long_conversation(50, 500);
        let window = WindowManager::default()
            .select_window(counter.as_ref(), &history, &model(), 200)
            .await
            .unwrap();
        assert_eq!(window.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let counter = CountingCounter::default();
        let token = CancellationToken::new();
        token.cancel();

        let err = WindowManager::default()
            .select_window_cancellable(&counter, &long_conversation(10, 400), &model(), 50, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, WindowError::Cancelled));

        let err = WindowManager::default()
            .pack_system_prompt_cancellable(&counter, &["fact"], &model(), 50, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, WindowError::Cancelled));
        assert_eq!(counter.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_mid_walk() {
        let token = CancellationToken::new();
        let counter = CancelOnCall(token.clone());

        let err = WindowManager::default()
            .select_window_cancellable(&counter, &long_conversation(10, 400), &model(), 50, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, WindowError::Cancelled));
    }

    fn fact_table() -> TableCounter {
        TableCounter(HashMap::from([
            ("fact A\n", 40),
            ("fact A\nfact B\n", 90),
            ("fact A\nfact B\nfact C\n", 140),
        ]))
    }

    #[tokio::test]
    async fn test_pack_keeps_overflowing_snippet() {
        let snippets = ["fact A", "fact B", "fact C"];
        let packed = WindowManager::default()
            .pack_system_prompt(&fact_table(), &snippets, &model(), 100)
            .await
            .unwrap();
        assert_eq!(packed, "fact A\nfact B\nfact C");
    }

    #[tokio::test]
    async fn test_pack_strict_stays_under_budget() {
        let snippets = ["fact A", "fact B", "fact C"];
        let packed = strict()
            .pack_system_prompt(&fact_table(), &snippets, &model(), 100)
            .await
            .unwrap();
        assert_eq!(packed, "fact A\nfact B");

        let packed = strict()
            .pack_system_prompt(&fact_table(), &snippets, &model(), 40)
            .await
            .unwrap();
        assert_eq!(packed, "");
    }

    #[tokio::test]
    async fn test_pack_everything_fits() {
        let snippets = ["fact A", "fact B", "fact C"];
        for manager in [WindowManager::default(), strict()] {
            let packed = manager
                .pack_system_prompt(&fact_table(), &snippets, &model(), 200)
                .await
                .unwrap();
            assert_eq!(packed, "fact A\nfact B\nfact C");
        }
    }

    #[tokio::test]
    async fn test_pack_empty_snippets() {
        let counter = CountingCounter::default();
        let empty: Vec<String> = Vec::new();
        let packed = WindowManager::default()
            .pack_system_prompt(&counter, &empty, &model(), 100)
            .await
            .unwrap();
        assert_eq!(packed, "");
        assert_eq!(counter.calls(), 0);
    }

    #[tokio::test]
    async fn test_pack_normalizes_snippets() {
        let counter = CountingCounter::default();
        let snippets = vec!["  fact   A  ".to_string(), "\n\nfact\t\tB\n".to_string()];
        let packed = WindowManager::default()
            .pack_system_prompt(&counter, &snippets, &model(), 1_000)
            .await
            .unwrap();
        assert_eq!(packed, "fact A\nfact B");
    }

    #[tokio::test]
    async fn test_pack_is_monotonic_in_budget() {
        let counter = CharEstimateCounter::default();
        let snippets: Vec<String> = (1..=8).map(|i| format!("snippet {} {}", i, "k".repeat(i * 7))).collect();

        for manager in [WindowManager::default(), strict()] {
            let mut previous: Vec<String> = Vec::new();
            for budget in 1..120 {
                let packed = manager
                    .pack_system_prompt(&counter, &snippets, &model(), budget)
                    .await
                    .unwrap();
                let lines: Vec<String> = if packed.is_empty() {
                    Vec::new()
                } else {
                    packed.split('\n').map(str::to_string).collect()
                };
                assert!(lines.len() >= previous.len(), "budget {} shrank the prompt", budget);
                assert_eq!(&lines[..previous.len()], previous.as_slice());
                assert_eq!(lines.as_slice(), &snippets[..lines.len()]);
                previous = lines;
            }
        }
    }

    #[test]
    fn test_context_window_override() {
        let model = ModelId::from("gpt-4");
        let mut manager = WindowManager::default();
        assert_eq!(manager.context_window(&model), 8_192);

        manager.context_window = Some(2_000);
        assert_eq!(manager.context_window(&model), 2_000);
        assert_eq!(
            manager.history_budget(&model).unwrap(),
            manager.context_window(&model) as i64 - manager.output_buffer as i64
        );
    }

    #[test]
    fn test_history_budget() {
        let manager = WindowManager::default();
        assert_eq!(manager.history_budget(&"gpt-4".into()).unwrap(), 8_192 - 512);

        let manager = WindowManager {
            context_window: Some(100),
            ..WindowManager::default()
        };
        assert!(matches!(
            manager.history_budget(&"gpt-4".into()),
            Err(WindowError::InvalidBudget(-412))
        ));
    }

    #[tokio::test]
    async fn test_available_tokens() {
        let manager = WindowManager {
            context_window: Some(1_000),
            output_buffer: 200,
            ..WindowManager::default()
        };
        let counter = CharEstimateCounter::default();
        let available = manager
            .available_tokens(&counter, &model(), &"q".repeat(400))
            .await
            .unwrap();
        assert_eq!(available, 700);
    }

    #[test]
    fn test_compose_system_prompt() {
        assert_eq!(compose_system_prompt("  Be brief. ", ""), "Be brief.");
        assert_eq!(
            compose_system_prompt("Be brief.", "fact A"),
            format!("Be brief.\n{}\nfact A", KNOWLEDGE_LEAD_IN)
        );
        assert_eq!(compose_system_prompt("", "fact A"), format!("{}\nfact A", KNOWLEDGE_LEAD_IN));
    }

    #[tokio::test]
    async fn test_assemble_replaces_leading_system_turn() {
        let manager = WindowManager {
            context_window: Some(300),
            output_buffer: 100,
            ..WindowManager::default()
        };
        let counter = CountingCounter::default();
        let snippets = vec!["Rust 1.0 shipped in 2015.".to_string()];
        let mut history = vec![Turn::system("old persona")];
        history.extend(long_conversation(20, 200));

        let parts = PromptParts {
            persona: "You are a Rust historian.",
            snippets: &snippets,
            knowledge_budget: 500,
            history: &history,
        };
        let window = manager.assemble(&counter, &model(), &parts, None).await.unwrap();

        assert_eq!(window[0].role, Role::System);
        assert!(window[0].content.starts_with("You are a Rust historian.\n"));
        assert!(window[0].content.ends_with("Rust 1.0 shipped in 2015."));
        assert!(window.iter().all(|m| m.content != "old persona"));
        // budget 200 tokens, 50 per turn: the fourth turn back crosses it
        assert_eq!(window.len(), 1 + 4);
        assert_eq!(window.last(), history.last().map(Turn::to_message).as_ref());
    }

    #[tokio::test]
    async fn test_assemble_without_persona_keeps_history_system_turn() {
        let counter = CountingCounter::default();
        let history = vec![Turn::system("keep me"), Turn::human("hi")];
        let parts = PromptParts {
            persona: "",
            snippets: &[],
            knowledge_budget: 100,
            history: &history,
        };
        let window = WindowManager::default()
            .assemble(&counter, &model(), &parts, None)
            .await
            .unwrap();
        assert_eq!(window, vec![Message::system("keep me"), Message::user("hi")]);
    }
}
