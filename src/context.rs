//! Context window management — token budgeting, pair-aware truncation, and
//! summarization of the conversation buffer.
//!
//! The #1 engineering challenge for agents. This module provides:
//! - Token estimation (fast, no external deps)
//! - Smart truncation (keep system prompt + recent, summarize the middle)
//! - A pluggable `Summarizer` for turning dropped history into a short note
//! - Max iterations / max tokens budget tracking

use crate::types::*;
use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Token estimation
// ---------------------------------------------------------------------------

/// Rough token estimate: ~4 chars per token for English text.
/// Good enough for context budgeting. Use tiktoken-rs for precision.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}

/// Estimate tokens for a single message
pub fn message_tokens(msg: &AgentMessage) -> usize {
    match msg {
        AgentMessage::Llm(m) => match m {
            Message::User { content, .. } => content_tokens(content) + 4,
            Message::Assistant { content, .. } => content_tokens(content) + 4,
            Message::ToolResult {
                content, tool_name, ..
            } => content_tokens(content) + estimate_tokens(tool_name) + 8,
        },
        AgentMessage::Extension { data, .. } => estimate_tokens(&data.to_string()) + 4,
    }
}

fn content_tokens(content: &[Content]) -> usize {
    content
        .iter()
        .map(|c| match c {
            Content::Text { text } => estimate_tokens(text),
            Content::Image { .. } => 1000,
            Content::Thinking { thinking, .. } => estimate_tokens(thinking),
            Content::ToolCall {
                name, arguments, ..
            } => estimate_tokens(name) + estimate_tokens(&arguments.to_string()) + 8,
        })
        .sum()
}

/// Estimate total tokens for a message list
pub fn total_tokens(messages: &[AgentMessage]) -> usize {
    messages.iter().map(message_tokens).sum()
}

/// Per-component token breakdown, surfaced on `AgentState` for observability.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TokenBreakdown {
    pub system: usize,
    pub tools: usize,
    pub summaries: usize,
    pub messages: usize,
    pub actual_usage: usize,
}

pub fn token_breakdown(
    system_prompt: &str,
    tools: &[ToolDefinitionLike],
    summaries: &[Summary],
    messages: &[AgentMessage],
    actual_usage: usize,
) -> TokenBreakdown {
    TokenBreakdown {
        system: estimate_tokens(system_prompt),
        tools: tools
            .iter()
            .map(|t| estimate_tokens(&t.name) + estimate_tokens(&t.description))
            .sum(),
        summaries: summaries.iter().map(|s| estimate_tokens(&s.text)).sum(),
        messages: total_tokens(messages),
        actual_usage,
    }
}

/// Minimal view of a tool definition, just enough for token accounting
/// without coupling `context` to the `provider` module.
pub struct ToolDefinitionLike {
    pub name: String,
    pub description: String,
}

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

/// A condensed note standing in for a span of removed messages.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub text: String,
    /// Number of messages this summary replaced.
    pub covered_messages: usize,
    pub created_at: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SummarizerError {
    #[error("summarizer unavailable: {0}")]
    Unavailable(String),
}

/// External collaborator that turns a span of messages about to be dropped
/// into a short prose summary. Typically backed by an LLM call; tests and
/// offline use can fall back to `NullSummarizer`.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        messages: &[AgentMessage],
        system_prompt: &str,
    ) -> Result<String, SummarizerError>;
}

/// Summarizes by truncating a concatenation of message text — no LLM call.
/// Used when no real `Summarizer` is configured, and in tests.
pub struct NullSummarizer {
    pub max_chars: usize,
}

impl Default for NullSummarizer {
    fn default() -> Self {
        Self { max_chars: 500 }
    }
}

#[async_trait]
impl Summarizer for NullSummarizer {
    async fn summarize(
        &self,
        messages: &[AgentMessage],
        _system_prompt: &str,
    ) -> Result<String, SummarizerError> {
        let mut text = String::new();
        for msg in messages {
            if let AgentMessage::Llm(m) = msg {
                let role = m.role();
                let snippet = message_text(m);
                if !snippet.is_empty() {
                    text.push_str(&format!("[{}] {}\n", role, snippet));
                }
            }
        }
        text.truncate(self.max_chars.min(text.len()));
        Ok(format!(
            "[Summary of {} earlier message(s)]: {}",
            messages.len(),
            text.trim()
        ))
    }
}

fn message_text(m: &Message) -> String {
    let content = match m {
        Message::User { content, .. } => content,
        Message::Assistant { content, .. } => content,
        Message::ToolResult { content, .. } => content,
    };
    content
        .iter()
        .filter_map(|c| match c {
            Content::Text { text } => Some(text.clone()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Context configuration
// ---------------------------------------------------------------------------

/// Configuration for context management
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Maximum context tokens (leave room for response)
    pub max_context_tokens: usize,
    /// Tokens reserved for the system prompt
    pub system_prompt_tokens: usize,
    /// Minimum recent messages to always keep
    pub keep_recent: usize,
    /// Minimum first messages to always keep (initial instructions, etc.)
    pub keep_first: usize,
    /// Trigger a truncation pass once usage exceeds
    /// `max_context_tokens * (1 + excess_threshold)`.
    pub excess_threshold: f64,
    /// Fraction of `max_context_tokens` removed from the oldest end per pass.
    pub batch_remove_percentage: f64,
    /// Cap on the number of retained summaries (oldest dropped first).
    pub max_summaries: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 100_000,
            system_prompt_tokens: 4_000,
            keep_recent: 10,
            keep_first: 2,
            excess_threshold: 0.25,
            batch_remove_percentage: 0.30,
            max_summaries: 6,
        }
    }
}

// ---------------------------------------------------------------------------
// Pair-aware compaction
// ---------------------------------------------------------------------------

/// Strategy for compacting a message list once it exceeds budget.
/// `DefaultCompaction` implements the pair-aware truncate+summarize pass
/// below; callers can swap in a different strategy (e.g. one that never
/// summarizes, for deterministic tests).
#[async_trait]
pub trait CompactionStrategy: Send + Sync {
    async fn compact(
        &self,
        messages: Vec<AgentMessage>,
        config: &ContextConfig,
        summarizer: Option<&(dyn Summarizer)>,
    ) -> Vec<AgentMessage>;
}

pub struct DefaultCompaction;

#[async_trait]
impl CompactionStrategy for DefaultCompaction {
    async fn compact(
        &self,
        messages: Vec<AgentMessage>,
        config: &ContextConfig,
        summarizer: Option<&(dyn Summarizer)>,
    ) -> Vec<AgentMessage> {
        compact_messages(messages, config, summarizer).await
    }
}

/// Find the index ranges of tool_call messages together with all of their
/// matching tool_result messages, so a truncation pass never separates one
/// from the other.
fn tool_call_ids(msg: &AgentMessage) -> Vec<String> {
    match msg {
        AgentMessage::Llm(Message::Assistant { content, .. }) => content
            .iter()
            .filter_map(|c| match c {
                Content::ToolCall { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn tool_result_id(msg: &AgentMessage) -> Option<&str> {
    match msg {
        AgentMessage::Llm(Message::ToolResult { tool_call_id, .. }) => Some(tool_call_id),
        _ => None,
    }
}

/// Extend a removal boundary so it never splits a tool_call from any of its
/// tool_result messages: if `end` falls strictly inside a pending pair, push
/// `end` forward until every tool_call before it has its results included.
fn extend_to_pair_boundary(messages: &[AgentMessage], end: usize) -> usize {
    let mut pending: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut boundary = end;
    for msg in messages.iter().take(end) {
        for id in tool_call_ids(msg) {
            pending.insert(id);
        }
        if let Some(id) = tool_result_id(msg) {
            pending.remove(id);
        }
    }
    if pending.is_empty() {
        return boundary;
    }
    // Walk forward from `end` until every pending tool_call's result is covered.
    for (i, msg) in messages.iter().enumerate().skip(end) {
        if pending.is_empty() {
            boundary = i;
            break;
        }
        if let Some(id) = tool_result_id(msg) {
            pending.remove(id);
        }
        boundary = i + 1;
    }
    boundary
}

/// Compact a message list against budget: if usage exceeds
/// `max_context_tokens * (1 + excess_threshold)`, remove the oldest batch
/// (sized `batch_remove_percentage * max_context_tokens`, extended to a
/// tool_call/tool_result pair boundary), summarize it, and prepend the
/// summary. `keep_first` / `keep_recent` messages are never removed.
pub async fn compact_messages(
    messages: Vec<AgentMessage>,
    config: &ContextConfig,
    summarizer: Option<&(dyn Summarizer)>,
) -> Vec<AgentMessage> {
    let budget = config.max_context_tokens.saturating_sub(config.system_prompt_tokens);
    let trigger = (budget as f64 * (1.0 + config.excess_threshold)) as usize;
    let current = total_tokens(&messages);

    if current <= trigger {
        return messages;
    }

    let len = messages.len();
    if len <= config.keep_first + config.keep_recent {
        return messages;
    }

    let protected_tail_start = len.saturating_sub(config.keep_recent);
    let removable_end = protected_tail_start.max(config.keep_first);

    // Size the removal batch in tokens, then translate to a message count by
    // walking forward from keep_first until that many tokens are covered.
    let batch_budget = (config.max_context_tokens as f64 * config.batch_remove_percentage) as usize;
    let mut covered = 0usize;
    let mut raw_end = config.keep_first;
    while raw_end < removable_end && covered < batch_budget.max(1) {
        covered += message_tokens(&messages[raw_end]);
        raw_end += 1;
    }
    if raw_end <= config.keep_first {
        return messages;
    }

    let end = extend_to_pair_boundary(&messages, raw_end).min(removable_end.max(raw_end));
    if end <= config.keep_first {
        return messages;
    }

    let removed_span = &messages[config.keep_first..end];
    let summary_text = match summarizer {
        Some(s) => s
            .summarize(removed_span, "")
            .await
            .unwrap_or_else(|_| fallback_summary_text(removed_span)),
        None => fallback_summary_text(removed_span),
    };

    let summary_msg = AgentMessage::Llm(Message::User {
        content: vec![Content::Text {
            text: format!(
                "[Context summary covering {} earlier message(s)]: {}",
                removed_span.len(),
                summary_text
            ),
        }],
        timestamp: now_ms(),
    });

    let mut result = Vec::with_capacity(len - (end - config.keep_first) + 1);
    result.extend_from_slice(&messages[..config.keep_first]);
    result.push(summary_msg);
    result.extend_from_slice(&messages[end..]);
    result
}

fn fallback_summary_text(messages: &[AgentMessage]) -> String {
    let mut text = String::new();
    for msg in messages {
        if let AgentMessage::Llm(m) = msg {
            let snippet = message_text(m);
            if !snippet.is_empty() {
                text.push_str(&snippet);
                text.push(' ');
            }
        }
    }
    if text.len() > 300 {
        text.truncate(300);
        text.push_str("...");
    }
    text.trim().to_string()
}

// ---------------------------------------------------------------------------
// Context window manager (programmatic, higher-level surface)
// ---------------------------------------------------------------------------

/// Owns a bounded list of `Summary` entries and exposes token accounting on
/// top of the raw `compact_messages` pass — the entry point `Agent` and
/// `AgentManager` use when they need to inspect or force compaction outside
/// the hot loop.
pub struct ContextWindowManager {
    pub config: ContextConfig,
    pub summaries: Vec<Summary>,
    summarizer: Option<std::sync::Arc<dyn Summarizer>>,
}

impl ContextWindowManager {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            summaries: Vec::new(),
            summarizer: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: std::sync::Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Run a compaction pass, recording any new summary (capped at
    /// `max_summaries`, oldest dropped first).
    pub async fn compact(&mut self, messages: Vec<AgentMessage>) -> Vec<AgentMessage> {
        let before = messages.len();
        let result = compact_messages(
            messages,
            &self.config,
            self.summarizer.as_deref(),
        )
        .await;
        if result.len() < before {
            self.summaries.push(Summary {
                text: "compaction pass".into(),
                covered_messages: before - result.len(),
                created_at: now_ms(),
            });
            if self.summaries.len() > self.config.max_summaries {
                let overflow = self.summaries.len() - self.config.max_summaries;
                self.summaries.drain(0..overflow);
            }
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Execution bounds
// ---------------------------------------------------------------------------

/// Execution limits for the agent loop
#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    pub max_turns: usize,
    pub max_total_tokens: usize,
    pub max_duration: std::time::Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_turns: 50,
            max_total_tokens: 1_000_000,
            max_duration: std::time::Duration::from_secs(600),
        }
    }
}

/// Tracks execution state against limits
pub struct ExecutionTracker {
    pub limits: ExecutionLimits,
    pub turns: usize,
    pub tokens_used: usize,
    pub started_at: std::time::Instant,
}

impl ExecutionTracker {
    pub fn new(limits: ExecutionLimits) -> Self {
        Self {
            limits,
            turns: 0,
            tokens_used: 0,
            started_at: std::time::Instant::now(),
        }
    }

    pub fn record_turn(&mut self, tokens: usize) {
        self.turns += 1;
        self.tokens_used += tokens;
    }

    /// Check if any limit has been exceeded. Returns the reason if so.
    pub fn check_limits(&self) -> Option<String> {
        if self.turns >= self.limits.max_turns {
            return Some(format!(
                "Max turns reached ({}/{})",
                self.turns, self.limits.max_turns
            ));
        }
        if self.tokens_used >= self.limits.max_total_tokens {
            return Some(format!(
                "Max tokens reached ({}/{})",
                self.tokens_used, self.limits.max_total_tokens
            ));
        }
        let elapsed = self.started_at.elapsed();
        if elapsed >= self.limits.max_duration {
            return Some(format!(
                "Max duration reached ({:.0}s/{:.0}s)",
                elapsed.as_secs_f64(),
                self.limits.max_duration.as_secs_f64()
            ));
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert!(estimate_tokens("hello world") > 0);
        assert!(estimate_tokens("hello world") < 10);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[tokio::test]
    async fn test_compact_within_budget() {
        let messages = vec![
            AgentMessage::Llm(Message::user("Hello")),
            AgentMessage::Llm(Message::user("World")),
        ];
        let config = ContextConfig::default();
        let result = compact_messages(messages.clone(), &config, None).await;
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn test_compact_drops_middle() {
        let mut messages = Vec::new();
        for i in 0..100 {
            messages.push(AgentMessage::Llm(Message::user(format!(
                "Message {} with some content to use up tokens: {}",
                i,
                "x".repeat(200)
            ))));
        }

        let config = ContextConfig {
            max_context_tokens: 500,
            system_prompt_tokens: 100,
            keep_recent: 5,
            keep_first: 2,
            ..Default::default()
        };

        let result = compact_messages(messages, &config, None).await;

        assert!(result.len() < 100);
        assert!(result.len() >= config.keep_first + config.keep_recent);
    }

    #[tokio::test]
    async fn test_compact_preserves_tool_call_result_pairs() {
        // A tool_call followed immediately by its tool_result, surrounded by
        // enough filler to trigger truncation. The pass must never keep one
        // without the other.
        let mut messages = vec![AgentMessage::Llm(Message::user("start"))];
        for i in 0..20 {
            messages.push(AgentMessage::Llm(Message::user(format!(
                "filler {} {}",
                i,
                "x".repeat(100)
            ))));
        }
        messages.push(AgentMessage::Llm(Message::Assistant {
            content: vec![Content::ToolCall {
                id: "tc-1".into(),
                name: "read_file".into(),
                arguments: serde_json::json!({}),
            }],
            stop_reason: StopReason::ToolUse,
            model: "mock".into(),
            provider: "mock".into(),
            usage: Usage::default(),
            timestamp: 0,
            error_message: None,
        }));
        messages.push(AgentMessage::Llm(Message::ToolResult {
            tool_call_id: "tc-1".into(),
            tool_name: "read_file".into(),
            content: vec![Content::Text {
                text: "result".into(),
            }],
            is_error: false,
            timestamp: 0,
        }));
        for i in 0..10 {
            messages.push(AgentMessage::Llm(Message::user(format!("tail {}", i))));
        }

        let config = ContextConfig {
            max_context_tokens: 400,
            system_prompt_tokens: 50,
            keep_recent: 5,
            keep_first: 1,
            ..Default::default()
        };

        let result = compact_messages(messages, &config, None).await;

        let has_call = result.iter().any(|m| !tool_call_ids(m).is_empty());
        let has_result = result.iter().any(|m| tool_result_id(m).is_some());
        assert_eq!(
            has_call, has_result,
            "tool_call and tool_result must be removed or kept together"
        );
    }

    #[test]
    fn test_execution_limits() {
        let limits = ExecutionLimits {
            max_turns: 3,
            max_total_tokens: 1000,
            max_duration: std::time::Duration::from_secs(60),
        };

        let mut tracker = ExecutionTracker::new(limits);
        assert!(tracker.check_limits().is_none());

        tracker.record_turn(100);
        tracker.record_turn(100);
        assert!(tracker.check_limits().is_none());

        tracker.record_turn(100);
        assert!(tracker.check_limits().is_some());
    }
}
