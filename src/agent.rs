//! Stateful Agent struct — wraps the agent loop with state management,
//! steering/follow-up queues, and abort support.

use crate::agent_loop::{
    agent_loop, agent_loop_continue, AfterTurnFn, AgentLoopConfig, BeforeTurnFn, OnErrorFn,
};
use crate::context::{self, ContextConfig, ExecutionLimits};
use crate::error::StorageError;
use crate::mcp::{McpClient, McpError, McpToolAdapter};
use crate::provider::StreamProvider;
use crate::types::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Per-component token accounting for an agent's buffer (SPEC §3 AgentState).
#[derive(Debug, Clone, Default)]
pub struct TokenStats {
    pub system: usize,
    pub tool: usize,
    pub project: usize,
    pub memories: usize,
    pub summaries: usize,
    pub messages: usize,
    pub actual_usage: usize,
}

impl TokenStats {
    fn recompute_total(&mut self) {
        self.actual_usage =
            self.system + self.tool + self.project + self.memories + self.summaries + self.messages;
    }
}

/// Run counters tracked alongside `TokenStats`.
#[derive(Debug, Clone, Default)]
pub struct AgentCounters {
    pub messages: u64,
    pub tool_calls: u64,
    pub errors: u64,
}

/// Per-agent runtime state: initialization flag, token stats, counters, and
/// the last recorded error. Grounded in `original_source/src/cue/schemas/`'s
/// agent state tracking; the teacher has no equivalent struct — this is the
/// expansion over it.
#[derive(Debug, Clone, Default)]
pub struct AgentState {
    pub has_initialized: bool,
    pub token_stats: TokenStats,
    pub counters: AgentCounters,
    pub last_error: Option<String>,
}

/// Debug dump returned by `Agent::snapshot()`.
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub messages: Vec<AgentMessage>,
    pub state: AgentState,
}

/// Persistence collaborator for agent messages, grounded in
/// `original_source/src/cue/services/message_storage_service.py`
/// (`persist_message`/`get_messages_asc`). Errors are recorded on
/// `AgentState` rather than propagated — persistence is best-effort.
#[async_trait::async_trait]
pub trait StorageClient: Send + Sync {
    /// Load up to `limit` most recent messages for `agent_id`, oldest first.
    async fn load_recent(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<AgentMessage>, StorageError>;

    /// Persist a message, returning its assigned storage id.
    async fn persist(&self, msg: &AgentMessage) -> Result<String, StorageError>;
}

/// Queue mode for steering and follow-up messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Deliver one message per turn
    OneAtATime,
    /// Deliver all queued messages at once
    All,
}

/// The main Agent. Owns state, tools, and provider.
pub struct Agent {
    // State
    pub system_prompt: String,
    pub model: String,
    pub api_key: String,
    pub thinking_level: ThinkingLevel,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    messages: Vec<AgentMessage>,
    tools: Vec<Box<dyn AgentTool>>,
    provider: Box<dyn StreamProvider>,

    // Queues (shared with the loop via Arc<Mutex>)
    steering_queue: Arc<Mutex<Vec<AgentMessage>>>,
    follow_up_queue: Arc<Mutex<Vec<AgentMessage>>>,
    steering_mode: QueueMode,
    follow_up_mode: QueueMode,

    // Context, limits & caching
    pub context_config: Option<ContextConfig>,
    pub execution_limits: Option<ExecutionLimits>,
    pub cache_config: CacheConfig,
    pub tool_execution: ToolExecutionStrategy,
    pub retry_config: crate::retry::RetryConfig,

    // should_continue (SPEC §4.F.7)
    is_production: bool,
    max_turns_prompt: Option<Arc<dyn Fn(usize) -> bool + Send + Sync>>,

    // Runtime state + storage integration
    state: AgentState,
    storage: Option<Arc<dyn StorageClient>>,

    // Lifecycle callbacks
    before_turn: Option<BeforeTurnFn>,
    after_turn: Option<AfterTurnFn>,
    on_error: Option<OnErrorFn>,

    // Control
    cancel: Option<CancellationToken>,
    is_streaming: bool,
}

impl Agent {
    pub fn new(provider: impl StreamProvider + 'static) -> Self {
        Self {
            system_prompt: String::new(),
            model: String::new(),
            api_key: String::new(),
            thinking_level: ThinkingLevel::Off,
            max_tokens: None,
            temperature: None,
            messages: Vec::new(),
            tools: Vec::new(),
            provider: Box::new(provider),
            steering_queue: Arc::new(Mutex::new(Vec::new())),
            follow_up_queue: Arc::new(Mutex::new(Vec::new())),
            steering_mode: QueueMode::OneAtATime,
            follow_up_mode: QueueMode::OneAtATime,
            context_config: Some(ContextConfig::default()),
            execution_limits: Some(ExecutionLimits::default()),
            cache_config: CacheConfig::default(),
            tool_execution: ToolExecutionStrategy::default(),
            retry_config: crate::retry::RetryConfig::default(),
            is_production: true,
            max_turns_prompt: None,
            state: AgentState::default(),
            storage: None,
            before_turn: None,
            after_turn: None,
            on_error: None,
            cancel: None,
            is_streaming: false,
        }
    }

    // -- Builder-style setters --

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = key.into();
        self
    }

    pub fn with_thinking(mut self, level: ThinkingLevel) -> Self {
        self.thinking_level = level;
        self
    }

    pub fn with_tools(mut self, tools: Vec<Box<dyn AgentTool>>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn with_context_config(mut self, config: ContextConfig) -> Self {
        self.context_config = Some(config);
        self
    }

    pub fn with_cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    pub fn with_tool_execution(mut self, strategy: ToolExecutionStrategy) -> Self {
        self.tool_execution = strategy;
        self
    }

    pub fn with_retry_config(mut self, config: crate::retry::RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// Switch to development mode: when `max_turns` is reached, `prompt` is
    /// asked to confirm raising the limit by 10 instead of stopping. In
    /// production (the default) a single "please summarize" turn is granted
    /// instead.
    pub fn with_development_mode(
        mut self,
        prompt: impl Fn(usize) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_production = false;
        self.max_turns_prompt = Some(Arc::new(prompt));
        self
    }

    pub fn with_execution_limits(mut self, limits: ExecutionLimits) -> Self {
        self.execution_limits = Some(limits);
        self
    }

    pub fn with_messages(mut self, msgs: Vec<AgentMessage>) -> Self {
        self.messages = msgs;
        self
    }

    pub fn on_before_turn(
        mut self,
        f: impl Fn(&[AgentMessage], usize) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.before_turn = Some(Arc::new(f));
        self
    }

    pub fn on_after_turn(
        mut self,
        f: impl Fn(&[AgentMessage], &Usage) + Send + Sync + 'static,
    ) -> Self {
        self.after_turn = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Add a sub-agent tool. The sub-agent runs its own `agent_loop()` when invoked.
    pub fn with_sub_agent(mut self, sub: crate::sub_agent::SubAgentTool) -> Self {
        self.tools.push(Box::new(sub));
        self
    }

    /// Disable automatic context compaction
    pub fn without_context_management(mut self) -> Self {
        self.context_config = None;
        self.execution_limits = None;
        self
    }

    /// Attach a storage collaborator. `initialize()` will load prior
    /// messages through it; `add_message`/`add_messages` persist through it.
    pub fn with_storage(mut self, storage: Arc<dyn StorageClient>) -> Self {
        self.storage = Some(storage);
        self
    }

    // -- MCP integration --

    /// Connect to an MCP server via stdio and add its tools to the agent.
    pub async fn with_mcp_server_stdio(
        mut self,
        command: &str,
        args: &[&str],
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, McpError> {
        let client = McpClient::connect_stdio(command, args, env).await?;
        let client = Arc::new(tokio::sync::Mutex::new(client));
        let adapters = McpToolAdapter::from_client(client).await?;
        for adapter in adapters {
            self.tools.push(Box::new(adapter));
        }
        Ok(self)
    }

    /// Connect to an MCP server via HTTP and add its tools to the agent.
    pub async fn with_mcp_server_http(mut self, url: &str) -> Result<Self, McpError> {
        let client = McpClient::connect_http(url).await?;
        let client = Arc::new(tokio::sync::Mutex::new(client));
        let adapters = McpToolAdapter::from_client(client).await?;
        for adapter in adapters {
            self.tools.push(Box::new(adapter));
        }
        Ok(self)
    }

    // -- State access --

    pub fn messages(&self) -> &[AgentMessage] {
        &self.messages
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// Idempotent; guarded by `has_initialized`. Loads up to 10 prior
    /// messages from storage (if configured) ahead of the current buffer,
    /// and seeds the `system` token-stats component from the system prompt.
    /// Storage failures are recorded on `AgentState`, never thrown.
    pub async fn initialize(&mut self, agent_id: &str) {
        if self.state.has_initialized {
            return;
        }

        self.state.token_stats.system = context::estimate_tokens(&self.system_prompt);

        if let Some(storage) = self.storage.clone() {
            match storage.load_recent(agent_id, 10).await {
                Ok(mut prior) => {
                    prior.append(&mut self.messages);
                    self.messages = prior;
                }
                Err(e) => {
                    self.state.counters.errors += 1;
                    self.state.last_error = Some(e.to_string());
                }
            }
        }

        self.recompute_message_stats();
        self.state.has_initialized = true;
    }

    /// Replace `AgentState` with a fresh one, optionally swapping the model.
    pub fn reset_state(&mut self, model_override: Option<String>) {
        self.state = AgentState::default();
        if let Some(model) = model_override {
            self.model = model;
        }
    }

    /// Debug dump of the current buffer and state.
    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            messages: self.messages.clone(),
            state: self.state.clone(),
        }
    }

    /// Append one message: persists it (if storage is configured), updates
    /// `AgentState` stats/counters, and recompacts the context if configured.
    pub async fn add_message(&mut self, msg: AgentMessage) {
        self.add_messages(vec![msg]).await
    }

    /// Append messages: persists each (if storage is configured), updates
    /// `AgentState` stats/counters/last_error, and recompacts the context —
    /// refreshing stats again — if truncation occurred.
    pub async fn add_messages(&mut self, msgs: Vec<AgentMessage>) {
        let storage = self.storage.clone();
        for msg in &msgs {
            self.record_counters(msg);
            if let Some(storage) = &storage {
                if let Err(e) = storage.persist(msg).await {
                    self.state.counters.errors += 1;
                    self.state.last_error = Some(e.to_string());
                }
            }
        }
        self.messages.extend(msgs);

        if let Some(ref ctx_config) = self.context_config {
            let before = self.messages.len();
            self.messages =
                context::compact_messages(std::mem::take(&mut self.messages), ctx_config, None).await;
            if self.messages.len() < before {
                tracing::debug!(
                    removed = before - self.messages.len(),
                    "context truncated during add_messages"
                );
            }
        }

        self.recompute_message_stats();
    }

    /// Update `messages`/`tool_calls`/`errors` counters and `last_error`
    /// for a single newly-added message. Token-stat components are
    /// recomputed in bulk by `recompute_message_stats` since truncation can
    /// change the whole buffer, not just the tail.
    fn record_counters(&mut self, msg: &AgentMessage) {
        self.state.counters.messages += 1;
        match msg {
            AgentMessage::Llm(Message::ToolResult {
                is_error, tool_name, ..
            }) => {
                self.state.counters.tool_calls += 1;
                if *is_error {
                    self.state.counters.errors += 1;
                    self.state.last_error = Some(format!("tool '{}' failed", tool_name));
                }
            }
            AgentMessage::Llm(Message::Assistant { error_message: Some(err), .. }) => {
                self.state.counters.errors += 1;
                self.state.last_error = Some(err.clone());
            }
            _ => {}
        }
    }

    /// Recompute the `tool`/`messages`/`summaries` token-stats components
    /// from the current buffer. `system`/`project`/`memories` are seeded
    /// elsewhere and left untouched.
    fn recompute_message_stats(&mut self) {
        self.state.token_stats.tool = 0;
        self.state.token_stats.messages = 0;
        for msg in &self.messages {
            let tokens = context::message_tokens(msg);
            let is_tool = matches!(msg, AgentMessage::Llm(Message::ToolResult { .. }))
                || matches!(
                    msg,
                    AgentMessage::Llm(Message::Assistant { content, .. })
                        if content.iter().any(|c| matches!(c, Content::ToolCall { .. }))
                );
            if is_tool {
                self.state.token_stats.tool += tokens;
            } else {
                self.state.token_stats.messages += tokens;
            }
        }
        self.state.token_stats.recompute_total();
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    pub fn set_tools(&mut self, tools: Vec<Box<dyn AgentTool>>) {
        self.tools = tools;
    }

    pub fn clear_messages(&mut self) {
        self.messages.clear();
    }

    pub fn append_message(&mut self, msg: AgentMessage) {
        self.messages.push(msg);
    }

    pub fn replace_messages(&mut self, msgs: Vec<AgentMessage>) {
        self.messages = msgs;
    }

    pub fn save_messages(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.messages)
    }

    pub fn restore_messages(&mut self, json: &str) -> Result<(), serde_json::Error> {
        let msgs: Vec<AgentMessage> = serde_json::from_str(json)?;
        self.messages = msgs;
        Ok(())
    }

    // -- Queue management --

    /// Queue a steering message (interrupts agent mid-tool-execution)
    pub fn steer(&self, msg: AgentMessage) {
        self.steering_queue.lock().unwrap().push(msg);
    }

    /// Queue a follow-up message (processed after agent finishes)
    pub fn follow_up(&self, msg: AgentMessage) {
        self.follow_up_queue.lock().unwrap().push(msg);
    }

    pub fn clear_steering_queue(&self) {
        self.steering_queue.lock().unwrap().clear();
    }

    pub fn clear_follow_up_queue(&self) {
        self.follow_up_queue.lock().unwrap().clear();
    }

    pub fn clear_all_queues(&self) {
        self.clear_steering_queue();
        self.clear_follow_up_queue();
    }

    pub fn set_steering_mode(&mut self, mode: QueueMode) {
        self.steering_mode = mode;
    }

    pub fn set_follow_up_mode(&mut self, mode: QueueMode) {
        self.follow_up_mode = mode;
    }

    // -- Control --

    pub fn abort(&self) {
        if let Some(ref cancel) = self.cancel {
            cancel.cancel();
        }
    }

    pub fn reset(&mut self) {
        self.messages.clear();
        self.clear_all_queues();
        self.is_streaming = false;
        self.cancel = None;
        self.reset_state(None);
    }

    // -- Prompting --

    /// Send a text prompt. Returns a stream of AgentEvents.
    pub async fn prompt(&mut self, text: impl Into<String>) -> mpsc::UnboundedReceiver<AgentEvent> {
        let msg = AgentMessage::Llm(Message::user(text));
        self.prompt_messages(vec![msg]).await
    }

    /// Send messages as a prompt.
    pub async fn prompt_messages(
        &mut self,
        messages: Vec<AgentMessage>,
    ) -> mpsc::UnboundedReceiver<AgentEvent> {
        assert!(
            !self.is_streaming,
            "Agent is already streaming. Use steer() or follow_up()."
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());
        self.is_streaming = true;

        // Build context
        let mut context = AgentContext {
            system_prompt: self.system_prompt.clone(),
            messages: self.messages.clone(),
            tools: Vec::new(), // Tools stay on Agent, referenced via config
        };

        // Move tools temporarily
        let tools = std::mem::take(&mut self.tools);
        context.tools = tools;

        let config = self.build_config();

        let _new_messages = agent_loop(messages, &mut context, &config, tx.clone(), cancel).await;

        // Restore tools and update state
        self.tools = context.tools;
        self.messages = context.messages;
        self.is_streaming = false;
        self.cancel = None;

        rx
    }

    /// Continue from current context (for retries after errors).
    pub async fn continue_loop(&mut self) -> mpsc::UnboundedReceiver<AgentEvent> {
        assert!(!self.is_streaming, "Agent is already streaming.");
        assert!(!self.messages.is_empty(), "No messages to continue from.");

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());
        self.is_streaming = true;

        let mut context = AgentContext {
            system_prompt: self.system_prompt.clone(),
            messages: self.messages.clone(),
            tools: std::mem::take(&mut self.tools),
        };

        let config = self.build_config();

        let _new_messages = agent_loop_continue(&mut context, &config, tx.clone(), cancel).await;

        self.tools = context.tools;
        self.messages = context.messages;
        self.is_streaming = false;
        self.cancel = None;

        rx
    }

    // -- Internal --

    fn build_config(&self) -> AgentLoopConfig<'_> {
        let steering_queue = self.steering_queue.clone();
        let steering_mode = self.steering_mode;

        let follow_up_queue = self.follow_up_queue.clone();
        let follow_up_mode = self.follow_up_mode;

        AgentLoopConfig {
            provider: &*self.provider,
            model: self.model.clone(),
            api_key: self.api_key.clone(),
            thinking_level: self.thinking_level,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            convert_to_llm: None,
            transform_context: None,
            get_steering_messages: Some(Box::new(move || {
                let mut queue = steering_queue.lock().unwrap();
                match steering_mode {
                    QueueMode::OneAtATime => {
                        if queue.is_empty() {
                            vec![]
                        } else {
                            vec![queue.remove(0)]
                        }
                    }
                    QueueMode::All => queue.drain(..).collect(),
                }
            })),
            context_config: self.context_config.clone(),
            execution_limits: self.execution_limits.clone(),
            cache_config: self.cache_config.clone(),
            tool_execution: self.tool_execution.clone(),
            retry_config: self.retry_config.clone(),
            is_production: self.is_production,
            max_turns_prompt: self.max_turns_prompt.clone(),
            get_follow_up_messages: Some(Box::new(move || {
                let mut queue = follow_up_queue.lock().unwrap();
                match follow_up_mode {
                    QueueMode::OneAtATime => {
                        if queue.is_empty() {
                            vec![]
                        } else {
                            vec![queue.remove(0)]
                        }
                    }
                    QueueMode::All => queue.drain(..).collect(),
                }
            })),
            before_turn: self.before_turn.clone(),
            after_turn: self.after_turn.clone(),
            on_error: self.on_error.clone(),
        }
    }
}
