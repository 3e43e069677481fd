use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Content types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Content {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    #[serde(rename = "thinking")]
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    #[serde(rename = "toolCall")]
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum Message {
    #[serde(rename = "user")]
    User {
        content: Vec<Content>,
        timestamp: u64,
    },
    #[serde(rename = "assistant")]
    Assistant {
        content: Vec<Content>,
        #[serde(rename = "stopReason")]
        stop_reason: StopReason,
        model: String,
        provider: String,
        usage: Usage,
        timestamp: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    #[serde(rename = "toolResult")]
    ToolResult {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        content: Vec<Content>,
        #[serde(rename = "isError")]
        is_error: bool,
        timestamp: u64,
    },
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            content: vec![Content::Text { text: text.into() }],
            timestamp: now_ms(),
        }
    }

    pub fn role(&self) -> &str {
        match self {
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::ToolResult { .. } => "toolResult",
        }
    }
}

// ---------------------------------------------------------------------------
// AgentMessage — LLM messages + extensible custom types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentMessage {
    /// Standard LLM message
    Llm(Message),
    /// App-specific message (UI-only, notifications, etc.)
    Extension {
        role: String,
        #[serde(flatten)]
        data: serde_json::Value,
    },
}

impl AgentMessage {
    pub fn role(&self) -> &str {
        match self {
            Self::Llm(m) => m.role(),
            Self::Extension { role, .. } => role,
        }
    }

    pub fn as_llm(&self) -> Option<&Message> {
        match self {
            Self::Llm(m) => Some(m),
            _ => None,
        }
    }
}

impl From<Message> for AgentMessage {
    fn from(m: Message) -> Self {
        Self::Llm(m)
    }
}

// ---------------------------------------------------------------------------
// Stop reasons & usage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    Stop,
    Length,
    ToolUse,
    Error,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_write: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    /// Fraction of input tokens served from cache (0.0–1.0).
    /// Returns 0.0 if no input tokens were processed.
    pub fn cache_hit_rate(&self) -> f64 {
        let total_input = self.input + self.cache_read + self.cache_write;
        if total_input == 0 {
            return 0.0;
        }
        self.cache_read as f64 / total_input as f64
    }
}

// ---------------------------------------------------------------------------
// Cache configuration
// ---------------------------------------------------------------------------

/// Controls prompt caching behavior for providers that support it.
///
/// By default, caching is enabled with automatic breakpoint placement.
/// This gives optimal cost savings without any user configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Master switch — set to false to disable all caching hints.
    /// Default: true.
    pub enabled: bool,
    /// How cache breakpoints are placed.
    pub strategy: CacheStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: CacheStrategy::Auto,
        }
    }
}

/// Strategy for placing cache breakpoints (Anthropic-specific; other providers
/// handle caching automatically regardless of this setting).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CacheStrategy {
    /// Automatic breakpoint placement (recommended).
    /// Caches: system prompt, tool definitions, and recent conversation history.
    #[default]
    Auto,
    /// Disable caching entirely.
    Disabled,
    /// Fine-grained control over what gets cached.
    Manual {
        /// Cache the system prompt.
        cache_system: bool,
        /// Cache tool definitions.
        cache_tools: bool,
        /// Cache conversation history (second-to-last message).
        cache_messages: bool,
    },
}

// ---------------------------------------------------------------------------
// Thinking level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Minimal,
    Low,
    Medium,
    High,
}

// ---------------------------------------------------------------------------
// Tool definition
// ---------------------------------------------------------------------------

/// Callback a tool may use to stream partial output while it runs
/// (e.g. incremental bash output, progress on a long-running sub-agent).
pub type ToolUpdateFn = std::sync::Arc<dyn Fn(ToolResult) + Send + Sync>;

/// A tool the agent can call. Implement this trait for your tools.
#[async_trait::async_trait]
pub trait AgentTool: Send + Sync {
    /// Unique tool name (used in LLM tool_use)
    fn name(&self) -> &str;
    /// Human-readable label for UI
    fn label(&self) -> &str;
    /// Description for the LLM
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> serde_json::Value;
    /// Execute the tool.
    ///
    /// `on_update`, when present, lets a long-running tool push partial
    /// results before it finishes (forwarded to the UI as
    /// `AgentEvent::ToolExecutionUpdate`).
    async fn execute(
        &self,
        tool_call_id: &str,
        params: serde_json::Value,
        cancel: tokio_util::sync::CancellationToken,
        on_update: Option<ToolUpdateFn>,
    ) -> Result<ToolResult, ToolError>;
}

// ---------------------------------------------------------------------------
// Tool execution strategy (Tool Dispatcher)
// ---------------------------------------------------------------------------

/// How a turn's tool calls are dispatched.
#[derive(Debug, Clone)]
pub enum ToolExecutionStrategy {
    /// Run tool calls one at a time, in the order the model emitted them.
    /// A steering message arriving between calls skips the remaining ones.
    Sequential,
    /// Launch every tool call in a turn concurrently, bounded by
    /// `max_concurrent` in flight at once and a per-call timeout.
    Parallel {
        max_concurrent: usize,
        timeout: std::time::Duration,
    },
}

impl Default for ToolExecutionStrategy {
    fn default() -> Self {
        Self::Parallel {
            max_concurrent: 8,
            timeout: std::time::Duration::from_secs(120),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent transfer (handoff to another agent)
// ---------------------------------------------------------------------------

/// Default number of trailing messages carried across an agent transfer.
pub const DEFAULT_TRANSFER_MAX_MESSAGES: usize = 6;
/// Hard ceiling on `AgentTransfer::max_messages`.
pub const MAX_TRANSFER_MAX_MESSAGES: usize = 12;

/// Emitted by the `agent_transfer` tool to hand the conversation off to
/// another agent (or back to the primary agent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTransfer {
    /// Target agent id. `None` together with `transfer_to_primary = true`
    /// means "hand back to the primary agent".
    pub to_agent_id: Option<String>,
    /// Message to open the target agent's turn with.
    pub message: String,
    /// How many trailing messages of context to carry over.
    /// 0 means only `message` is sent. Clamped to `MAX_TRANSFER_MAX_MESSAGES`.
    #[serde(default = "default_transfer_max_messages")]
    pub max_messages: usize,
    #[serde(default)]
    pub transfer_to_primary: bool,
}

fn default_transfer_max_messages() -> usize {
    DEFAULT_TRANSFER_MAX_MESSAGES
}

impl AgentTransfer {
    /// Clamp `max_messages` to the allowed range, per the invariant in
    /// `AgentTransfer::max_messages ∈ [0, 12]`.
    pub fn clamped_max_messages(&self) -> usize {
        self.max_messages.min(MAX_TRANSFER_MAX_MESSAGES)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolResult {
    pub content: Vec<Content>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::Text { text: text.into() }],
            details: serde_json::Value::Null,
        }
    }

    /// The dispatcher recognizes a tool named `agent_transfer` whose
    /// `details` carry a serialized `AgentTransfer`; this lets any tool
    /// signal a handoff without widening the struct every tool constructs.
    pub fn as_agent_transfer(&self) -> Option<AgentTransfer> {
        serde_json::from_value(self.details.clone()).ok()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    Failed(String),
    #[error("Tool not found: {0}")]
    NotFound(String),
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("Cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Agent events (for streaming UI updates)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum AgentEvent {
    AgentStart,
    AgentEnd {
        messages: Vec<AgentMessage>,
    },
    TurnStart,
    TurnEnd {
        message: AgentMessage,
        tool_results: Vec<Message>,
    },
    MessageStart {
        message: AgentMessage,
    },
    MessageUpdate {
        message: AgentMessage,
        delta: StreamDelta,
    },
    MessageEnd {
        message: AgentMessage,
    },
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },
    ToolExecutionUpdate {
        tool_call_id: String,
        tool_name: String,
        partial_result: ToolResult,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        result: ToolResult,
        is_error: bool,
    },
    /// Raised when a turn's tool batch resolves to an `agent_transfer`
    /// handoff. The Agent Manager listens for this to switch the active
    /// agent; a bare `Agent` with no manager just ends its run after it.
    Transfer {
        transfer: AgentTransfer,
    },
}

#[derive(Debug, Clone)]
pub enum StreamDelta {
    Text { delta: String },
    Thinking { delta: String },
    ToolCallDelta { delta: String },
}

// ---------------------------------------------------------------------------
// Streaming hooks
// ---------------------------------------------------------------------------

/// Observes and optionally rewrites the Streaming Engine's output as it
/// flows out of a turn. Every method has a default no-op implementation —
/// implement only the ones you need.
///
/// `on_text_chunk` / `on_tool_end` may return `Some(replacement)` to rewrite
/// what reaches the transcript (e.g. redacting a secret from tool output).
#[async_trait::async_trait]
pub trait Hooks: Send + Sync {
    async fn on_stream_start(&self) {}
    async fn on_text_chunk(&self, _delta: &str) -> Option<String> {
        None
    }
    async fn on_tool_start(&self, _tool_call_id: &str, _tool_name: &str) {}
    async fn on_tool_end(&self, _tool_call_id: &str, _result: &ToolResult) -> Option<ToolResult> {
        None
    }
    async fn on_stream_end(&self, _message: &Message) {}
}

// ---------------------------------------------------------------------------
// Agent context (passed to the loop)
// ---------------------------------------------------------------------------

pub struct AgentContext {
    pub system_prompt: String,
    pub messages: Vec<AgentMessage>,
    pub tools: Vec<Box<dyn AgentTool>>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Length => write!(f, "length"),
            Self::ToolUse => write!(f, "toolUse"),
            Self::Error => write!(f, "error"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}
