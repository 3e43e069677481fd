//! The core agent loop: prompt → LLM stream → tool execution → repeat.
//!
//! This is the heart of the runtime:
//!
//! - `agent_loop()` starts with new prompt messages
//! - `agent_loop_continue()` resumes from existing context
//!
//! Both return a stream of `AgentEvent`s.

use crate::context::{self, ContextConfig, ExecutionLimits, ExecutionTracker};
use crate::dispatcher::{ProviderDialect, ToolBatchOutcome, ToolDispatcher};
use crate::provider::{ProviderError, StreamConfig, StreamEvent, StreamProvider, ToolDefinition};
use crate::retry::{log_retry, RetryConfig};
use crate::types::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Type alias for convert_to_llm callback.
pub type ConvertToLlmFn = Box<dyn Fn(&[AgentMessage]) -> Vec<Message> + Send + Sync>;
/// Type alias for transform_context callback.
pub type TransformContextFn = Box<dyn Fn(Vec<AgentMessage>) -> Vec<AgentMessage> + Send + Sync>;
/// Type alias for steering/follow-up message callbacks.
pub type GetMessagesFn = Box<dyn Fn() -> Vec<AgentMessage> + Send + Sync>;
/// Called before each turn with the messages so far and the turn index.
/// Return `false` to stop the loop before this turn runs.
pub type BeforeTurnFn = Arc<dyn Fn(&[AgentMessage], usize) -> bool + Send + Sync>;
/// Called after each turn with the messages so far and the turn's usage.
pub type AfterTurnFn = Arc<dyn Fn(&[AgentMessage], &Usage) + Send + Sync>;
/// Called when a provider error escapes retry, with its display string.
pub type OnErrorFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Configuration for the agent loop
pub struct AgentLoopConfig<'a> {
    pub provider: &'a dyn StreamProvider,
    pub model: String,
    pub api_key: String,
    pub thinking_level: ThinkingLevel,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,

    /// Convert AgentMessage[] → Message[] before each LLM call.
    /// Default: keep only LLM-compatible messages.
    pub convert_to_llm: Option<ConvertToLlmFn>,

    /// Transform context before convert_to_llm (for pruning, compaction).
    pub transform_context: Option<TransformContextFn>,

    /// Get steering messages (user interruptions mid-run).
    pub get_steering_messages: Option<GetMessagesFn>,

    /// Get follow-up messages (queued work after agent finishes).
    pub get_follow_up_messages: Option<GetMessagesFn>,

    /// Context window configuration (auto-compaction).
    pub context_config: Option<ContextConfig>,

    /// Execution limits (max turns, tokens, duration).
    pub execution_limits: Option<ExecutionLimits>,

    /// Prompt-caching hints passed to the provider.
    pub cache_config: CacheConfig,

    /// How a turn's tool calls are dispatched (sequential vs. parallel).
    pub tool_execution: ToolExecutionStrategy,

    /// Retry policy applied around each provider stream call.
    pub retry_config: RetryConfig,

    /// Governs `should_continue`'s behavior once `max_turns` is reached:
    /// in production a single "please summarize" turn is granted before
    /// stopping; outside production, `max_turns_prompt` (if any) is asked
    /// whether to raise the limit by 10.
    pub is_production: bool,
    /// Development-mode confirmation callback for raising `max_turns` by 10.
    /// Called with the proposed new limit; `true` continues, `false` stops.
    pub max_turns_prompt: Option<Arc<dyn Fn(usize) -> bool + Send + Sync>>,

    pub before_turn: Option<BeforeTurnFn>,
    pub after_turn: Option<AfterTurnFn>,
    pub on_error: Option<OnErrorFn>,
}

/// Default convert_to_llm: keep only user/assistant/toolResult messages.
fn default_convert_to_llm(messages: &[AgentMessage]) -> Vec<Message> {
    messages
        .iter()
        .filter_map(|m| m.as_llm().cloned())
        .collect()
}

/// Start an agent loop with new prompt messages.
pub async fn agent_loop(
    prompts: Vec<AgentMessage>,
    context: &mut AgentContext,
    config: &AgentLoopConfig<'_>,
    tx: mpsc::UnboundedSender<AgentEvent>,
    cancel: tokio_util::sync::CancellationToken,
) -> Vec<AgentMessage> {
    let mut new_messages: Vec<AgentMessage> = prompts.clone();

    // Add prompts to context
    for prompt in &prompts {
        context.messages.push(prompt.clone());
    }

    tx.send(AgentEvent::AgentStart).ok();
    tx.send(AgentEvent::TurnStart).ok();

    // Emit events for each prompt message
    for prompt in &prompts {
        tx.send(AgentEvent::MessageStart {
            message: prompt.clone(),
        })
        .ok();
        tx.send(AgentEvent::MessageEnd {
            message: prompt.clone(),
        })
        .ok();
    }

    run_loop(context, &mut new_messages, config, &tx, &cancel).await;

    tx.send(AgentEvent::AgentEnd {
        messages: new_messages.clone(),
    })
    .ok();
    new_messages
}

/// Continue an agent loop from existing context (for retries).
pub async fn agent_loop_continue(
    context: &mut AgentContext,
    config: &AgentLoopConfig<'_>,
    tx: mpsc::UnboundedSender<AgentEvent>,
    cancel: tokio_util::sync::CancellationToken,
) -> Vec<AgentMessage> {
    assert!(
        !context.messages.is_empty(),
        "Cannot continue: no messages in context"
    );

    if let Some(last) = context.messages.last() {
        assert!(
            last.role() != "assistant",
            "Cannot continue from assistant message"
        );
    }

    let mut new_messages: Vec<AgentMessage> = Vec::new();

    tx.send(AgentEvent::AgentStart).ok();
    tx.send(AgentEvent::TurnStart).ok();

    run_loop(context, &mut new_messages, config, &tx, &cancel).await;

    tx.send(AgentEvent::AgentEnd {
        messages: new_messages.clone(),
    })
    .ok();
    new_messages
}

/// Main loop logic shared by agent_loop and agent_loop_continue.
///
/// Outer loop: continues when follow-up messages arrive after agent would stop.
/// Inner loop: process tool calls and steering messages.
async fn run_loop(
    context: &mut AgentContext,
    new_messages: &mut Vec<AgentMessage>,
    config: &AgentLoopConfig<'_>,
    tx: &mpsc::UnboundedSender<AgentEvent>,
    cancel: &tokio_util::sync::CancellationToken,
) {
    let mut first_turn = true;
    let mut turn_index = 0usize;
    let mut tracker = config
        .execution_limits
        .as_ref()
        .map(|limits| ExecutionTracker::new(limits.clone()));
    // `should_continue` (SPEC §4.F.7): the turn-limit branch below grants at
    // most one production "please summarize" extension per run.
    let mut turn_limit_extended = false;

    // Check for steering messages at start
    let mut pending: Vec<AgentMessage> = config
        .get_steering_messages
        .as_ref()
        .map(|f| f())
        .unwrap_or_default();

    // Outer loop: follow-ups after agent would stop
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let mut steering_after_tools: Option<Vec<AgentMessage>> = None;

        // Inner loop: runs at least once, then continues if tool calls or pending messages
        loop {
            if cancel.is_cancelled() {
                return;
            }

            if !first_turn {
                tx.send(AgentEvent::TurnStart).ok();
            } else {
                first_turn = false;
            }

            // Inject pending messages
            if !pending.is_empty() {
                for msg in pending.drain(..) {
                    tx.send(AgentEvent::MessageStart {
                        message: msg.clone(),
                    })
                    .ok();
                    tx.send(AgentEvent::MessageEnd {
                        message: msg.clone(),
                    })
                    .ok();
                    context.messages.push(msg.clone());
                    new_messages.push(msg);
                }
            }

            if let Some(before_turn) = &config.before_turn {
                if !before_turn(&context.messages, turn_index) {
                    return;
                }
            }

            // Check execution limits (should_continue, SPEC §4.F.7)
            if let Some(ref mut tracker) = tracker {
                if let Some(reason) = tracker.check_limits() {
                    let is_turn_limit = reason.starts_with("Max turns reached");

                    let granted_extension = if !is_turn_limit {
                        false
                    } else if !config.is_production {
                        // Development: ask to raise the limit by 10.
                        match &config.max_turns_prompt {
                            Some(prompt) => {
                                let proposed = tracker.limits.max_turns + 10;
                                if prompt(proposed) {
                                    tracker.limits.max_turns = proposed;
                                    true
                                } else {
                                    false
                                }
                            }
                            None => false,
                        }
                    } else if !turn_limit_extended {
                        // Production: one more turn after a summarize nudge.
                        turn_limit_extended = true;
                        tracker.limits.max_turns += 1;
                        let summarize_msg = AgentMessage::Llm(Message::User {
                            content: vec![Content::Text {
                                text: "Maximum turn reached. Please summarize the work and get input from user.".into(),
                            }],
                            timestamp: now_ms(),
                        });
                        tx.send(AgentEvent::MessageStart {
                            message: summarize_msg.clone(),
                        })
                        .ok();
                        tx.send(AgentEvent::MessageEnd {
                            message: summarize_msg.clone(),
                        })
                        .ok();
                        context.messages.push(summarize_msg.clone());
                        new_messages.push(summarize_msg);
                        true
                    } else {
                        false
                    };

                    if !granted_extension {
                        warn!("Execution limit reached: {}", reason);
                        let limit_msg = AgentMessage::Llm(Message::User {
                            content: vec![Content::Text {
                                text: format!("[Agent stopped: {}]", reason),
                            }],
                            timestamp: now_ms(),
                        });
                        tx.send(AgentEvent::MessageStart {
                            message: limit_msg.clone(),
                        })
                        .ok();
                        tx.send(AgentEvent::MessageEnd {
                            message: limit_msg.clone(),
                        })
                        .ok();
                        context.messages.push(limit_msg.clone());
                        new_messages.push(limit_msg);
                        return;
                    }
                }
            }

            // Compact context if configured (pair-aware truncate + summarize)
            if let Some(ref ctx_config) = config.context_config {
                context.messages =
                    context::compact_messages(std::mem::take(&mut context.messages), ctx_config, None)
                        .await;
            }

            // Stream assistant response, with retry around transient provider errors
            let message = stream_assistant_response_with_retry(context, config, tx, cancel).await;

            let agent_msg: AgentMessage = message.clone().into();
            context.messages.push(agent_msg.clone());
            new_messages.push(agent_msg.clone());

            if let Some(after_turn) = &config.after_turn {
                if let Message::Assistant { ref usage, .. } = message {
                    after_turn(&context.messages, usage);
                }
            }

            // Check for error/abort
            if let Message::Assistant {
                ref stop_reason, ..
            } = message
            {
                if *stop_reason == StopReason::Error || *stop_reason == StopReason::Aborted {
                    tx.send(AgentEvent::TurnEnd {
                        message: agent_msg,
                        tool_results: vec![],
                    })
                    .ok();
                    return;
                }
            }

            // Extract tool calls
            let tool_calls: Vec<_> = match &message {
                Message::Assistant { content, .. } => content
                    .iter()
                    .filter_map(|c| match c {
                        Content::ToolCall {
                            id,
                            name,
                            arguments,
                        } => Some((id.clone(), name.clone(), arguments.clone())),
                        _ => None,
                    })
                    .collect(),
                _ => vec![],
            };

            let has_tool_calls = !tool_calls.is_empty();
            let mut tool_results: Vec<Message> = Vec::new();
            let mut transferred = false;

            if has_tool_calls {
                let dialect = ProviderDialect::for_model(&config.model);
                let dispatcher =
                    ToolDispatcher::new(&context.tools, config.tool_execution.clone(), dialect);
                match dispatcher.dispatch(&tool_calls, tx, cancel).await {
                    ToolBatchOutcome::Results(shaped) => {
                        for r in shaped {
                            let msg = Message::ToolResult {
                                tool_call_id: r.tool_call_id,
                                tool_name: r.tool_name,
                                content: r.content,
                                is_error: r.is_error,
                                timestamp: now_ms(),
                            };
                            let am: AgentMessage = msg.clone().into();
                            context.messages.push(am.clone());
                            new_messages.push(am);
                            tool_results.push(msg);
                        }

                        // Check for steering — skip rest of turn if the user interrupted
                        if let Some(get_steering_fn) = &config.get_steering_messages {
                            let steering = get_steering_fn();
                            if !steering.is_empty() {
                                steering_after_tools = Some(steering);
                            }
                        }
                    }
                    ToolBatchOutcome::Transfer(transfer) => {
                        transferred = true;
                        let handoff_msg = build_transfer_message(&transfer, &context.messages);
                        context.messages.push(handoff_msg.clone());
                        new_messages.push(handoff_msg);
                        tx.send(AgentEvent::Transfer { transfer }).ok();
                    }
                }
            }

            // Track turn for execution limits
            if let Some(ref mut tracker) = tracker {
                let turn_tokens = match &message {
                    Message::Assistant { usage, .. } => (usage.input + usage.output) as usize,
                    _ => context::message_tokens(&agent_msg),
                };
                tracker.record_turn(turn_tokens);
            }
            turn_index += 1;

            tx.send(AgentEvent::TurnEnd {
                message: agent_msg,
                tool_results,
            })
            .ok();

            if transferred {
                return;
            }

            // Check steering after turn
            if let Some(steering) = steering_after_tools.take() {
                if !steering.is_empty() {
                    pending = steering;
                    continue;
                }
            }

            pending = config
                .get_steering_messages
                .as_ref()
                .map(|f| f())
                .unwrap_or_default();

            // Exit inner loop if no more tool calls and no pending messages
            if !has_tool_calls && pending.is_empty() {
                break;
            }
        }

        // Agent would stop. Check for follow-ups.
        let follow_ups = config
            .get_follow_up_messages
            .as_ref()
            .map(|f| f())
            .unwrap_or_default();

        if !follow_ups.is_empty() {
            pending = follow_ups;
            continue;
        }

        break;
    }
}

/// Build the message that opens the target agent's turn after a transfer,
/// carrying `transfer.message` plus up to `clamped_max_messages()` trailing
/// messages of context.
fn build_transfer_message(transfer: &AgentTransfer, history: &[AgentMessage]) -> AgentMessage {
    let carried = transfer.clamped_max_messages();
    let tail: Vec<&AgentMessage> = history.iter().rev().take(carried).collect();
    let mut text = transfer.message.clone();
    if !tail.is_empty() {
        text.push_str("\n\n[Carried context]\n");
        for msg in tail.into_iter().rev() {
            if let AgentMessage::Llm(m) = msg {
                text.push_str(&format!("[{}] {:?}\n", m.role(), m));
            }
        }
    }
    AgentMessage::Llm(Message::User {
        content: vec![Content::Text { text }],
        timestamp: now_ms(),
    })
}

/// Stream an assistant response, retrying transient provider errors per
/// `config.retry_config` before giving up and returning an error message.
async fn stream_assistant_response_with_retry(
    context: &AgentContext,
    config: &AgentLoopConfig<'_>,
    tx: &mpsc::UnboundedSender<AgentEvent>,
    cancel: &tokio_util::sync::CancellationToken,
) -> Message {
    let mut attempt = 0usize;
    loop {
        match stream_assistant_response(context, config, tx, cancel).await {
            Ok(msg) => return msg,
            Err(err) => {
                attempt += 1;
                let retryable = err.is_retryable() && attempt <= config.retry_config.max_retries;
                if !retryable || cancel.is_cancelled() {
                    if let Some(on_error) = &config.on_error {
                        on_error(&err.to_string());
                    }
                    return Message::Assistant {
                        content: vec![Content::Text {
                            text: String::new(),
                        }],
                        stop_reason: StopReason::Error,
                        model: config.model.clone(),
                        provider: "unknown".into(),
                        usage: Usage::default(),
                        timestamp: now_ms(),
                        error_message: Some(err.to_string()),
                    };
                }
                let delay = err
                    .retry_after()
                    .unwrap_or_else(|| config.retry_config.delay_for_attempt(attempt));
                log_retry(attempt, config.retry_config.max_retries, &delay, &err);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Message::Assistant {
                        content: vec![],
                        stop_reason: StopReason::Aborted,
                        model: config.model.clone(),
                        provider: "unknown".into(),
                        usage: Usage::default(),
                        timestamp: now_ms(),
                        error_message: None,
                    },
                }
            }
        }
    }
}

/// Stream a single assistant response from the LLM.
async fn stream_assistant_response(
    context: &AgentContext,
    config: &AgentLoopConfig<'_>,
    tx: &mpsc::UnboundedSender<AgentEvent>,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<Message, ProviderError> {
    // Apply context transform
    let messages = if let Some(transform) = &config.transform_context {
        transform(context.messages.clone())
    } else {
        context.messages.clone()
    };

    // Convert to LLM messages
    let convert = config.convert_to_llm.as_ref();
    let llm_messages = match convert {
        Some(f) => f(&messages),
        None => default_convert_to_llm(&messages),
    };

    // Build tool definitions
    let tool_defs: Vec<ToolDefinition> = context
        .tools
        .iter()
        .map(|t| ToolDefinition {
            name: t.name().to_string(),
            description: t.description().to_string(),
            parameters: t.parameters_schema(),
        })
        .collect();

    let stream_config = StreamConfig {
        model: config.model.clone(),
        system_prompt: context.system_prompt.clone(),
        messages: llm_messages,
        tools: tool_defs,
        thinking_level: config.thinking_level,
        api_key: config.api_key.clone(),
        max_tokens: config.max_tokens,
        temperature: config.temperature,
    };

    // Stream from provider
    let (stream_tx, mut stream_rx) = mpsc::unbounded_channel();
    let provider_cancel = cancel.clone();

    let provider = config.provider;
    let result = provider
        .stream(stream_config, stream_tx, provider_cancel)
        .await;

    // Process any events that were sent
    let mut partial_message: Option<AgentMessage> = None;
    while let Ok(event) = stream_rx.try_recv() {
        match &event {
            StreamEvent::Start => {
                // Will be set when Done arrives
            }
            StreamEvent::TextDelta { delta, .. } => {
                if let Some(ref msg) = partial_message {
                    tx.send(AgentEvent::MessageUpdate {
                        message: msg.clone(),
                        delta: StreamDelta::Text {
                            delta: delta.clone(),
                        },
                    })
                    .ok();
                }
            }
            StreamEvent::ThinkingDelta { delta, .. } => {
                if let Some(ref msg) = partial_message {
                    tx.send(AgentEvent::MessageUpdate {
                        message: msg.clone(),
                        delta: StreamDelta::Thinking {
                            delta: delta.clone(),
                        },
                    })
                    .ok();
                }
            }
            StreamEvent::ToolCallDelta { delta, .. } => {
                if let Some(ref msg) = partial_message {
                    tx.send(AgentEvent::MessageUpdate {
                        message: msg.clone(),
                        delta: StreamDelta::ToolCallDelta {
                            delta: delta.clone(),
                        },
                    })
                    .ok();
                }
            }
            StreamEvent::Done { message } => {
                let am: AgentMessage = message.clone().into();
                partial_message = Some(am.clone());
                tx.send(AgentEvent::MessageStart {
                    message: am.clone(),
                })
                .ok();
                tx.send(AgentEvent::MessageEnd { message: am }).ok();
            }
            StreamEvent::Error { message } => {
                let am: AgentMessage = message.clone().into();
                partial_message = Some(am.clone());
                tx.send(AgentEvent::MessageStart {
                    message: am.clone(),
                })
                .ok();
                tx.send(AgentEvent::MessageEnd { message: am }).ok();
            }
            _ => {}
        }
    }

    result
}
