//! Tool Dispatcher — runs a turn's tool calls (sequentially or concurrently),
//! shapes the results for the target provider dialect, and detects an
//! `agent_transfer` handoff.

use crate::types::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("tool call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Which provider's tool-result wire shape to produce.
///
/// Claude expects `tool_result` content blocks keyed by `tool_use_id`;
/// everything else in this crate uses the generic `Message::ToolResult`
/// role-based shape and this distinction is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderDialect {
    Claude,
    Generic,
}

impl ProviderDialect {
    pub fn for_model(model: &str) -> Self {
        if model.to_ascii_lowercase().contains("claude") {
            Self::Claude
        } else {
            Self::Generic
        }
    }
}

/// A tool result after dialect-specific shaping, ready to become a
/// `Message::ToolResult`.
#[derive(Debug, Clone)]
pub struct ShapedToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: Vec<Content>,
    pub is_error: bool,
}

/// Outcome of dispatching one turn's tool calls.
pub enum ToolBatchOutcome {
    /// Every call ran to completion (or errored); here are the results.
    Results(Vec<ShapedToolResult>),
    /// One of the calls was `agent_transfer` — the batch stops early and the
    /// loop must hand off instead of continuing with more tool calls.
    Transfer(AgentTransfer),
}

/// Strip characters providers reject in tool names when echoing them back
/// (Claude rejects `.` in `tool_use_id`-adjacent fields). Generic dialects
/// pass the name through unchanged.
fn shape_tool_name(name: &str, dialect: ProviderDialect) -> String {
    match dialect {
        ProviderDialect::Claude => name.replace('.', "_"),
        ProviderDialect::Generic => name.to_string(),
    }
}

/// Dispatches a turn's tool calls per a `ToolExecutionStrategy`, reporting
/// progress on `tx` and honoring `cancel`.
pub struct ToolDispatcher<'a> {
    pub tools: &'a [Box<dyn AgentTool>],
    pub strategy: ToolExecutionStrategy,
    pub dialect: ProviderDialect,
}

impl<'a> ToolDispatcher<'a> {
    pub fn new(tools: &'a [Box<dyn AgentTool>], strategy: ToolExecutionStrategy, dialect: ProviderDialect) -> Self {
        Self {
            tools,
            strategy,
            dialect,
        }
    }

    /// Run every call in `tool_calls`. Stops early (without running the
    /// remaining calls) the moment an `agent_transfer` result is seen, or
    /// when `should_stop` (checked between calls, used for steering
    /// short-circuit in the `Sequential` strategy) returns messages.
    pub async fn dispatch(
        &self,
        tool_calls: &[(String, String, serde_json::Value)],
        tx: &mpsc::UnboundedSender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> ToolBatchOutcome {
        match self.strategy.clone() {
            ToolExecutionStrategy::Sequential => self.dispatch_sequential(tool_calls, tx, cancel).await,
            ToolExecutionStrategy::Parallel {
                max_concurrent,
                timeout,
            } => {
                self.dispatch_parallel(tool_calls, tx, cancel, max_concurrent, timeout)
                    .await
            }
        }
    }

    /// Runs one tool call and returns its shaped result plus, when the call
    /// was `agent_transfer` and succeeded, the decoded handoff payload.
    async fn run_one(
        &self,
        id: &str,
        name: &str,
        args: &serde_json::Value,
        tx: &mpsc::UnboundedSender<AgentEvent>,
        cancel: CancellationToken,
    ) -> (ShapedToolResult, Option<AgentTransfer>) {
        tx.send(AgentEvent::ToolExecutionStart {
            tool_call_id: id.to_string(),
            tool_name: name.to_string(),
            args: args.clone(),
        })
        .ok();

        let tool = self.tools.iter().find(|t| t.name() == name);
        let tx_update = tx.clone();
        let update_id = id.to_string();
        let update_name = name.to_string();
        let on_update: ToolUpdateFn = Arc::new(move |partial: ToolResult| {
            tx_update
                .send(AgentEvent::ToolExecutionUpdate {
                    tool_call_id: update_id.clone(),
                    tool_name: update_name.clone(),
                    partial_result: partial,
                })
                .ok();
        });

        let (result, is_error) = match tool {
            Some(tool) => match tool.execute(id, args.clone(), cancel, Some(on_update)).await {
                Ok(r) => (r, false),
                Err(e) => (ToolResult::text(e.to_string()), true),
            },
            None => (ToolResult::text(format!("Tool {} not found", name)), true),
        };

        tx.send(AgentEvent::ToolExecutionEnd {
            tool_call_id: id.to_string(),
            tool_name: name.to_string(),
            result: result.clone(),
            is_error,
        })
        .ok();

        let transfer = if name == "agent_transfer" && !is_error {
            result.as_agent_transfer()
        } else {
            None
        };

        (
            ShapedToolResult {
                tool_call_id: id.to_string(),
                tool_name: shape_tool_name(name, self.dialect),
                content: result.content,
                is_error,
            },
            transfer,
        )
    }

    async fn dispatch_sequential(
        &self,
        tool_calls: &[(String, String, serde_json::Value)],
        tx: &mpsc::UnboundedSender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> ToolBatchOutcome {
        let mut results = Vec::with_capacity(tool_calls.len());
        for (id, name, args) in tool_calls {
            let (shaped, transfer) = self.run_one(id, name, args, tx, cancel.child_token()).await;
            if let Some(transfer) = transfer {
                return ToolBatchOutcome::Transfer(transfer);
            }
            results.push(shaped);
        }
        ToolBatchOutcome::Results(results)
    }

    async fn dispatch_parallel(
        &self,
        tool_calls: &[(String, String, serde_json::Value)],
        tx: &mpsc::UnboundedSender<AgentEvent>,
        cancel: &CancellationToken,
        max_concurrent: usize,
        timeout: std::time::Duration,
    ) -> ToolBatchOutcome {
        use futures::stream::{self, StreamExt};

        let transfer_slot: Arc<tokio::sync::Mutex<Option<AgentTransfer>>> =
            Arc::new(tokio::sync::Mutex::new(None));

        let results: Vec<ShapedToolResult> = stream::iter(tool_calls.iter())
            .map(|(id, name, args)| {
                let cancel = cancel.child_token();
                let transfer_slot = transfer_slot.clone();
                async move {
                    let run = self.run_one(id, name, args, tx, cancel);
                    let (shaped, transfer) = match tokio::time::timeout(timeout, run).await {
                        Ok(pair) => pair,
                        Err(_) => (
                            ShapedToolResult {
                                tool_call_id: id.clone(),
                                tool_name: shape_tool_name(name, self.dialect),
                                content: vec![Content::Text {
                                    text: format!("Tool '{}' timed out after {:?}", name, timeout),
                                }],
                                is_error: true,
                            },
                            None,
                        ),
                    };
                    if let Some(transfer) = transfer {
                        *transfer_slot.lock().await = Some(transfer);
                    }
                    shaped
                }
            })
            .buffer_unordered(max_concurrent.max(1))
            .collect()
            .await;

        if let Some(transfer) = transfer_slot.lock().await.take() {
            return ToolBatchOutcome::Transfer(transfer);
        }

        // Preserve call order regardless of completion order.
        let order: HashMap<&str, usize> = tool_calls
            .iter()
            .enumerate()
            .map(|(i, (id, _, _))| (id.as_str(), i))
            .collect();
        let mut results = results;
        results.sort_by_key(|r| order.get(r.tool_call_id.as_str()).copied().unwrap_or(usize::MAX));
        ToolBatchOutcome::Results(results)
    }
}
