//! `agent_transfer` — hands the conversation off to another agent (or back
//! to the primary), recognized by name in `crate::dispatcher::ToolDispatcher`.

use crate::types::*;
use async_trait::async_trait;

/// Offers the LLM a way to end its turn by handing off to a named agent.
/// The dispatcher reads the returned `ToolResult.details` back into an
/// `AgentTransfer` — this tool itself only validates and echoes the request.
pub struct AgentTransferTool;

impl Default for AgentTransferTool {
    fn default() -> Self {
        Self
    }
}

#[async_trait]
impl AgentTool for AgentTransferTool {
    fn name(&self) -> &str {
        "agent_transfer"
    }

    fn label(&self) -> &str {
        "Transfer to Agent"
    }

    fn description(&self) -> &str {
        "Hand off the conversation to another agent, or back to the primary agent. \
         Use this when the current agent has finished its part of the task and \
         another agent (or the primary agent) should take over."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "to_agent_id": {
                    "type": "string",
                    "description": "Target agent id. Omit when transfer_to_primary is true."
                },
                "message": {
                    "type": "string",
                    "description": "Message to open the target agent's turn with"
                },
                "max_messages": {
                    "type": "integer",
                    "description": format!(
                        "Trailing messages of context to carry over (0-{}, default {})",
                        MAX_TRANSFER_MAX_MESSAGES, DEFAULT_TRANSFER_MAX_MESSAGES
                    )
                },
                "transfer_to_primary": {
                    "type": "boolean",
                    "description": "Transfer back to the primary agent instead of a named one"
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        params: serde_json::Value,
        _cancel: tokio_util::sync::CancellationToken,
        _on_update: Option<ToolUpdateFn>,
    ) -> Result<ToolResult, ToolError> {
        let message = params["message"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArgs("missing 'message' parameter".into()))?
            .to_string();
        let to_agent_id = params["to_agent_id"].as_str().map(|s| s.to_string());
        let transfer_to_primary = params["transfer_to_primary"].as_bool().unwrap_or(false);
        let max_messages = params["max_messages"]
            .as_u64()
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_TRANSFER_MAX_MESSAGES);

        if to_agent_id.is_none() && !transfer_to_primary {
            return Err(ToolError::InvalidArgs(
                "one of 'to_agent_id' or 'transfer_to_primary' is required".into(),
            ));
        }

        let transfer = AgentTransfer {
            to_agent_id,
            message: message.clone(),
            max_messages,
            transfer_to_primary,
        };

        Ok(ToolResult {
            content: vec![Content::Text {
                text: format!("Transferring: {}", message),
            }],
            details: serde_json::to_value(&transfer)
                .map_err(|e| ToolError::Failed(format!("cannot encode transfer: {}", e)))?,
        })
    }
}
