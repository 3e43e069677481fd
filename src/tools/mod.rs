pub mod bash;
pub mod edit;
pub mod file;
pub mod list;
pub mod search;
pub mod transfer;

pub use bash::BashTool;
pub use edit::EditFileTool;
pub use file::{ReadFileTool, WriteFileTool};
pub use list::ListFilesTool;
pub use search::SearchTool;
pub use transfer::AgentTransferTool;

use crate::types::AgentTool;

/// Get the standard set of coding agent tools.
pub fn default_tools() -> Vec<Box<dyn AgentTool>> {
    vec![
        Box::new(BashTool::default()),
        Box::new(ReadFileTool::default()),
        Box::new(WriteFileTool::new()),
        Box::new(EditFileTool::new()),
        Box::new(ListFilesTool::default()),
        Box::new(SearchTool::default()),
    ]
}

/// The standard tool set plus `agent_transfer`, for agents registered with
/// an `AgentManager` that can hand off work to siblings.
pub fn default_tools_with_transfer() -> Vec<Box<dyn AgentTool>> {
    let mut tools = default_tools();
    tools.push(Box::new(AgentTransferTool::default()));
    tools
}
