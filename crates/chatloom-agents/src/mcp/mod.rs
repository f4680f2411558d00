mod client;
mod pool;
mod sse;
#[cfg(test)]
pub(crate) mod test_server;

pub use client::{McpSession, McpToolInfo, McpTransport, render_tool_result};
pub use pool::McpPool;

/// Separator between an MCP server's config id and a tool name in the names
/// exposed to the model.
pub const COMPOSITE_TOOL_DELIMITER: &str = "_____";

/// `{config_id}_____{tool}`
pub fn composite_tool_name(config_id: &str, tool: &str) -> String {
    format!("{config_id}{COMPOSITE_TOOL_DELIMITER}{tool}")
}

/// Split a composite name back into `(config_id, tool)`.
pub fn split_composite_tool_name(name: &str) -> Option<(&str, &str)> {
    name.split_once(COMPOSITE_TOOL_DELIMITER)
        .filter(|(config_id, tool)| !config_id.is_empty() && !tool.is_empty())
}
