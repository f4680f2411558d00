use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chatloom_common::Result;
use chatloom_db::AttachmentStore;

use crate::providers::ToolDefinition;

pub mod current_time;
pub mod read_attachment;

pub use current_time::CurrentTime;
pub use read_attachment::ReadAttachment;

/// Name prefix that marks a tool as in-process.
pub const INTERNAL_TOOL_PREFIX: &str = "__internal__";

/// Identity of the turn a tool call belongs to.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub conversation_id: String,
    pub request_id: String,
    pub agent_id: String,
    pub application_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// An in-process tool the model can call.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON schema of the arguments object.
    fn input_schema(&self) -> serde_json::Value;

    async fn execute(&self, context: &ToolContext, args: serde_json::Value) -> Result<ToolOutput>;
}

/// Internal tools by bare name.
#[derive(Clone, Default)]
pub struct InternalToolRegistry {
    tools: BTreeMap<&'static str, Arc<dyn Tool>>,
}

impl InternalToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in tools.
    pub fn with_builtins(attachments: Arc<dyn AttachmentStore>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CurrentTime));
        registry.register(Arc::new(ReadAttachment::new(attachments)));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    /// Schema of a tool as exposed to the model, with the internal prefix.
    pub fn definition(&self, name: &str) -> Option<ToolDefinition> {
        self.tools.get(name).map(|tool| ToolDefinition {
            name: format!("{INTERNAL_TOOL_PREFIX}{}", tool.name()),
            description: tool.description().to_string(),
            parameters: tool.input_schema(),
        })
    }
}

/// Bare internal tool name of a prefixed call name.
pub fn internal_tool_name(call_name: &str) -> Option<&str> {
    call_name.strip_prefix(INTERNAL_TOOL_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_carries_internal_prefix() {
        let mut registry = InternalToolRegistry::new();
        registry.register(Arc::new(CurrentTime));
        let def = registry.definition("current_time").unwrap();
        assert_eq!(def.name, "__internal__current_time");
        assert_eq!(internal_tool_name(&def.name), Some("current_time"));
        assert!(registry.definition("missing").is_none());
    }
}
