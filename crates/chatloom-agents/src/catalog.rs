use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chatloom_db::{AgentDirectory, McpServerTool};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::context::RequestContext;
use crate::mcp::{McpPool, composite_tool_name};
use crate::providers::ToolDefinition;
use crate::tools::{InternalToolRegistry, internal_tool_name};

/// Caller reference to one MCP tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpToolRef {
    pub config_id: String,
    pub tool_name: String,
}

/// Tools a caller asks for in one turn.
#[derive(Debug, Clone, Default)]
pub struct ToolSelection {
    /// Internal tool names, with or without the internal prefix.
    pub internal_tools: Vec<String>,
    /// Narrows the agent's enabled MCP tools. Empty keeps all of them.
    pub mcp_tools: Vec<McpToolRef>,
}

/// Resolves the tool schemas offered to the model for one turn.
pub struct ToolCatalog {
    directory: Arc<dyn AgentDirectory>,
    internal: InternalToolRegistry,
    mcp: Arc<McpPool>,
}

impl ToolCatalog {
    pub fn new(
        directory: Arc<dyn AgentDirectory>,
        internal: InternalToolRegistry,
        mcp: Arc<McpPool>,
    ) -> Self {
        Self {
            directory,
            internal,
            mcp,
        }
    }

    pub fn internal(&self) -> &InternalToolRegistry {
        &self.internal
    }

    /// Every tool enabled for this turn. Never fails: unreachable servers and
    /// unknown names are logged and left out.
    #[instrument(skip(self, ctx, selection), fields(agent_id = %ctx.agent_id()))]
    pub async fn resolve_enabled_tools(
        &self,
        ctx: &RequestContext,
        selection: &ToolSelection,
    ) -> Vec<ToolDefinition> {
        let mut tools = self.internal_definitions(&selection.internal_tools);
        tools.extend(self.mcp_definitions(ctx, &selection.mcp_tools).await);
        debug!(count = tools.len(), "resolved tools");
        tools
    }

    fn internal_definitions(&self, requested: &[String]) -> Vec<ToolDefinition> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for raw in requested {
            let name = raw.trim();
            let name = internal_tool_name(name).unwrap_or(name);
            if !seen.insert(name.to_string()) {
                continue;
            }
            match self.internal.definition(name) {
                Some(def) => out.push(def),
                None => warn!(tool = %name, "unknown internal tool requested"),
            }
        }
        out
    }

    async fn mcp_definitions(
        &self,
        ctx: &RequestContext,
        requested: &[McpToolRef],
    ) -> Vec<ToolDefinition> {
        let enabled = match self.directory.enabled_mcp_tools(ctx.agent_id()).await {
            Ok(tools) => tools,
            Err(e) => {
                warn!("failed to load enabled MCP tools: {e}");
                return Vec::new();
            }
        };

        // server id -> enabled tool names
        let mut by_server: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for McpServerTool { server_id, name, .. } in enabled {
            by_server.entry(server_id).or_default().insert(name);
        }

        let lookups = by_server
            .into_iter()
            .map(|(server_id, names)| self.server_definitions(server_id, names, requested));
        join_all(lookups).await.into_iter().flatten().collect()
    }

    async fn server_definitions(
        &self,
        server_id: String,
        mut names: BTreeSet<String>,
        requested: &[McpToolRef],
    ) -> Vec<ToolDefinition> {
        let server = match self.directory.mcp_server(&server_id).await {
            Ok(Some(server)) => server,
            Ok(None) => {
                warn!(server_id = %server_id, "enabled MCP tool references a missing server");
                return Vec::new();
            }
            Err(e) => {
                warn!(server_id = %server_id, "failed to load MCP server config: {e}");
                return Vec::new();
            }
        };

        if !requested.is_empty() {
            names.retain(|name| {
                requested
                    .iter()
                    .any(|r| r.config_id == server.config_id && &r.tool_name == name)
            });
        }
        if names.is_empty() {
            return Vec::new();
        }

        let live = match self.mcp.list_tools(&server).await {
            Ok(tools) => tools,
            Err(e) => {
                warn!(server = %server.name, "MCP server unavailable, omitting its tools: {e}");
                return Vec::new();
            }
        };

        live.into_iter()
            .filter(|tool| names.contains(&tool.name))
            .map(|tool| ToolDefinition {
                name: composite_tool_name(&server.config_id, &tool.name),
                description: tool.description,
                parameters: tool.input_schema,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatloom_config::McpConfig;
    use chatloom_db::{AgentProfile, McpServerConfig, SqliteStore};
    use std::collections::HashMap;

    fn agent(id: &str) -> AgentProfile {
        AgentProfile {
            id: id.into(),
            name: "helper".into(),
            application_id: "default".into(),
            system_prompt: String::new(),
            chat_model_id: None,
            temperature: None,
            top_p: None,
            context_length_limit: None,
            max_output_tokens: None,
            default_streamable: true,
        }
    }

    #[tokio::test]
    async fn unreachable_server_degrades_to_internal_tools_only() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let server = store
            .upsert_mcp_server(McpServerConfig {
                id: String::new(),
                config_id: String::new(),
                name: "offline".into(),
                transport: "streamable-http".into(),
                url: Some("http://127.0.0.1:1/mcp".into()),
                headers: HashMap::new(),
                command: None,
                args: vec![],
                env: HashMap::new(),
                timeout_secs: Some(1),
            })
            .unwrap();
        let tool_id = store.upsert_mcp_tool(&server.id, "read").unwrap();
        let profile = store.upsert_agent(agent("")).unwrap();
        store.set_agent_tool(&profile.id, &tool_id, true).unwrap();

        let mut internal = InternalToolRegistry::new();
        internal.register(Arc::new(crate::tools::CurrentTime));
        let catalog = ToolCatalog::new(
            store.clone(),
            internal,
            Arc::new(McpPool::new(McpConfig {
                connect_timeout_secs: 2,
                ..McpConfig::default()
            })),
        );

        let selection = ToolSelection {
            internal_tools: vec!["current_time".into(), "__internal__current_time".into(), "nope".into()],
            mcp_tools: vec![],
        };
        let tools = catalog
            .resolve_enabled_tools(&RequestContext::new(profile), &selection)
            .await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "__internal__current_time");
    }

    #[tokio::test]
    async fn live_server_offers_only_enabled_tools_under_composite_names() {
        let addr = crate::mcp::test_server::spawn(&["read", "write"]).await;
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let server = store
            .upsert_mcp_server(McpServerConfig {
                id: String::new(),
                config_id: String::new(),
                name: "files".into(),
                transport: "sse".into(),
                url: Some(format!("http://{addr}/sse")),
                headers: HashMap::new(),
                command: None,
                args: vec![],
                env: HashMap::new(),
                timeout_secs: Some(5),
            })
            .unwrap();
        let read_id = store.upsert_mcp_tool(&server.id, "read").unwrap();
        store.upsert_mcp_tool(&server.id, "write").unwrap();
        let profile = store.upsert_agent(agent("")).unwrap();
        store.set_agent_tool(&profile.id, &read_id, true).unwrap();
        let ctx = RequestContext::new(profile);

        let catalog = ToolCatalog::new(
            store.clone(),
            InternalToolRegistry::new(),
            Arc::new(McpPool::new(McpConfig::default())),
        );

        let tools = catalog
            .resolve_enabled_tools(&ctx, &ToolSelection::default())
            .await;
        assert_eq!(tools.len(), 1);
        assert_eq!(
            tools[0].name,
            crate::mcp::composite_tool_name(&server.config_id, "read")
        );
        assert_eq!(tools[0].description, "read things");
        assert_eq!(tools[0].parameters["properties"]["text"]["type"], "string");

        // a caller selection narrows, it never widens
        let selection = ToolSelection {
            internal_tools: vec![],
            mcp_tools: vec![McpToolRef {
                config_id: server.config_id.clone(),
                tool_name: "write".into(),
            }],
        };
        assert!(catalog.resolve_enabled_tools(&ctx, &selection).await.is_empty());
    }
}
