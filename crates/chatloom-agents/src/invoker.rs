use std::sync::Arc;

use chatloom_common::{Error, Result};
use chatloom_db::AgentDirectory;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::mcp::{McpPool, split_composite_tool_name};
use crate::providers::ToolCall;
use crate::tools::{InternalToolRegistry, Tool, ToolContext, internal_tool_name};

/// Routes a model tool call to the internal tool or MCP server it names.
pub struct ToolInvoker {
    directory: Arc<dyn AgentDirectory>,
    internal: InternalToolRegistry,
    mcp: Arc<McpPool>,
}

impl ToolInvoker {
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

    /// Execute one call and return its result string. Every failure, from
    /// bad arguments to a remote error result, comes back as `Err`.
    #[instrument(skip(self, context, call), fields(tool = %call.name, call_id = %call.id))]
    pub async fn invoke(&self, context: &ToolContext, call: &ToolCall) -> Result<String> {
        let args = parse_arguments(&call.arguments)?;

        if let Some(name) = internal_tool_name(&call.name) {
            let tool = self
                .internal
                .get(name)
                .ok_or_else(|| Error::Tool(format!("unknown internal tool: {name}")))?;
            return run_internal(tool, context.clone(), args).await;
        }

        let (config_id, tool) = split_composite_tool_name(&call.name)
            .ok_or_else(|| Error::Tool(format!("invalid tool name format: {}", call.name)))?;
        let server = self
            .directory
            .mcp_server_by_config_id(config_id)
            .await?
            .ok_or_else(|| Error::Tool(format!("no MCP server with config id '{config_id}'")))?;

        let enabled = self.directory.enabled_mcp_tools(&context.agent_id).await?;
        if !enabled
            .iter()
            .any(|t| t.server_id == server.id && t.name == tool)
        {
            return Err(Error::Tool(format!(
                "MCP tool '{tool}' is not enabled for this agent on server '{}'",
                server.name
            )));
        }

        let arguments = match args {
            Value::Object(map) => Some(map),
            Value::Null => None,
            _ => {
                return Err(Error::Tool(
                    "MCP tool arguments must be a JSON object".to_string(),
                ));
            }
        };

        info!(server = %server.name, tool = %tool, "calling MCP tool");
        self.mcp.call_tool(&server, tool, arguments).await
    }
}

/// Run an internal tool on its own task so a panic fails only this call.
async fn run_internal(tool: Arc<dyn Tool>, context: ToolContext, args: Value) -> Result<String> {
    let name = tool.name();
    let output = tokio::spawn(async move { tool.execute(&context, args).await })
        .await
        .map_err(|e| {
            if e.is_panic() {
                warn!(tool = %name, "internal tool panicked");
                Error::Tool(format!("internal tool '{name}' panicked"))
            } else {
                Error::Tool(format!("internal tool '{name}' was cancelled"))
            }
        })??;
    if output.is_error {
        return Err(Error::Tool(output.content));
    }
    Ok(output.content)
}

/// Blank argument strings mean "no arguments".
fn parse_arguments(raw: &str) -> Result<Value> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw).map_err(|e| Error::Tool(format!("invalid tool arguments: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolOutput;
    use async_trait::async_trait;
    use chatloom_config::McpConfig;
    use chatloom_db::{AgentProfile, McpServerConfig, SqliteStore};
    use std::collections::HashMap;

    struct Exploding;

    #[async_trait]
    impl Tool for Exploding {
        fn name(&self) -> &'static str {
            "exploding"
        }
        fn description(&self) -> &'static str {
            "always panics"
        }
        fn input_schema(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _context: &ToolContext, _args: Value) -> Result<ToolOutput> {
            panic!("tool blew up");
        }
    }

    fn invoker_with(store: Arc<SqliteStore>) -> ToolInvoker {
        let mut internal = InternalToolRegistry::new();
        internal.register(Arc::new(crate::tools::CurrentTime));
        internal.register(Arc::new(Exploding));
        ToolInvoker::new(store, internal, Arc::new(McpPool::new(McpConfig::default())))
    }

    fn invoker() -> ToolInvoker {
        invoker_with(Arc::new(SqliteStore::in_memory().unwrap()))
    }

    fn ctx() -> ToolContext {
        ToolContext {
            conversation_id: "c".into(),
            request_id: "r".into(),
            agent_id: "a".into(),
            application_id: "default".into(),
        }
    }

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: "tc1".into(),
            kind: "function".into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    #[tokio::test]
    async fn internal_tool_runs_with_empty_arguments() {
        let out = invoker()
            .invoke(&ctx(), &call("__internal__current_time", ""))
            .await
            .unwrap();
        assert!(out.contains("UTC"));
    }

    #[tokio::test]
    async fn invalid_json_arguments_fail_the_call() {
        let err = invoker()
            .invoke(&ctx(), &call("__internal__current_time", "{\"timezone\":"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid tool arguments"));
    }

    #[tokio::test]
    async fn unknown_config_id_fails_the_call() {
        let err = invoker()
            .invoke(&ctx(), &call("zzz_____read", "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tool(_)));

        let err = invoker()
            .invoke(&ctx(), &call("no_delimiter", "{}"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid tool name format"));
    }

    #[tokio::test]
    async fn panicking_internal_tool_becomes_a_tool_error() {
        let err = invoker()
            .invoke(&ctx(), &call("__internal__exploding", "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tool(ref m) if m.contains("panicked")));

        // the invoker is still usable afterwards
        let out = invoker()
            .invoke(&ctx(), &call("__internal__current_time", ""))
            .await
            .unwrap();
        assert!(out.contains("UTC"));
    }

    #[tokio::test]
    async fn mcp_tool_not_enabled_for_the_agent_is_refused() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let server = store
            .upsert_mcp_server(McpServerConfig {
                id: String::new(),
                config_id: String::new(),
                name: "files".into(),
                transport: "streamable-http".into(),
                url: Some("http://127.0.0.1:1/mcp".into()),
                headers: HashMap::new(),
                command: None,
                args: vec![],
                env: HashMap::new(),
                timeout_secs: Some(1),
            })
            .unwrap();
        // known to the server, but never enabled for agent "a"
        store.upsert_mcp_tool(&server.id, "read").unwrap();

        let name = crate::mcp::composite_tool_name(&server.config_id, "read");
        let err = invoker_with(store)
            .invoke(&ctx(), &call(&name, "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tool(ref m) if m.contains("not enabled")));
    }

    #[tokio::test]
    async fn enabled_mcp_tool_is_called_on_its_server() {
        let addr = crate::mcp::test_server::spawn(&["echo"]).await;
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let server = store
            .upsert_mcp_server(McpServerConfig {
                id: String::new(),
                config_id: String::new(),
                name: "echoer".into(),
                transport: "sse".into(),
                url: Some(format!("http://{addr}/sse")),
                headers: HashMap::new(),
                command: None,
                args: vec![],
                env: HashMap::new(),
                timeout_secs: Some(5),
            })
            .unwrap();
        let tool_id = store.upsert_mcp_tool(&server.id, "echo").unwrap();
        let profile = store
            .upsert_agent(AgentProfile {
                id: String::new(),
                name: "helper".into(),
                application_id: "default".into(),
                system_prompt: String::new(),
                chat_model_id: None,
                temperature: None,
                top_p: None,
                context_length_limit: None,
                max_output_tokens: None,
                default_streamable: true,
            })
            .unwrap();
        store.set_agent_tool(&profile.id, &tool_id, true).unwrap();
        let context = ToolContext {
            agent_id: profile.id,
            ..ctx()
        };

        let name = crate::mcp::composite_tool_name(&server.config_id, "echo");
        let out = invoker_with(store)
            .invoke(&context, &call(&name, "{\"text\":\"hello\"}"))
            .await
            .unwrap();
        assert!(out.contains("hello"));
    }
}

