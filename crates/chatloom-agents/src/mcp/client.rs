use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chatloom_common::{Error, Result};
use chatloom_db::McpServerConfig;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rmcp::ServiceExt;
use rmcp::model::{CallToolRequestParam, CallToolResult, JsonObject, Tool as RmcpTool};
use rmcp::service::{RoleClient, RunningService};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{StreamableHttpClientTransport, TokioChildProcess};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::sse::SseSession;

/// Tool definition as reported by a live MCP server.
#[derive(Debug, Clone, PartialEq)]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

impl From<RmcpTool> for McpToolInfo {
    fn from(tool: RmcpTool) -> Self {
        Self {
            name: tool.name.to_string(),
            description: tool.description.as_deref().unwrap_or("").trim().to_string(),
            input_schema: serde_json::to_value(&*tool.input_schema).unwrap_or_default(),
        }
    }
}

/// Transport named on an MCP server configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpTransport {
    StreamableHttp,
    Sse,
    Stdio,
}

impl McpTransport {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "http" | "streamable-http" | "streamable_http" => Ok(McpTransport::StreamableHttp),
            "sse" => Ok(McpTransport::Sse),
            "stdio" => Ok(McpTransport::Stdio),
            other => Err(Error::Config(format!("unsupported MCP transport '{other}'"))),
        }
    }
}

enum Connection {
    Rmcp(RunningService<RoleClient, ()>),
    Sse(Mutex<SseSession>),
}

/// One live, handshaken connection to an MCP server.
pub struct McpSession {
    server_name: String,
    connection: Connection,
    broken: AtomicBool,
}

impl McpSession {
    /// Connect with the configured transport and complete the handshake.
    pub async fn connect(server: &McpServerConfig, timeout: Duration) -> Result<Self> {
        let name = server.name.as_str();
        let connection = match McpTransport::parse(&server.transport)? {
            McpTransport::Stdio => {
                let command = server.command.as_deref().ok_or_else(|| {
                    Error::Config(format!("MCP server '{name}' has no command"))
                })?;
                let mut cmd = Command::new(command);
                cmd.args(&server.args);
                for (k, v) in &server.env {
                    cmd.env(k, v);
                }
                let transport = TokioChildProcess::new(cmd).map_err(|e| {
                    Error::Mcp(format!("failed to spawn MCP server '{name}': {e}"))
                })?;
                Connection::Rmcp(handshake(name, timeout, ().serve(transport)).await?)
            }
            McpTransport::StreamableHttp => {
                let url = required_url(server)?;
                let client = reqwest::Client::builder()
                    .default_headers(build_headers(&server.headers)?)
                    .build()
                    .map_err(|e| Error::Mcp(format!("failed to build HTTP client: {e}")))?;
                let transport = StreamableHttpClientTransport::with_client(
                    client,
                    StreamableHttpClientTransportConfig::with_uri(url.to_string()),
                );
                Connection::Rmcp(handshake(name, timeout, ().serve(transport)).await?)
            }
            McpTransport::Sse => {
                let url = required_url(server)?;
                let mut session =
                    SseSession::connect(url, build_headers(&server.headers)?, timeout).await?;
                session.initialize().await.map_err(|e| {
                    Error::Mcp(format!("MCP server '{name}' handshake failed: {e}"))
                })?;
                Connection::Sse(Mutex::new(session))
            }
        };

        info!(server = %name, transport = %server.transport, "MCP server connected");
        Ok(Self {
            server_name: name.to_string(),
            connection,
            broken: AtomicBool::new(false),
        })
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Live tool list.
    pub async fn list_tools(&self) -> Result<Vec<McpToolInfo>> {
        let name = &self.server_name;
        let tools = match &self.connection {
            Connection::Rmcp(service) => service.list_all_tools().await.map_err(|e| {
                self.mark_broken();
                Error::Mcp(format!("failed to list tools from '{name}': {e}"))
            })?,
            Connection::Sse(session) => {
                let result = session.lock().await.list_tools().await;
                result
                    .inspect_err(|_| self.mark_broken())?
                    .tools
            }
        };
        Ok(tools
            .into_iter()
            .map(McpToolInfo::from)
            .filter(|t| !t.name.is_empty())
            .collect())
    }

    pub async fn call_tool(&self, tool: &str, arguments: Option<JsonObject>) -> Result<CallToolResult> {
        let name = &self.server_name;
        match &self.connection {
            Connection::Rmcp(service) => service
                .call_tool(CallToolRequestParam {
                    name: Cow::Owned(tool.to_string()),
                    arguments,
                })
                .await
                .map_err(|e| {
                    self.mark_broken();
                    Error::Mcp(format!("tool '{tool}' on '{name}' failed: {e}"))
                }),
            Connection::Sse(session) => {
                let result = session.lock().await.call_tool(tool, arguments).await;
                result.inspect_err(|_| self.mark_broken())
            }
        }
    }

    /// A session that saw a transport failure, or whose SSE reader stopped,
    /// is not reused.
    pub fn is_usable(&self) -> bool {
        if self.broken.load(Ordering::Relaxed) {
            return false;
        }
        match &self.connection {
            Connection::Rmcp(_) => true,
            Connection::Sse(session) => session.try_lock().map(|s| !s.is_closed()).unwrap_or(true),
        }
    }

    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::Relaxed);
    }

    /// Shut the connection down. Stdio servers get their child process reaped.
    pub async fn close(self) {
        match self.connection {
            Connection::Rmcp(service) => {
                if let Err(e) = service.cancel().await {
                    warn!("error cancelling MCP server '{}': {e}", self.server_name);
                }
            }
            Connection::Sse(session) => drop(session),
        }
    }
}

async fn handshake<F, E>(name: &str, timeout: Duration, serve: F) -> Result<RunningService<RoleClient, ()>>
where
    F: std::future::Future<Output = std::result::Result<RunningService<RoleClient, ()>, E>>,
    E: std::fmt::Display,
{
    tokio::time::timeout(timeout, serve)
        .await
        .map_err(|_| {
            Error::Mcp(format!(
                "MCP server '{name}' handshake timed out after {}s",
                timeout.as_secs()
            ))
        })?
        .map_err(|e| Error::Mcp(format!("MCP server '{name}' handshake failed: {e}")))
}

fn required_url(server: &McpServerConfig) -> Result<&str> {
    server
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| Error::Config(format!("MCP server '{}' has no url", server.name)))
}

pub(crate) fn build_headers(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| Error::Config(format!("invalid MCP header name '{key}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Config(format!("invalid value for MCP header '{key}': {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Serialize a tool result for the model. Error results become `Err` so the
/// caller can report them as failed calls.
pub fn render_tool_result(result: CallToolResult) -> Result<String> {
    let content: Vec<serde_json::Value> = result
        .content
        .into_iter()
        .map(|block| serde_json::to_value(block).unwrap_or(serde_json::Value::Null))
        .collect();
    let rendered = serde_json::to_string(&content)?;
    if result.is_error.unwrap_or(false) {
        return Err(Error::Tool(rendered));
    }
    Ok(rendered)
}
