use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Declarative catalog used to populate providers, models, MCP servers and
/// agents. Entries reference each other by `name`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSeed {
    pub providers: Vec<ProviderSeed>,
    pub models: Vec<ChatModelSeed>,
    pub mcp_servers: Vec<McpServerSeed>,
    pub agents: Vec<AgentSeed>,
    pub api_keys: Vec<ApiKeySeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSeed {
    pub name: String,
    /// Provider type tag, e.g. `openai_chat_completions_api`.
    pub kind: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatModelSeed {
    pub name: String,
    pub provider: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerSeed {
    pub name: String,
    /// `streamable-http`, `sse` or `stdio`.
    pub transport: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Tool names known for this server at seeding time.
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSeed {
    pub name: String,
    #[serde(default = "default_application")]
    pub application_id: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    /// History limit in messages; absent means the runtime default.
    #[serde(default)]
    pub context_length_limit: Option<u32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default = "default_true")]
    pub default_streamable: bool,
    #[serde(default)]
    pub mcp_tools: Vec<ToolRefSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRefSeed {
    pub server: String,
    pub tool: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeySeed {
    pub agent: String,
    pub key: String,
}

fn default_application() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}
