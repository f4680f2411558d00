use std::collections::HashMap;

use chatloom_common::{Error, Result};
use chatloom_config::CatalogSeed;
use tracing::info;

use crate::models::{AgentProfile, McpServerConfig};
use crate::sqlite::SqliteStore;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedReport {
    pub providers: usize,
    pub models: usize,
    pub mcp_servers: usize,
    pub mcp_tools: usize,
    pub agents: usize,
    pub api_keys: usize,
}

/// Upsert every catalog entry. Safe to run repeatedly.
pub fn apply_seed(store: &SqliteStore, seed: &CatalogSeed) -> Result<SeedReport> {
    let mut report = SeedReport::default();

    let mut providers = HashMap::new();
    for provider in &seed.providers {
        let id = store.upsert_provider(
            &provider.name,
            &provider.kind,
            provider.api_key.as_deref(),
            provider.base_url.as_deref(),
        )?;
        providers.insert(provider.name.as_str(), id);
        report.providers += 1;
    }

    let mut models = HashMap::new();
    for model in &seed.models {
        let provider_id = match providers.get(model.provider.as_str()) {
            Some(id) => id.clone(),
            None => store
                .provider_by_name(&model.provider)?
                .map(|p| p.id)
                .ok_or_else(|| {
                    Error::Config(format!(
                        "model '{}' references unknown provider '{}'",
                        model.name, model.provider
                    ))
                })?,
        };
        let id = store.upsert_chat_model(&model.name, &provider_id)?;
        models.insert(model.name.as_str(), id);
        report.models += 1;
    }

    // server name -> (server id, tool name -> tool id)
    let mut tools: HashMap<&str, (String, HashMap<&str, String>)> = HashMap::new();
    for server in &seed.mcp_servers {
        let stored = store.upsert_mcp_server(McpServerConfig {
            id: String::new(),
            config_id: String::new(),
            name: server.name.clone(),
            transport: server.transport.clone(),
            url: server.url.clone(),
            headers: server.headers.clone(),
            command: server.command.clone(),
            args: server.args.clone(),
            env: server.env.clone(),
            timeout_secs: server.timeout_secs,
        })?;
        let mut tool_ids = HashMap::new();
        for tool in &server.tools {
            tool_ids.insert(tool.as_str(), store.upsert_mcp_tool(&stored.id, tool)?);
            report.mcp_tools += 1;
        }
        info!(
            server = %server.name,
            config_id = %stored.config_id,
            "seeded MCP server"
        );
        tools.insert(server.name.as_str(), (stored.id, tool_ids));
        report.mcp_servers += 1;
    }

    let mut agents = HashMap::new();
    for agent in &seed.agents {
        let chat_model_id = match &agent.model {
            Some(name) => Some(match models.get(name.as_str()) {
                Some(id) => id.clone(),
                None => store.chat_model_by_name(name)?.map(|m| m.id).ok_or_else(|| {
                    Error::Config(format!(
                        "agent '{}' references unknown model '{name}'",
                        agent.name
                    ))
                })?,
            }),
            None => None,
        };
        let profile = store.upsert_agent(AgentProfile {
            id: String::new(),
            name: agent.name.clone(),
            application_id: agent.application_id.clone(),
            system_prompt: agent.system_prompt.clone(),
            chat_model_id,
            temperature: agent.temperature,
            top_p: agent.top_p,
            context_length_limit: agent.context_length_limit,
            max_output_tokens: agent.max_output_tokens,
            default_streamable: agent.default_streamable,
        })?;

        for tool_ref in &agent.mcp_tools {
            let tool_id = match tools
                .get(tool_ref.server.as_str())
                .and_then(|(_, ids)| ids.get(tool_ref.tool.as_str()))
            {
                Some(id) => id.clone(),
                None => {
                    let server = store.mcp_server_by_name(&tool_ref.server)?.ok_or_else(|| {
                        Error::Config(format!(
                            "agent '{}' references unknown MCP server '{}'",
                            agent.name, tool_ref.server
                        ))
                    })?;
                    store.upsert_mcp_tool(&server.id, &tool_ref.tool)?
                }
            };
            store.set_agent_tool(&profile.id, &tool_id, true)?;
        }

        agents.insert(agent.name.as_str(), profile.id);
        report.agents += 1;
    }

    for key in &seed.api_keys {
        let agent_id = match agents.get(key.agent.as_str()) {
            Some(id) => id.clone(),
            None => store.agent_by_name(&key.agent)?.map(|a| a.id).ok_or_else(|| {
                Error::Config(format!("api key references unknown agent '{}'", key.agent))
            })?,
        };
        store.insert_api_key(&agent_id, &key.key)?;
        report.api_keys += 1;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AgentDirectory;

    const SEED: &str = r#"
        [[providers]]
        name = "local"
        kind = "openai_chat_completions_api"
        base_url = "http://localhost:8080/v1"

        [[models]]
        name = "qwen"
        provider = "local"

        [[mcp_servers]]
        name = "files"
        transport = "stdio"
        command = "files-mcp"
        tools = ["read", "write"]

        [[agents]]
        name = "helper"
        model = "qwen"
        mcp_tools = [{ server = "files", tool = "read" }]

        [[api_keys]]
        agent = "helper"
        key = "clk-helper-key"
    "#;

    #[tokio::test]
    async fn seed_populates_catalog_idempotently() {
        let store = SqliteStore::in_memory().unwrap();
        let seed: CatalogSeed = toml::from_str(SEED).unwrap();

        let first = apply_seed(&store, &seed).unwrap();
        assert_eq!(first.mcp_tools, 2);
        let second = apply_seed(&store, &seed).unwrap();
        assert_eq!(first, second);

        let agent = store.authenticate("clk-helper-key").await.unwrap().unwrap();
        assert_eq!(agent.name, "helper");
        let tools = store.enabled_mcp_tools(&agent.id).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "read");
    }

    #[test]
    fn unknown_model_reference_fails() {
        let store = SqliteStore::in_memory().unwrap();
        let seed: CatalogSeed = toml::from_str(
            r#"
            [[agents]]
            name = "lost"
            model = "missing"
            "#,
        )
        .unwrap();
        assert!(matches!(apply_seed(&store, &seed), Err(Error::Config(_))));
    }
}
