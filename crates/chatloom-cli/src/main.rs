mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chatloom_agents::{ProviderRegistry, validate_stored_providers};
use chatloom_config::{AppConfig, ConfigLoader, load_seed};
use chatloom_db::{SqliteStore, apply_seed};
use chatloom_gateway::GatewayServer;
use chatloom_security::generate_api_key;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "chatloom")]
#[command(about = "Conversation orchestration backend for tool-using LLM agents", version)]
struct Cli {
    /// Path to config.toml (default: ~/.chatloom/config.toml)
    #[arg(short, long, global = true, env = "CHATLOOM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP gateway
    Serve,
    /// Create or upgrade the database schema
    Migrate,
    /// Load providers, models, MCP servers, agents and keys from a TOML catalog
    Seed {
        /// Catalog file
        path: PathBuf,
    },
    /// Validate config and every stored LLM provider
    Check,
    /// Issue a new API key for an agent
    ApiKey {
        /// Agent name
        agent: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loader = match &cli.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config = loader
        .load()
        .with_context(|| format!("failed to load config from {}", loader.path().display()))?;
    logging::init_tracing(&config.log)?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Migrate => {
            open_store(&config)?;
            println!("database ready at {}", config.database.path.display());
            Ok(())
        }
        Commands::Seed { path } => seed(&config, &path),
        Commands::Check => check(&config).await,
        Commands::ApiKey { agent } => issue_api_key(&config, &agent),
    }
}

fn open_store(config: &AppConfig) -> Result<SqliteStore> {
    SqliteStore::open(&config.database.path).with_context(|| {
        format!(
            "failed to open database at {}",
            config.database.path.display()
        )
    })
}

async fn serve(config: AppConfig) -> Result<()> {
    let store = Arc::new(open_store(&config)?);
    info!(
        "starting chatloom {} on {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.gateway.host,
        config.gateway.port
    );
    GatewayServer::new(config, store, ProviderRegistry::with_defaults())
        .run()
        .await?;
    Ok(())
}

fn seed(config: &AppConfig, path: &std::path::Path) -> Result<()> {
    let catalog = load_seed(path)?;
    let store = open_store(config)?;
    let report = apply_seed(&store, &catalog)?;
    println!(
        "seeded {} provider(s), {} model(s), {} MCP server(s) with {} tool(s), {} agent(s), {} API key(s)",
        report.providers,
        report.models,
        report.mcp_servers,
        report.mcp_tools,
        report.agents,
        report.api_keys
    );
    Ok(())
}

async fn check(config: &AppConfig) -> Result<()> {
    let store = open_store(config)?;
    let count = validate_stored_providers(&store, &ProviderRegistry::with_defaults()).await?;
    println!("config OK, {count} LLM provider(s) valid");
    Ok(())
}

fn issue_api_key(config: &AppConfig, agent_name: &str) -> Result<()> {
    let store = open_store(config)?;
    let Some(agent) = store.agent_by_name(agent_name)? else {
        bail!("unknown agent '{agent_name}'");
    };
    let key = generate_api_key()?;
    store.insert_api_key(&agent.id, &key)?;
    info!(agent = %agent.name, "issued API key");
    // Only the hash is stored; this is the one chance to copy the key.
    println!("{key}");
    Ok(())
}
