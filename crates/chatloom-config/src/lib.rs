pub mod loader;
pub mod model;
pub mod seed;

pub use loader::{ConfigLoader, load_seed};
pub use model::{
    AppConfig, DatabaseConfig, GatewayConfig, LogConfig, McpConfig, RateLimitConfig,
    RuntimeConfig, StorageConfig,
};
pub use seed::{
    AgentSeed, ApiKeySeed, CatalogSeed, ChatModelSeed, McpServerSeed, ProviderSeed, ToolRefSeed,
};
