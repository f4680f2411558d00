use std::sync::Arc;

use chatloom_agents::{
    AttachmentStorage, ConversationRuntime, ConversationService, InternalToolRegistry, McpPool,
    ProviderRegistry, RuntimeSettings, ToolCatalog, ToolInvoker,
};
use chatloom_config::AppConfig;
use chatloom_db::{AgentDirectory, SqliteStore};

/// Shared gateway state passed to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub directory: Arc<dyn AgentDirectory>,
    pub runtime: ConversationRuntime,
    pub conversations: ConversationService,
    pub mcp: Arc<McpPool>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire the orchestration stack over one SQLite store.
    pub fn new(config: AppConfig, store: Arc<SqliteStore>, providers: ProviderRegistry) -> Self {
        let mcp = Arc::new(McpPool::new(config.mcp.clone()));
        let internal = InternalToolRegistry::with_builtins(store.clone());
        let catalog = ToolCatalog::new(store.clone(), internal.clone(), Arc::clone(&mcp));
        let invoker = ToolInvoker::new(store.clone(), internal, Arc::clone(&mcp));

        let runtime = ConversationRuntime::new(
            store.clone(),
            store.clone(),
            store.clone(),
            providers,
            Arc::new(catalog),
            Arc::new(invoker),
            RuntimeSettings::from(&config.runtime),
        );
        let conversations = ConversationService::new(
            store.clone(),
            store.clone(),
            AttachmentStorage::new(
                config.storage.attachment_dir.clone(),
                config.gateway.max_upload_bytes,
            ),
            runtime.locks().clone(),
        );

        Self {
            config,
            directory: store,
            runtime,
            conversations,
            mcp,
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(self)
    }
}
