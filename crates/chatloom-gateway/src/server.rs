use std::net::SocketAddr;
use std::sync::Arc;

use chatloom_agents::{ProviderRegistry, validate_stored_providers};
use chatloom_common::{Error, Result};
use chatloom_config::AppConfig;
use chatloom_db::SqliteStore;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::router::build_router;
use crate::state::AppState;

/// The HTTP gateway: binds the listener and serves the API until Ctrl-C.
pub struct GatewayServer {
    state: AppState,
}

impl GatewayServer {
    pub fn new(config: AppConfig, store: Arc<SqliteStore>, providers: ProviderRegistry) -> Self {
        Self {
            state: AppState::new(config, store, providers),
        }
    }

    pub async fn run(self) -> Result<()> {
        let state = self.state.shared();

        // Fail fast on provider rows no factory can serve.
        let checked = validate_stored_providers(state.directory.as_ref(), state.runtime.providers())
            .await?;
        info!("validated {checked} stored LLM provider(s)");

        let reaper = state.mcp.spawn_idle_reaper();

        let gateway = &state.config.gateway;
        let addr = format!("{}:{}", gateway.host, gateway.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind {addr}: {e}")))?;
        info!("chatloom gateway listening on {addr}");

        let app = build_router(Arc::clone(&state));
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;

        reaper.abort();
        state.mcp.shutdown().await;
        info!("gateway stopped");
        served.map_err(Error::Io)
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    }
}
