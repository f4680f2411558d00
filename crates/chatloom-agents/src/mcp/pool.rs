use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chatloom_common::{Error, Result};
use chatloom_config::McpConfig;
use chatloom_db::McpServerConfig;
use rmcp::model::JsonObject;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::client::{McpSession, McpToolInfo, render_tool_result};

struct PooledSession {
    session: Arc<McpSession>,
    last_used: Instant,
}

/// Live MCP sessions keyed by server id, reused until idle for longer than
/// the configured TTL or broken by a transport failure.
pub struct McpPool {
    sessions: Arc<RwLock<HashMap<String, PooledSession>>>,
    settings: McpConfig,
}

impl McpPool {
    pub fn new(settings: McpConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            settings,
        }
    }

    fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.settings.idle_ttl_secs)
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.connect_timeout_secs.max(1))
    }

    fn call_timeout(&self, server: &McpServerConfig) -> Duration {
        Duration::from_secs(server.timeout_secs.unwrap_or(self.settings.call_timeout_secs).max(1))
    }

    /// Reuse a live session or open a new one.
    async fn session(&self, server: &McpServerConfig) -> Result<Arc<McpSession>> {
        let ttl = self.idle_ttl();
        let stale = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(&server.id) {
                Some(pooled) if pooled.session.is_usable() && pooled.last_used.elapsed() < ttl => {
                    pooled.last_used = Instant::now();
                    return Ok(Arc::clone(&pooled.session));
                }
                Some(_) => sessions.remove(&server.id),
                None => None,
            }
        };
        if let Some(stale) = stale {
            debug!(server = %server.name, "replacing stale MCP session");
            close_session(stale.session).await;
        }

        let session = Arc::new(McpSession::connect(server, self.connect_timeout()).await?);
        let replaced = self.sessions.write().await.insert(
            server.id.clone(),
            PooledSession {
                session: Arc::clone(&session),
                last_used: Instant::now(),
            },
        );
        if let Some(replaced) = replaced {
            close_session(replaced.session).await;
        }
        Ok(session)
    }

    async fn evict(&self, server_id: &str) {
        let removed = self.sessions.write().await.remove(server_id);
        if let Some(pooled) = removed {
            close_session(pooled.session).await;
        }
    }

    /// Live tool list of one server.
    #[instrument(skip(self, server), fields(server = %server.name))]
    pub async fn list_tools(&self, server: &McpServerConfig) -> Result<Vec<McpToolInfo>> {
        let session = self.session(server).await?;
        let result = tokio::time::timeout(self.call_timeout(server), session.list_tools())
            .await
            .map_err(|_| Error::Mcp(format!("listing tools on '{}' timed out", server.name)))
            .and_then(|r| r);
        if result.is_err() {
            self.evict(&server.id).await;
        }
        result
    }

    /// Invoke a tool and render its result as a string.
    #[instrument(skip(self, server, arguments), fields(server = %server.name))]
    pub async fn call_tool(
        &self,
        server: &McpServerConfig,
        tool: &str,
        arguments: Option<JsonObject>,
    ) -> Result<String> {
        let session = self.session(server).await?;
        let result = tokio::time::timeout(self.call_timeout(server), session.call_tool(tool, arguments))
            .await
            .map_err(|_| {
                session.mark_broken();
                Error::Mcp(format!("tool '{tool}' on '{}' timed out", server.name))
            })
            .and_then(|r| r);
        if !session.is_usable() {
            self.evict(&server.id).await;
        }
        render_tool_result(result?)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Close sessions idle for longer than the TTL or no longer usable.
    pub async fn reap_idle(&self) -> usize {
        let ttl = self.idle_ttl();
        let expired: Vec<PooledSession> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, p)| p.last_used.elapsed() >= ttl || !p.session.is_usable())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        let count = expired.len();
        for pooled in expired {
            info!(server = %pooled.session.server_name(), "closing idle MCP session");
            close_session(pooled.session).await;
        }
        count
    }

    /// Spawn the background idle reaper.
    pub fn spawn_idle_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let period = Duration::from_secs(self.settings.reap_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                pool.reap_idle().await;
            }
        })
    }

    /// Close every pooled session.
    pub async fn shutdown(&self) {
        let sessions: HashMap<String, PooledSession> =
            std::mem::take(&mut *self.sessions.write().await);
        for (_, pooled) in sessions {
            info!(server = %pooled.session.server_name(), "disconnecting MCP server");
            close_session(pooled.session).await;
        }
    }
}

/// Close a session once no in-flight call still holds it. Otherwise the last
/// holder drops it, which also tears the transport down.
async fn close_session(session: Arc<McpSession>) {
    match Arc::try_unwrap(session) {
        Ok(session) => session.close().await,
        Err(shared) => {
            warn!(server = %shared.server_name(), "MCP session still in use; closing on last release");
        }
    }
}
