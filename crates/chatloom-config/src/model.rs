use std::path::PathBuf;

use chatloom_common::{Error, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Top-level configuration, every section optional in the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub runtime: RuntimeConfig,
    pub mcp: McpConfig,
    pub log: LogConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.gateway.port == 0 {
            return Err(Error::Config("gateway.port must be non-zero".into()));
        }
        if self.runtime.max_tool_rounds == 0 {
            return Err(Error::Config(
                "runtime.max_tool_rounds must be at least 1".into(),
            ));
        }
        if self.runtime.event_buffer == 0 {
            return Err(Error::Config("runtime.event_buffer must be at least 1".into()));
        }
        if self.gateway.rate_limit.enabled
            && (self.gateway.rate_limit.per_second == 0 || self.gateway.rate_limit.burst_size == 0)
        {
            return Err(Error::Config(
                "gateway.rate_limit values must be non-zero when enabled".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: usize,
    pub rate_limit: RateLimitConfig,
    /// Allowed CORS origins. Empty disables the CORS layer.
    pub cors_origins: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3888,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            rate_limit: RateLimitConfig::default(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub per_second: u64,
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_second: 10,
            burst_size: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("chatloom.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub attachment_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            attachment_dir: data_dir().join("chat_attachment_files"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound on LLM calls that end in tool calls within one turn.
    pub max_tool_rounds: usize,
    /// Messages replayed as history when the agent sets no context limit.
    pub history_window: usize,
    /// Capacity of the per-request event channel.
    pub event_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 10,
            history_window: 100,
            event_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub connect_timeout_secs: u64,
    pub call_timeout_secs: u64,
    pub idle_ttl_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            call_timeout_secs: 60,
            idle_ttl_secs: 300,
            reap_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// `~/.chatloom`, falling back to the working directory when no home exists.
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".chatloom"))
        .unwrap_or_else(|| PathBuf::from(".chatloom"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gateway.max_upload_bytes, 50 * 1024 * 1024);
        assert_eq!(config.runtime.max_tool_rounds, 10);
        assert_eq!(config.runtime.history_window, 100);
    }

    #[test]
    fn zero_tool_rounds_rejected() {
        let mut config = AppConfig::default();
        config.runtime.max_tool_rounds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [gateway]
            port = 9000

            [runtime]
            max_tool_rounds = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.runtime.max_tool_rounds, 3);
        assert_eq!(config.runtime.event_buffer, 64);
        assert_eq!(config.mcp.idle_ttl_secs, 300);
    }
}
