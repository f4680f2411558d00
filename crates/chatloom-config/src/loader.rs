use std::path::{Path, PathBuf};

use chatloom_common::{Error, Result};
use tracing::{debug, info};

use crate::model::{AppConfig, data_dir};
use crate::seed::CatalogSeed;

/// Loads `AppConfig` from a TOML file, `.env`, and `CHATLOOM_*` variables,
/// in increasing order of precedence.
pub struct ConfigLoader {
    path: PathBuf,
    explicit: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            path: data_dir().join("config.toml"),
            explicit: false,
        }
    }

    /// Use a caller-provided path. A missing file is then an error.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            explicit: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<AppConfig> {
        if let Ok(env_file) = dotenvy::dotenv() {
            debug!("loaded environment from {}", env_file.display());
        }
        self.load_with_env(|key| std::env::var(key).ok())
    }

    /// Same as [`ConfigLoader::load`] with an injectable environment lookup.
    pub fn load_with_env(&self, env: impl Fn(&str) -> Option<String>) -> Result<AppConfig> {
        let mut config = if self.path.is_file() {
            info!("loading config from {}", self.path.display());
            let raw = std::fs::read_to_string(&self.path).map_err(|e| {
                Error::Config(format!("failed to read {}: {e}", self.path.display()))
            })?;
            toml::from_str::<AppConfig>(&raw).map_err(|e| {
                Error::Config(format!("invalid config {}: {e}", self.path.display()))
            })?
        } else if self.explicit {
            return Err(Error::Config(format!(
                "config file not found: {}",
                self.path.display()
            )));
        } else {
            debug!("no config at {}, using defaults", self.path.display());
            AppConfig::default()
        };

        apply_env_overrides(&mut config, &env)?;
        config.validate()?;
        Ok(config)
    }
}

fn apply_env_overrides(
    config: &mut AppConfig,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(host) = env("CHATLOOM_HOST") {
        config.gateway.host = host;
    }
    if let Some(port) = env("CHATLOOM_PORT") {
        config.gateway.port = parse_env("CHATLOOM_PORT", &port)?;
    }
    if let Some(path) = env("CHATLOOM_DB_PATH") {
        config.database.path = PathBuf::from(path);
    }
    if let Some(dir) = env("CHATLOOM_ATTACHMENT_DIR") {
        config.storage.attachment_dir = PathBuf::from(dir);
    }
    if let Some(level) = env("CHATLOOM_LOG_LEVEL") {
        config.log.level = level;
    }
    if let Some(json) = env("CHATLOOM_LOG_JSON") {
        config.log.json = parse_env("CHATLOOM_LOG_JSON", &json)?;
    }
    if let Some(rounds) = env("CHATLOOM_MAX_TOOL_ROUNDS") {
        config.runtime.max_tool_rounds = parse_env("CHATLOOM_MAX_TOOL_ROUNDS", &rounds)?;
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key} has invalid value '{raw}'")))
}

/// Read a catalog seed file (providers, models, MCP servers, agents, keys).
pub fn load_seed(path: &Path) -> Result<CatalogSeed> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read seed {}: {e}", path.display())))?;
    toml::from_str(&raw)
        .map_err(|e| Error::Config(format!("invalid seed {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_default_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader {
            path: dir.path().join("absent.toml"),
            explicit: false,
        };
        let config = loader.load_with_env(env_from(&[])).unwrap();
        assert_eq!(config.gateway.port, 3888);
    }

    #[test]
    fn missing_explicit_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::with_path(dir.path().join("absent.toml"));
        assert!(loader.load_with_env(env_from(&[])).is_err());
    }

    #[test]
    fn env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[gateway]\nport = 4000\nhost = \"0.0.0.0\"").unwrap();

        let loader = ConfigLoader::with_path(&path);
        let config = loader
            .load_with_env(env_from(&[
                ("CHATLOOM_PORT", "5000"),
                ("CHATLOOM_MAX_TOOL_ROUNDS", "4"),
            ]))
            .unwrap();
        assert_eq!(config.gateway.port, 5000);
        assert_eq!(config.gateway.host, "0.0.0.0");
        assert_eq!(config.runtime.max_tool_rounds, 4);
    }

    #[test]
    fn bad_env_value_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader {
            path: dir.path().join("absent.toml"),
            explicit: false,
        };
        let err = loader
            .load_with_env(env_from(&[("CHATLOOM_PORT", "eighty")]))
            .unwrap_err();
        assert!(err.to_string().contains("CHATLOOM_PORT"));
    }
}
