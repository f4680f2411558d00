use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chatloom_common::{Error, Result};
use chatloom_db::{AgentDirectory, LlmProviderConfig};
use tracing::info;

use super::{LlmProvider, OllamaProvider, OpenAiProvider};

/// Provider type tags stored on `llm_providers.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAiChatCompletions,
    Ollama,
    VolcanoEngine,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAiChatCompletions => "openai_chat_completions_api",
            ProviderKind::Ollama => "ollama",
            ProviderKind::VolcanoEngine => "volcano_engine",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "openai_chat_completions_api" | "openai" => Ok(ProviderKind::OpenAiChatCompletions),
            "ollama" => Ok(ProviderKind::Ollama),
            "volcano_engine" => Ok(ProviderKind::VolcanoEngine),
            other => Err(Error::Config(format!("unknown LLM provider type '{other}'"))),
        }
    }
}

/// Connection settings handed to a provider factory.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl From<&LlmProviderConfig> for ProviderSettings {
    fn from(config: &LlmProviderConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
        }
    }
}

type ProviderFactory = Arc<dyn Fn(&ProviderSettings) -> Result<Arc<dyn LlmProvider>> + Send + Sync>;

/// Maps provider type tags to client constructors.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: HashMap<ProviderKind, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in OpenAI-compatible and Ollama clients.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ProviderKind::OpenAiChatCompletions, |settings| {
            Ok(Arc::new(OpenAiProvider::new(
                settings.api_key.clone(),
                settings.base_url.clone(),
            )) as Arc<dyn LlmProvider>)
        });
        registry.register(ProviderKind::Ollama, |settings| {
            Ok(Arc::new(OllamaProvider::new(settings.base_url.clone())) as Arc<dyn LlmProvider>)
        });
        registry
    }

    pub fn register<F>(&mut self, kind: ProviderKind, factory: F)
    where
        F: Fn(&ProviderSettings) -> Result<Arc<dyn LlmProvider>> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Arc::new(factory));
    }

    /// Check that a stored tag names a provider type with a client.
    pub fn validate(&self, tag: &str) -> Result<ProviderKind> {
        let kind: ProviderKind = tag.parse()?;
        if self.factories.contains_key(&kind) {
            Ok(kind)
        } else {
            Err(Error::NotImplemented(format!(
                "LLM provider type '{kind}' has no client"
            )))
        }
    }

    pub fn build(&self, tag: &str, settings: &ProviderSettings) -> Result<Arc<dyn LlmProvider>> {
        let kind = self.validate(tag)?;
        match self.factories.get(&kind) {
            Some(factory) => factory(settings),
            None => Err(Error::NotImplemented(format!(
                "LLM provider type '{kind}' has no client"
            ))),
        }
    }
}

/// Check every stored provider against the registry. Fails on the first
/// provider whose type has no client.
pub async fn validate_stored_providers(
    directory: &dyn AgentDirectory,
    registry: &ProviderRegistry,
) -> Result<usize> {
    let providers = directory.llm_providers().await?;
    for provider in &providers {
        let kind = registry.validate(&provider.kind).map_err(|e| match e {
            Error::NotImplemented(msg) => {
                Error::NotImplemented(format!("provider '{}': {msg}", provider.name))
            }
            other => Error::Config(format!("provider '{}': {other}", provider.name)),
        })?;
        info!(provider = %provider.name, %kind, "provider validated");
    }
    Ok(providers.len())
}
