//! Configuration for the storefront agents
//!
//! Defaults reproduce the shipped setup. Values can be overridden from the
//! environment or from a TOML file; the OpenAI credentials themselves are read
//! by `async-openai` (`OPENAI_API_KEY`).

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorefrontError};

/// Model every agent is bound to unless configured otherwise.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// City used to bias the stylist's web search.
pub const DEFAULT_SEARCH_CITY: &str = "Tokyo";

/// Address the WebSocket server binds by default.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";

/// Settings applied when the agent graph is built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorefrontConfig {
    /// Model identifier passed to the provider for every agent
    pub model: String,

    /// Approximate location for the stylist's web search
    pub search_city: String,

    /// Sampling temperature; provider default when unset
    pub temperature: Option<f32>,

    /// Completion token cap per model call; provider default when unset
    pub max_tokens: Option<u32>,

    /// Socket address of the WebSocket server
    pub listen_addr: String,
}

impl Default for StorefrontConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            search_city: DEFAULT_SEARCH_CITY.to_string(),
            temperature: None,
            max_tokens: None,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
        }
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: StorefrontConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: StorefrontConfig::default(),
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn search_city(mut self, city: impl Into<String>) -> Self {
        self.config.search_city = city.into();
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.config.temperature = Some(temp);
        self
    }

    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.config.max_tokens = Some(tokens);
        self
    }

    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn build(self) -> StorefrontConfig {
        self.config
    }
}

/// Load configuration from environment variables.
///
/// Unset variables keep their defaults; set but unparsable numbers are an error.
pub fn from_env() -> Result<StorefrontConfig> {
    from_lookup(|key| std::env::var(key).ok())
}

fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<StorefrontConfig> {
    let mut config = StorefrontConfig::default();

    if let Some(model) = lookup("STOREFRONT_MODEL") {
        config.model = model;
    }

    if let Some(city) = lookup("STOREFRONT_SEARCH_CITY") {
        config.search_city = city;
    }

    if let Some(temp) = lookup("STOREFRONT_TEMPERATURE") {
        let parsed = temp.parse::<f32>().map_err(|e| StorefrontError::Config {
            message: format!("STOREFRONT_TEMPERATURE={temp}: {e}"),
        })?;
        config.temperature = Some(parsed);
    }

    if let Some(tokens) = lookup("STOREFRONT_MAX_TOKENS") {
        let parsed = tokens.parse::<u32>().map_err(|e| StorefrontError::Config {
            message: format!("STOREFRONT_MAX_TOKENS={tokens}: {e}"),
        })?;
        config.max_tokens = Some(parsed);
    }

    if let Some(addr) = lookup("STOREFRONT_LISTEN_ADDR") {
        config.listen_addr = addr;
    }

    Ok(config)
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<StorefrontConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: StorefrontConfig = toml::from_str(&contents)?;
    Ok(config)
}
