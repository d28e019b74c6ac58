//! Configuration management for trustforge.
//!
//! A single TOML file carries the global settings (trust domain), the node
//! attestor plugin section and the datastore section. Plugin sections are
//! kept as raw TOML tables and handed to the plugin as text, so each plugin
//! owns the decoding and validation of its own options.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::error::{CoreError, Result};

/// Default SQLite file used when no datastore section is configured.
pub const DEFAULT_CONNECTION_STRING: &str = "datastore.sqlite3";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub trust_domain: String,
    #[serde(default)]
    pub node_attestor: Option<PluginSection>,
    #[serde(default)]
    pub datastore: DataStoreConfig,
}

/// Settings shared with every plugin, supplied by the hosting process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub trust_domain: String,
}

/// Opaque plugin configuration block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSection {
    pub plugin_name: String,
    #[serde(default)]
    pub plugin_data: toml::Table,
}

impl PluginSection {
    /// Render the plugin data back to TOML text for the plugin's `configure` call.
    pub fn plugin_data_text(&self) -> Result<String> {
        toml::to_string(&self.plugin_data).map_err(|e| CoreError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStoreConfig {
    /// One of `sqlite3`, `postgres`, `mysql`.
    pub database_type: String,
    pub connection_string: String,
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        Self {
            database_type: "sqlite3".to_string(),
            connection_string: DEFAULT_CONNECTION_STRING.to_string(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        debug!(
            path = %path.display(),
            trust_domain = %config.trust_domain,
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.trust_domain.is_empty() {
            return Err(CoreError::Config(
                "global configuration missing trust domain".to_string(),
            ));
        }
        if let Some(section) = &self.node_attestor {
            if section.plugin_name.is_empty() {
                return Err(CoreError::Config(
                    "node_attestor section missing plugin_name".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn global(&self) -> GlobalConfig {
        GlobalConfig {
            trust_domain: self.trust_domain.clone(),
        }
    }
}
