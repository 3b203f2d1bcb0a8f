//! Runtime configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::peers::ComponentCategory;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub opus: OpusConfig,
    #[serde(default)]
    pub categories: CategoriesConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the websocket server binds to
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpusConfig {
    /// Opus YAML source
    #[serde(default = "default_opus_path")]
    pub path: PathBuf,

    /// Preload asset data and push missing or stale files to peers
    #[serde(default = "default_true")]
    pub sync_assets: bool,

    /// Refuse to start when validation finds problems
    #[serde(default = "default_true")]
    pub exit_on_validation_failure: bool,
}

impl Default for OpusConfig {
    fn default() -> Self {
        Self {
            path: default_opus_path(),
            sync_assets: true,
            exit_on_validation_failure: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoriesConfig {
    /// Categories to start
    #[serde(default = "default_categories")]
    pub enabled: Vec<ComponentCategory>,
}

impl Default for CategoriesConfig {
    fn default() -> Self {
        Self {
            enabled: default_categories(),
        }
    }
}

// Defaults
fn default_listen() -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 8001)) }
fn default_opus_path() -> PathBuf { PathBuf::from("opus.yaml") }
fn default_true() -> bool { true }
fn default_categories() -> Vec<ComponentCategory> { ComponentCategory::ALL.to_vec() }

impl Config {
    /// Read a TOML config; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn is_enabled(&self, category: ComponentCategory) -> bool {
        self.categories.enabled.contains(&category)
    }
}
