//! Stack configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/schemastack/config.toml)
//! 3. Environment variables (SCHEMASTACK_* prefix)
//!
//! Environment variables take precedence over config file values. The
//! library never loads configuration on its own; hosts pass a [`Config`]
//! to [`StackOptions`](crate::stack::StackOptions).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::storage::StoreFiles;

/// Environment variable prefix
const ENV_PREFIX: &str = "SCHEMASTACK";

/// Stack configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding store files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory containing `<Model>.models` resource folders
    #[serde(default)]
    pub bundle_dir: Option<PathBuf>,

    /// Model opened when none is named explicitly
    #[serde(default)]
    pub model_name: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bundle_dir: None,
            model_name: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (SCHEMASTACK_DATA_DIR, SCHEMASTACK_BUNDLE_DIR, SCHEMASTACK_MODEL)
    /// 2. Config file (~/.config/schemastack/config.toml or SCHEMASTACK_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // Empty string clears it
        if let Ok(val) = std::env::var(format!("{}_BUNDLE_DIR", ENV_PREFIX)) {
            self.bundle_dir = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }

        if let Ok(val) = std::env::var(format!("{}_MODEL", ENV_PREFIX)) {
            self.model_name = if val.is_empty() { None } else { Some(val) };
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with SCHEMASTACK_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("schemastack")
            .join("config.toml")
    }

    /// Path of the store file for a model
    pub fn store_path(&self, model_name: &str) -> PathBuf {
        StoreFiles::for_model(&self.data_dir, model_name)
            .path()
            .to_path_buf()
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("schemastack")
}
