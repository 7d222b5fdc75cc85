//! Command implementations

pub mod count;
pub mod migrate;
pub mod status;
pub mod versions;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use schemastack_core::{Config, DirectoryBundle, ModelRegistry, StackOptions};

/// The model and directories a command works on
pub struct Target {
    pub model_name: String,
    pub config: Config,
}

impl Target {
    /// Combine command-line flags with the loaded configuration; flags win
    pub fn resolve(
        mut config: Config,
        model: Option<String>,
        bundle: Option<PathBuf>,
        data_dir: Option<PathBuf>,
    ) -> Result<Self> {
        if bundle.is_some() {
            config.bundle_dir = bundle;
        }
        if let Some(dir) = data_dir {
            config.data_dir = dir;
        }

        let model_name = model
            .or_else(|| config.model_name.clone())
            .ok_or_else(|| {
                anyhow!("No model selected. Pass --model or set model_name in the config file.")
            })?;

        Ok(Self { model_name, config })
    }

    pub fn bundle_dir(&self) -> PathBuf {
        self.config
            .bundle_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn registry(&self) -> ModelRegistry {
        ModelRegistry::new(Arc::new(DirectoryBundle::new(self.bundle_dir())))
    }

    pub fn options(&self) -> StackOptions {
        StackOptions::from_config(&self.config, self.model_name.clone())
    }

    pub fn store_path(&self) -> PathBuf {
        self.config.store_path(&self.model_name)
    }
}
