use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::embedding::EmbedError;
use crate::embedding::local::FastembedLoader;
use crate::model::ModelSource;
use crate::options::ModelOptions;
use crate::registry::{DEFAULT_REGISTRY_NAME, ModelRef, ModelRegistry};

#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Clone)]
pub struct LembedConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub fastembed: FastembedConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_name")]
    pub name: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name: default_registry_name(),
        }
    }
}

fn default_registry_name() -> String {
    DEFAULT_REGISTRY_NAME.to_string()
}

#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Clone)]
pub struct FastembedConfig {
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub show_download_progress: bool,
}

/// A model registered when a session opens.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct ModelEntry {
    /// Entry name. Omitted means the default slot.
    #[serde(default)]
    pub name: Option<String>,
    /// Model card path or fastembed catalog name.
    pub source: String,
    #[serde(default)]
    pub options: ModelOptions,
}

impl LembedConfig {
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file '{}': {e}", path.display()))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, String> {
        let config: LembedConfig =
            toml::from_str(contents).map_err(|e| format!("invalid config: {e}"))?;
        if config.registry.name.trim().is_empty() {
            return Err("invalid config: registry.name must not be empty".to_string());
        }
        for (i, model) in config.models.iter().enumerate() {
            if model.source.trim().is_empty() {
                return Err(format!("invalid config: models[{i}].source must not be empty"));
            }
            model
                .options
                .validate()
                .map_err(|e| format!("invalid config: models[{i}]: {e}"))?;
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("failed to serialize config: {e}"))
    }

    pub fn fastembed_loader(&self) -> FastembedLoader {
        FastembedLoader::new(
            self.fastembed.cache_dir.clone(),
            self.fastembed.show_download_progress,
        )
    }

    /// Build a registry with the default loaders and every configured model
    /// registered, in file order.
    pub fn build_registry(&self) -> Result<ModelRegistry, EmbedError> {
        let mut registry =
            ModelRegistry::with_default_loaders(self.registry.name.clone(), self.fastembed_loader());
        for model in &self.models {
            registry.register(
                model.name.as_deref(),
                ModelRef::Source(ModelSource::path(&model.source), model.options.clone()),
            )?;
        }
        Ok(registry)
    }
}
