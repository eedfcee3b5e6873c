//! Engine configuration.
//!
//! Loaded from a TOML file with sensible defaults for every field, so an
//! empty file (or no file at all) yields a working development setup.

use crate::storage::database::DatabaseBackend;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Storage section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the embedded database.
    pub data_dir: PathBuf,
    /// Backend name: `sled` or `memory`.
    pub backend: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            backend: default_backend_name().to_string(),
        }
    }
}

impl StorageConfig {
    /// Resolve the configured backend, falling back to the compiled-in
    /// default for unknown names.
    pub fn backend(&self) -> DatabaseBackend {
        match self.backend.as_str() {
            "memory" => DatabaseBackend::Memory,
            "sled" => DatabaseBackend::Sled,
            other => {
                tracing::warn!(backend = %other, "unknown storage backend, using default");
                crate::storage::database::default_backend()
            }
        }
    }
}

fn default_backend_name() -> &'static str {
    match crate::storage::database::default_backend() {
        DatabaseBackend::Sled => "sled",
        DatabaseBackend::Memory => "memory",
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    /// Plugin entry points to load when receiving payments.
    pub plugins: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }
}
