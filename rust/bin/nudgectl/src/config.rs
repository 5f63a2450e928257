//! `nudgectl` configuration.
//!
//! Reads `~/.bundlenudge/nudgectl.toml` (or `--config`). A missing file
//! yields defaults; command-line flags override whatever the file says.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use bundlenudge_core::ServiceConfig;
use rollout::RolloutConfig;

/// `[storage]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageSection {
    /// Directory holding `data.redb`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Explicit database file; wins over `data_dir`.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

/// Configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CtlConfig {
    #[serde(default)]
    pub storage: StorageSection,

    #[serde(default)]
    pub rollout: RolloutConfig,
}

impl CtlConfig {
    /// Default config file path: ~/.bundlenudge/nudgectl.toml.
    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".bundlenudge").join("nudgectl.toml")
    }

    /// Load config from disk, or return default if the file doesn't exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: CtlConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Storage settings with command-line overrides applied.
    pub fn service_config(&self, data_dir: Option<PathBuf>, db_path: Option<PathBuf>) -> ServiceConfig {
        ServiceConfig {
            data_dir: data_dir.or_else(|| self.storage.data_dir.clone()),
            db_path: db_path.or_else(|| self.storage.db_path.clone()),
        }
    }
}
