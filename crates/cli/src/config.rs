// proxid - CLI Config Module
// Handles CLI configuration for connecting to the daemon

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// CLI configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CliConfig {
    /// Base URL of the daemon control API
    #[serde(default = "default_daemon_url")]
    pub daemon_url: String,
}

fn default_daemon_url() -> String {
    "http://127.0.0.1:4444".to_string()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            daemon_url: default_daemon_url(),
        }
    }
}

impl CliConfig {
    /// Load CLI configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load CLI configuration from file, falling back to defaults if it doesn't exist
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents =
            fs::read_to_string(config_path).context("Failed to read CLI configuration")?;

        let config: Self =
            toml::from_str(&contents).context("Failed to parse CLI configuration")?;

        Ok(config)
    }

    /// Get the path to the CLI configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("proxid").join("cli.toml"))
    }

    /// Full URL of an API endpoint
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.daemon_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}
