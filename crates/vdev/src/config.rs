//! Device process configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VdevConfig {
    #[serde(default)]
    pub vdev: VdevSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VdevSettings {
    /// Unix socket the host controller connects to (`~` is expanded)
    #[serde(default = "VdevSettings::default_socket")]
    pub socket: String,
    #[serde(default = "VdevSettings::default_log_level")]
    pub log_level: String,
}

impl Default for VdevSettings {
    fn default() -> Self {
        Self {
            socket: Self::default_socket(),
            log_level: Self::default_log_level(),
        }
    }
}

impl VdevSettings {
    fn default_socket() -> String {
        "~/.local/run/vhc/vdev.sock".to_string()
    }

    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl VdevConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/vhc/vdev.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: VdevConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("vhc").join("vdev.toml")
        } else {
            PathBuf::from(".config/vhc/vdev.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.vdev.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.vdev.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.vdev.socket.trim().is_empty() {
            return Err(anyhow!("Socket path must not be empty"));
        }

        Ok(())
    }

    /// Socket path with `~` expanded
    pub fn socket_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.vdev.socket).as_ref())
    }
}
