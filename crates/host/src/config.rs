//! Host controller configuration management

use crate::vhc::processor::{ProcessorSettings, UnplugPolicy};
use anyhow::{Context, Result, anyhow};
use protocol::UsbAddress;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub processor: ProcessorConfig,
    /// Devices plugged at startup, in order
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    pub log_level: String,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Queue processor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Pause between queue processor iterations in milliseconds
    #[serde(default = "ProcessorConfig::default_bus_delay_ms")]
    pub bus_delay_ms: u64,
    /// Give up on a transfer after this many NAKs (unbounded if unset)
    #[serde(default)]
    pub nak_retry_limit: Option<u32>,
    #[serde(default)]
    pub unplug_policy: UnplugPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            bus_delay_ms: Self::default_bus_delay_ms(),
            nak_retry_limit: None,
            unplug_policy: UnplugPolicy::default(),
        }
    }
}

impl ProcessorConfig {
    fn default_bus_delay_ms() -> u64 {
        100
    }
}

/// How a configured device is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    /// Built-in loopback emulation, run in-process
    Loopback,
    /// Device process listening on a Unix socket
    Remote,
}

/// A device plugged at startup
///
/// # Example Configuration
/// ```toml
/// [[devices]]
/// address = 0
/// kind = "loopback"
///
/// [[devices]]
/// address = 0
/// kind = "remote"
/// socket = "~/.local/run/vhc/kbd.sock"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Bus address the device answers to until it is reassigned
    #[serde(default)]
    pub address: UsbAddress,
    pub kind: DeviceKind,
    /// Socket path of the device process, required for remote devices
    #[serde(default)]
    pub socket: Option<String>,
}

impl DeviceConfig {
    /// Socket path with `~` expanded
    pub fn socket_path(&self) -> Option<PathBuf> {
        self.socket
            .as_deref()
            .map(|s| PathBuf::from(shellexpand::tilde(s).as_ref()))
    }
}

impl HostConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/vhc/host.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
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
            config_dir.join("vhc").join("host.toml")
        } else {
            PathBuf::from(".config/vhc/host.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            ));
        }

        for (index, device) in self.devices.iter().enumerate() {
            if device.kind != DeviceKind::Remote {
                continue;
            }
            match device.socket.as_deref() {
                Some(socket) if !socket.trim().is_empty() => {}
                _ => {
                    return Err(anyhow!(
                        "Remote device #{} (address {}) needs a socket path",
                        index,
                        device.address
                    ));
                }
            }
        }

        Ok(())
    }

    /// Queue processor settings described by this configuration
    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            bus_delay: Duration::from_millis(self.processor.bus_delay_ms),
            nak_retry_limit: self.processor.nak_retry_limit,
            unplug_policy: self.processor.unplug_policy,
        }
    }
}
