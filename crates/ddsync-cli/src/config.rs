//! Configuration file management.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use ddsync_core::{AllowList, DEFAULT_READ_TIMEOUT, ManagerConfig, PeripheralHandle};
use serde::{Deserialize, Serialize};

use crate::cli::OutputFormat;

/// Configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Advertised-name prefix that identifies a dd-device
    #[serde(default)]
    pub name_prefix: Option<String>,

    /// Seconds to wait for each record read; 0 waits forever
    #[serde(default)]
    pub read_timeout_secs: Option<u64>,

    /// Devices that are connected and synced automatically
    #[serde(default)]
    pub paired: BTreeSet<String>,

    /// Default output format
    #[serde(default)]
    pub format: Option<OutputFormat>,
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ddsync")
            .join("config.toml")
    }

    /// Load config from file, or return default if not found
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), "Failed to parse config: {}", e);
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Failed to read config: {}", e);
                }
            }
        }
        Self::default()
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Add a device to the paired list. Returns `true` if it was new.
    pub fn pair(&mut self, handle: &str) -> bool {
        self.paired.insert(handle.to_string())
    }

    /// Remove a device from the paired list. Returns `true` if it was present.
    pub fn unpair(&mut self, handle: &str) -> bool {
        self.paired.remove(handle)
    }

    /// Paired devices plus any given on the command line.
    pub fn allow_list(&self, extra: &[String]) -> AllowList {
        self.paired
            .iter()
            .chain(extra)
            .map(|h| PeripheralHandle::from(h.as_str()))
            .collect()
    }

    /// Read timeout after applying the "0 disables" rule.
    pub fn read_timeout(&self) -> Option<Duration> {
        match self.read_timeout_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(DEFAULT_READ_TIMEOUT),
        }
    }

    /// Build and validate the connection manager configuration.
    pub fn manager_config(&self) -> Result<ManagerConfig> {
        let mut config = ManagerConfig::default().read_timeout(self.read_timeout());
        if let Some(prefix) = &self.name_prefix {
            config = config.name_prefix(prefix.clone());
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

/// Resolve output format: explicit flag overrides config
pub fn resolve_format(cmd_format: Option<OutputFormat>, config: &Config) -> OutputFormat {
    cmd_format.or(config.format).unwrap_or_default()
}
