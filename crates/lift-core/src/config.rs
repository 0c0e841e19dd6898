use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the lift sync engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Backend base URL (if None, runs in local-only mode)
    pub base_url: Option<String>,

    /// Timeout for ordinary API calls; generous because a cold backend can
    /// take several seconds to answer the first request
    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Periodic auto-sync interval in seconds
    #[serde(default = "default_sync_interval")]
    pub interval_seconds: u64,

    /// Delay between health probes while the backend is waking up
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Timeout of a single health probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// How often the daemon checks whether the backend host is reachable
    #[serde(default = "default_link_check_interval")]
    pub link_check_interval_secs: u64,

    /// Pull chat rooms and messages as part of every cycle
    #[serde(default = "default_include_chat")]
    pub include_chat: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database holding the local cache, queue and checkpoints
    pub database_path: Option<PathBuf>,
}

fn default_api_timeout() -> u64 {
    30
}

fn default_sync_interval() -> u64 {
    60
}

fn default_probe_interval() -> u64 {
    5
}

fn default_probe_timeout() -> u64 {
    3
}

fn default_link_check_interval() -> u64 {
    10
}

fn default_include_chat() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_timeout_secs: default_api_timeout(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_seconds: default_sync_interval(),
            probe_interval_secs: default_probe_interval(),
            probe_timeout_secs: default_probe_timeout(),
            link_check_interval_secs: default_link_check_interval(),
            include_chat: default_include_chat(),
        }
    }
}

impl ServerConfig {
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    pub fn link_check_interval(&self) -> Duration {
        Duration::from_secs(self.link_check_interval_secs.max(1))
    }
}

impl Config {
    /// Load configuration from `$LIFT_CONFIG` or the default location,
    /// writing a default file if none exists yet.
    pub fn load() -> Result<Self> {
        let path = Self::get_config_path()?;
        Self::load_or_init(&path)
    }

    /// Load from `path`, creating it with defaults when missing.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            tracing::info!("created default config at {}", path.display());
            return Ok(config);
        }
        Self::load_from(path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, toml_str)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Get the config file path
    pub fn get_config_path() -> Result<PathBuf> {
        if let Ok(custom_path) = std::env::var("LIFT_CONFIG") {
            return Ok(PathBuf::from(custom_path));
        }
        let config_dir = dirs::config_dir().context("Could not determine config directory")?;
        Ok(config_dir.join("lift").join("config.toml"))
    }

    /// Database path, falling back to `~/.local/share/lift/lift.db`
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.storage.database_path {
            return Ok(path.clone());
        }
        let home_dir = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home_dir
            .join(".local")
            .join("share")
            .join("lift")
            .join("lift.db"))
    }
}
