//! Agent configuration
//!
//! Loaded once at startup from a TOML file and handed by value to every component that needs
//! it. Missing sections fall back to defaults so a partially written file still starts the
//! agent; missing cell metadata only blocks starting a run.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/takt-relay";
const CONFIG_FILE: &str = "config.toml";
const CONFIG_ENV: &str = "TAKT_RELAY_CONFIG";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub broker: BrokerConfig,
    pub device: DeviceConfig,
    pub cell: CellConfig,
    pub timing: TimingConfig,
    pub logging: LoggingConfig,
    pub events: EventsConfig,
}

/// Broker address and credentials
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Empty means anonymous
    pub username: String,
    pub password: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    /// Pause between reconnect attempts after the link drops
    pub reconnect_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "takt-relay".to_string(),
            username: String::new(),
            password: String::new(),
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            reconnect_delay_ms: 1000,
        }
    }
}

impl BrokerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn credentials(&self) -> Option<(String, String)> {
        if self.username.is_empty() {
            None
        } else {
            Some((self.username.clone(), self.password.clone()))
        }
    }
}

/// The controller device that receives takt commands
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub id: String,
    /// Topic prefix, `<namespace>/device/<id>/...`
    pub namespace: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "cost-2-2408".to_string(),
            namespace: "takt".to_string(),
        }
    }
}

/// Production cell metadata; all three fields are required before a run may start
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct CellConfig {
    pub cell_number: String,
    pub factory: String,
    pub cell_leader: String,
}

impl CellConfig {
    pub fn is_complete(&self) -> bool {
        [&self.cell_number, &self.factory, &self.cell_leader]
            .iter()
            .all(|field| !field.trim().is_empty())
    }
}

/// Timing constants for the tick loop and liveness sweep
///
/// `debounce_ms` assumes genuine completions on the line are never closer than 20 seconds.
/// Lower it only for lines with a shorter takt.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    pub tick_ms: u64,
    pub debounce_ms: u64,
    pub screen_notice_cooldown_ms: u64,
    pub offline_notice_cooldown_ms: u64,
    pub screen_timeout_ms: u64,
    pub error_backoff_ms: u64,
    pub liveness_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_ms: 500,
            debounce_ms: 20_000,
            screen_notice_cooldown_ms: 5_000,
            offline_notice_cooldown_ms: 30_000,
            screen_timeout_ms: 6_000,
            error_backoff_ms: 2_000,
            liveness_timeout_secs: 60,
            sweep_interval_secs: 10,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

impl AgentConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AgentConfig =
            toml::from_str(content).map_err(|e| eyre!("Failed to parse config: {}", e))?;
        if config.device.id.trim().is_empty() {
            return Err(eyre!("Config is missing a device id"));
        }
        Ok(config)
    }

    /// Resolves the config path from `$TAKT_RELAY_CONFIG` or the home directory
    pub fn path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Writes a default config file if none exists yet
    pub async fn ensure_default_config(path: &PathBuf) -> Result<()> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            return Ok(());
        }

        info!("Creating default configuration at {}", path.display());
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(&AgentConfig::default())
            .map_err(|e| eyre!("Failed to serialize default config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;
        Ok(())
    }

    pub async fn load(path: &PathBuf) -> Result<Self> {
        Self::ensure_default_config(path).await?;

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = Self::from_toml(&content)?;

        debug!("Loaded configuration: {:?}", config.broker.address());
        if !config.cell.is_complete() {
            warn!("Cell configuration is incomplete, runs will be rejected until it is filled in");
        }
        Ok(config)
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
