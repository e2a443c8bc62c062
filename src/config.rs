use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "LORAWAN_BRIDGE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "./lorawan-bridge.toml";

/// Upstream ChirpStack broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChirpStackConfig {
    pub mqtt_server: String,
    pub client_id: String,
    pub uplink_topic: String,
    pub join_topic: String,
}

impl Default for ChirpStackConfig {
    fn default() -> Self {
        Self {
            mqtt_server: "tcp://mosquitto:1883".to_string(),
            client_id: "myiotgrid-bridge".to_string(),
            uplink_topic: "application/+/device/+/event/up".to_string(),
            join_topic: "application/+/device/+/event/join".to_string(),
        }
    }
}

/// Downstream myIoTGrid broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MyIoTGridConfig {
    pub mqtt_server: String,
    pub client_id: String,
}

impl Default for MyIoTGridConfig {
    fn default() -> Self {
        Self {
            mqtt_server: "tcp://mosquitto:1884".to_string(),
            client_id: "myiotgrid-gateway-lorawan".to_string(),
        }
    }
}

/// Top-level bridge configuration file structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub chirpstack: ChirpStackConfig,
    #[serde(default)]
    pub myiotgrid: MyIoTGridConfig,
    #[serde(default = "default_decoder")]
    pub decoder: String,
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

fn default_decoder() -> String {
    "myiotgrid".to_string()
}

fn default_status_interval() -> u64 {
    60
}

fn default_reconnect_delay() -> u64 {
    5
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            chirpstack: ChirpStackConfig::default(),
            myiotgrid: MyIoTGridConfig::default(),
            decoder: default_decoder(),
            status_interval_secs: default_status_interval(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

impl BridgeConfig {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let config: BridgeConfig =
            toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(config)
    }

    /// File (if present) plus process environment overrides
    pub fn resolve(explicit_path: Option<&Path>) -> Result<Self> {
        let path = explicit_path
            .map(Path::to_path_buf)
            .unwrap_or_else(config_path);

        let mut config = if path.exists() {
            Self::load(&path)?
        } else if explicit_path.is_some() {
            bail!("Config file {:?} does not exist", path);
        } else {
            Self::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides through `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let targets: [(&str, &mut String); 7] = [
            ("CHIRPSTACK_MQTT_SERVER", &mut self.chirpstack.mqtt_server),
            ("CHIRPSTACK_CLIENT_ID", &mut self.chirpstack.client_id),
            ("CHIRPSTACK_TOPIC_UPLINK", &mut self.chirpstack.uplink_topic),
            ("CHIRPSTACK_TOPIC_JOIN", &mut self.chirpstack.join_topic),
            ("MYIOTGRID_MQTT_SERVER", &mut self.myiotgrid.mqtt_server),
            ("MYIOTGRID_CLIENT_ID", &mut self.myiotgrid.client_id),
            ("LORAWAN_BRIDGE_DECODER", &mut self.decoder),
        ];

        for (key, target) in targets {
            if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
                *target = value;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.status_interval_secs == 0 {
            bail!("status_interval_secs must be greater than zero");
        }
        if self.reconnect_delay_secs == 0 {
            bail!("reconnect_delay_secs must be greater than zero");
        }
        if self.chirpstack.uplink_topic.is_empty() || self.chirpstack.join_topic.is_empty() {
            bail!("ChirpStack uplink and join topics must not be empty");
        }
        Ok(())
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Resolve the config file path.
///
/// Priority:
/// 1. `LORAWAN_BRIDGE_CONFIG` env var
/// 2. `./lorawan-bridge.toml`
pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}
