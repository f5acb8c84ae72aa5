use serde::Deserialize;
use std::path::Path;

use crate::modem::keys::DeviceIdentity;
use crate::modem::sim::SimSettings;
use crate::modem::{AdrProfile, DeviceClass, LbtConfig, Region};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub uplink: UplinkConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub simulator: SimSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// OTAA credentials, hex encoded
#[derive(Debug, Deserialize)]
pub struct DeviceConfig {
    pub dev_eui: String,
    pub join_eui: String,
    pub app_key: String,
    /// Falls back to `app_key` when absent
    pub nwk_key: Option<String>,
}

impl DeviceConfig {
    pub fn identity(&self) -> anyhow::Result<DeviceIdentity> {
        DeviceIdentity::from_hex(
            &self.dev_eui,
            &self.join_eui,
            &self.app_key,
            self.nwk_key.as_deref(),
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub region: Region,
    pub class: DeviceClass,
    pub adr: AdrProfile,
    pub lbt: LbtConfig,
    pub csma: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            region: Region::EU868,
            class: DeviceClass::A,
            adr: AdrProfile::NetworkControlled,
            lbt: LbtConfig::default(),
            csma: false,
        }
    }
}

/// What schedules the periodic uplink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum UplinkTrigger {
    /// Compare elapsed time against the interval on every loop pass
    Timer,
    /// Let the engine's one-shot alarm fire, re-arming after each send
    Alarm,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    pub trigger: UplinkTrigger,
    pub interval_ms: u64,
    /// Alarm trigger only: delay before the first uplink after joining
    pub first_uplink_delay_s: u32,
    pub port: u8,
    pub confirmed: bool,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            trigger: UplinkTrigger::Timer,
            interval_ms: 10_000,
            first_uplink_delay_s: 60,
            port: 2,
            confirmed: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on the sleep between two engine pumps
    pub cadence_ms: u64,
    /// Capacity of the event subscriber channel
    pub event_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cadence_ms: 10,
            event_queue: 32,
        }
    }
}

#[derive(Debug, Deserialize)]
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

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig {
                dev_eui: "0000000000000000".to_string(),
                join_eui: "0000000000000000".to_string(),
                app_key: "00000000000000000000000000000000".to_string(),
                nwk_key: None,
            },
            network: NetworkConfig::default(),
            uplink: UplinkConfig::default(),
            engine: EngineConfig::default(),
            simulator: SimSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}
