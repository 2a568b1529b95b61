//! Configuration for nbdlink.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{DEFAULT_BLOCK_SIZE, DeviceGeometry};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub peer: PeerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub block_size: u32,
    pub disk_size_mb: u64,
    pub read_only: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            disk_size_mb: 1024,
            read_only: false,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(ConfigError::InvalidValue {
                field: "device.block_size",
                reason: "must be a power of two",
            });
        }
        if self.disk_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "device.disk_size_mb",
                reason: "must be > 0",
            });
        }
        if self.disk_size_mb.checked_mul(1024 * 1024).is_none() {
            return Err(ConfigError::InvalidValue {
                field: "device.disk_size_mb",
                reason: "too large",
            });
        }
        Ok(())
    }

    pub fn disk_size(&self) -> u64 {
        self.disk_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn geometry(&self) -> DeviceGeometry {
        DeviceGeometry::new(self.block_size, self.disk_size()).with_read_only(self.read_only)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    #[serde(default = "default_peer_address")]
    pub address: String,
    /// Reply read deadline. Unset means wait forever.
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            address: default_peer_address(),
            read_timeout_ms: None,
        }
    }
}

impl PeerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "peer.read_timeout_ms",
                reason: "must be > 0 when set",
            });
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub devices: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            devices: crate::registry::DEFAULT_DEVICE_COUNT,
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices == 0 {
            return Err(ConfigError::InvalidValue {
                field: "registry.devices",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

fn default_peer_address() -> String {
    "127.0.0.1:10809".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device.validate()?;
        self.peer.validate()?;
        self.registry.validate()
    }
}
