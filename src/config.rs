use crate::device::PLACEHOLDER_DEVICE_ID;
use crate::entity_resolver::Slot;
use crate::error::{EmulatorError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";
/// Upper bound for the poll interval, in seconds.
pub const MAX_POLL_INTERVAL_SECS: f64 = 86_400.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub device: DeviceSettings,
    pub home_assistant: HomeAssistantSettings,
    pub discovery: DiscoverySettings,
    pub servers: ServerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub device_id: String,
    pub name: String,
    pub mac_address: String,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            device_id: PLACEHOLDER_DEVICE_ID.to_string(),
            name: "Shelly Pro 3EM Emulator".to_string(),
            mac_address: "02:00:00:00:00:01".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeAssistantSettings {
    pub url: String,
    pub token: String,
    pub poll_interval_secs: f64,
    pub timeout_secs: f64,
}

impl Default for HomeAssistantSettings {
    fn default() -> Self {
        Self {
            url: "http://homeassistant.local:8123".to_string(),
            token: String::new(),
            poll_interval_secs: 2.0,
            timeout_secs: 1.5,
        }
    }
}

impl HomeAssistantSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub enabled: bool,
    pub retry_interval_secs: u64,
    /// Slot key (e.g. `power_consumption_l1`) to entity id.
    pub overrides: BTreeMap<String, String>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_interval_secs: 30,
            overrides: BTreeMap::new(),
        }
    }
}

impl DiscoverySettings {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn slot_overrides(&self) -> Result<BTreeMap<Slot, String>> {
        self.overrides
            .iter()
            .map(|(key, entity_id)| Ok((key.parse::<Slot>()?, entity_id.clone())))
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub modbus: ModbusSettings,
    pub udp: UdpSettings,
    pub websocket: WebSocketSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ModbusSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 502,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpSettings {
    pub enabled: bool,
    pub host: String,
    pub ports: Vec<u16>,
}

impl Default for UdpSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            ports: vec![1010, 2220],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 80,
        }
    }
}

impl Settings {
    /// Loads `path` if it exists, falling back to defaults otherwise, then
    /// applies `HA_URL` / `HA_TOKEN` from the environment.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let settings = Self::from_yaml(&content)?;
            info!(path = %path.display(), "Configuration loaded");
            settings
        } else {
            info!(path = %path.display(), "No configuration file, using defaults");
            Self::default()
        };

        if let Ok(url) = std::env::var("HA_URL") {
            settings.home_assistant.url = url;
        }
        if let Ok(token) = std::env::var("HA_TOKEN") {
            settings.home_assistant.token = token;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Parses YAML after expanding `$(VAR)` placeholders. Does not validate.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content)?;
        Ok(serde_yaml::from_str(&expanded)?)
    }

    pub fn validate(&self) -> Result<()> {
        let ha = &self.home_assistant;
        // Durations are built with from_secs_f64, which panics outside this range
        if !ha.poll_interval_secs.is_finite()
            || ha.poll_interval_secs <= 0.0
            || ha.poll_interval_secs > MAX_POLL_INTERVAL_SECS
        {
            return Err(EmulatorError::Config(format!(
                "poll_interval_secs ({}) must be positive and at most {MAX_POLL_INTERVAL_SECS}",
                ha.poll_interval_secs
            )));
        }
        if !ha.timeout_secs.is_finite()
            || ha.timeout_secs <= 0.0
            || ha.timeout_secs >= ha.poll_interval_secs
        {
            return Err(EmulatorError::Config(format!(
                "timeout_secs ({}) must be positive and shorter than poll_interval_secs ({})",
                ha.timeout_secs, ha.poll_interval_secs
            )));
        }

        let hex_digits = self
            .device
            .mac_address
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect::<String>();
        if hex_digits.len() != 12 || !hex_digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(EmulatorError::Config(format!(
                "mac_address '{}' must be 12 hex digits",
                self.device.mac_address
            )));
        }

        self.discovery.slot_overrides()?;

        if self.servers.udp.enabled && self.servers.udp.ports.is_empty() {
            return Err(EmulatorError::Config(
                "UDP server enabled without any ports".to_string(),
            ));
        }

        Ok(())
    }
}

/// Expand environment variables in the format $(VAR_NAME). Unknown
/// variables are left as written.
fn expand_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(r"\$\(([A-Z_][A-Z0-9_]*)\)")
        .map_err(|e| EmulatorError::Config(e.to_string()))?;
    let expanded = re.replace_all(content, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    });
    Ok(expanded.into_owned())
}
