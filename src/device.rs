use crate::error::{EmulatorError, Result};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tracing::info;

pub const MODEL: &str = "SPEM-003CEBEU";
pub const FIRMWARE_VERSION: &str = "1.1.0";
pub const FIRMWARE_ID: &str = "20231219-133625/1.1.0-g9eb7ffd";
pub const APP: &str = "Pro3EM";
/// Device id left at this value is replaced by one derived from the MAC.
pub const PLACEHOLDER_DEVICE_ID: &str = "shellypro3em-emulator";

/// Who the emulator claims to be on every protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    device_id: String,
    name: String,
    mac: [u8; 6],
}

impl DeviceIdentity {
    /// Accepts the MAC with or without `:`/`-` separators.
    pub fn new(device_id: &str, name: &str, mac_address: &str) -> Result<Self> {
        let hex: String = mac_address
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();
        if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(EmulatorError::Config(format!(
                "invalid MAC address '{mac_address}'"
            )));
        }
        let mut mac = [0u8; 6];
        for (i, byte) in mac.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|e| EmulatorError::Config(format!("invalid MAC address: {e}")))?;
        }

        let device_id = if device_id.is_empty() || device_id == PLACEHOLDER_DEVICE_ID {
            format!("shellypro3em-{}", hex[6..].to_ascii_lowercase())
        } else {
            device_id.to_string()
        };

        Ok(Self {
            device_id,
            name: name.to_string(),
            mac,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &'static str {
        MODEL
    }

    pub fn mac_bytes(&self) -> [u8; 6] {
        self.mac
    }

    /// Upper-case, no separators, as the Shelly API reports it.
    pub fn mac_hex(&self) -> String {
        self.mac.iter().map(|b| format!("{b:02X}")).collect()
    }

    pub fn device_info(&self) -> Value {
        json!({
            "name": self.name,
            "id": self.device_id,
            "mac": self.mac_hex(),
            "model": MODEL,
            "gen": 2,
            "fw_id": FIRMWARE_ID,
            "ver": FIRMWARE_VERSION,
            "app": APP,
            "auth_en": false,
            "auth_domain": null,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub protocol: &'static str,
    pub addr: SocketAddr,
}

/// Announces the device on the local network (mDNS or similar).
pub trait PresenceAdvertiser: Send + Sync {
    fn advertise(&self, identity: &DeviceIdentity, services: &[ServiceEndpoint]);
}

/// Only records what would be announced.
pub struct LogAdvertiser;

impl PresenceAdvertiser for LogAdvertiser {
    fn advertise(&self, identity: &DeviceIdentity, services: &[ServiceEndpoint]) {
        for service in services {
            info!(
                device_id = identity.device_id(),
                model = identity.model(),
                protocol = service.protocol,
                addr = %service.addr,
                "Advertising service"
            );
        }
    }
}
