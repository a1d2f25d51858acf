use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::MqttProfile;

pub const CREDENTIAL_SLOTS: usize = 3;
pub const DEFAULT_DEVICE_NAME: &str = "ESP32Device";
pub const DEFAULT_MQTT_PORT: u32 = 8883;
pub const DEFAULT_SERVER_PORT: u16 = 12345;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("mqtt broker url is empty")]
    EmptyBroker,
    #[error("mqtt port {0} is outside 1-65535")]
    PortOutOfRange(u32),
    #[error("credential slot {0} does not exist (expected 0-2)")]
    InvalidSlot(usize),
    #[error("ssid is empty")]
    EmptySsid,
    #[error("power save timeout {power_save_ms}ms must be shorter than deep sleep timeout {deep_sleep_ms}ms")]
    TimeoutOrder {
        power_save_ms: u64,
        deep_sleep_ms: u64,
    },
    #[error("static ip requires {0}")]
    StaticIpMissing(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSlot {
    pub ssid: String,
    pub password: String,
    pub remember: bool,
}

impl CredentialSlot {
    pub fn is_configured(&self) -> bool {
        !self.ssid.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticIpConfig {
    pub enabled: bool,
    pub ip: Option<[u8; 4]>,
    pub gateway: Option<[u8; 4]>,
    pub subnet: Option<[u8; 4]>,
    pub dns1: Option<[u8; 4]>,
    pub dns2: Option<[u8; 4]>,
}

/// Resolved static addressing, only produced from a complete [`StaticIpConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticIpSettings {
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub dns1: Option<Ipv4Addr>,
    pub dns2: Option<Ipv4Addr>,
}

impl StaticIpConfig {
    pub fn resolve(&self) -> Result<Option<StaticIpSettings>, ConfigError> {
        if !self.enabled {
            return Ok(None);
        }

        let ip = self.ip.ok_or(ConfigError::StaticIpMissing("ip"))?;
        let gateway = self.gateway.ok_or(ConfigError::StaticIpMissing("gateway"))?;
        let subnet = self.subnet.ok_or(ConfigError::StaticIpMissing("subnet"))?;

        Ok(Some(StaticIpSettings {
            ip: Ipv4Addr::from(ip),
            gateway: Ipv4Addr::from(gateway),
            subnet: Ipv4Addr::from(subnet),
            dns1: self.dns1.map(Ipv4Addr::from),
            dns2: self.dns2.map(Ipv4Addr::from),
        }))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiConfig {
    pub slots: [CredentialSlot; CREDENTIAL_SLOTS],
    pub last_connected_index: Option<usize>,
    #[serde(default)]
    pub static_ip: StaticIpConfig,
}

impl WifiConfig {
    pub fn any_slot_configured(&self) -> bool {
        self.slots.iter().any(CredentialSlot::is_configured)
    }

    pub fn preferred_slot(&self) -> Option<(usize, &CredentialSlot)> {
        let index = self.last_connected_index?;
        self.slots
            .get(index)
            .filter(|slot| slot.is_configured())
            .map(|slot| (index, slot))
    }

    pub fn save_slot(
        &mut self,
        index: usize,
        ssid: &str,
        password: &str,
    ) -> Result<(), ConfigError> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(ConfigError::InvalidSlot(index))?;
        if ssid.trim().is_empty() {
            return Err(ConfigError::EmptySsid);
        }

        *slot = CredentialSlot {
            ssid: ssid.trim().to_string(),
            password: password.to_string(),
            remember: true,
        };
        self.last_connected_index = Some(index);
        Ok(())
    }

    pub fn clear_slot(&mut self, index: usize) -> Result<(), ConfigError> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(ConfigError::InvalidSlot(index))?;
        *slot = CredentialSlot::default();
        if self.last_connected_index == Some(index) {
            self.last_connected_index = None;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttProfileConfig {
    pub broker_url: String,
    pub port: u32,
    pub username: String,
    pub password: String,
}

impl Default for MqttProfileConfig {
    fn default() -> Self {
        Self {
            broker_url: String::new(),
            port: DEFAULT_MQTT_PORT,
            username: String::new(),
            password: String::new(),
        }
    }
}

impl MqttProfileConfig {
    pub fn is_configured(&self) -> bool {
        !self.broker_url.trim().is_empty()
    }

    pub fn validated_port(&self) -> Result<u16, ConfigError> {
        match u16::try_from(self.port) {
            Ok(port) if port != 0 => Ok(port),
            _ => Err(ConfigError::PortOutOfRange(self.port)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub ip: String,
    pub port: u16,
}

impl Default for ServerEndpoint {
    fn default() -> Self {
        Self {
            ip: String::new(),
            port: DEFAULT_SERVER_PORT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerConfig {
    pub power_save_timeout_ms: u64,
    pub deep_sleep_timeout_ms: u64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            power_save_timeout_ms: 30_000,
            deep_sleep_timeout_ms: 3_600_000,
        }
    }
}

impl PowerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.power_save_timeout_ms >= self.deep_sleep_timeout_ms {
            return Err(ConfigError::TimeoutOrder {
                power_save_ms: self.power_save_timeout_ms,
                deep_sleep_ms: self.deep_sleep_timeout_ms,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnobConfig {
    pub device_name: String,
    pub wifi: WifiConfig,
    pub sound_mqtt: MqttProfileConfig,
    pub light_mqtt: MqttProfileConfig,
    #[serde(default)]
    pub sound_server: ServerEndpoint,
    #[serde(default)]
    pub light_server: ServerEndpoint,
    #[serde(default)]
    pub power: PowerConfig,
}

impl Default for KnobConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            wifi: WifiConfig::default(),
            sound_mqtt: MqttProfileConfig::default(),
            light_mqtt: MqttProfileConfig::default(),
            sound_server: ServerEndpoint::default(),
            light_server: ServerEndpoint::default(),
            power: PowerConfig::default(),
        }
    }
}

impl KnobConfig {
    pub fn mqtt_profile(&self, profile: MqttProfile) -> &MqttProfileConfig {
        match profile {
            MqttProfile::Sound => &self.sound_mqtt,
            MqttProfile::Light => &self.light_mqtt,
        }
    }

    pub fn mqtt_profile_mut(&mut self, profile: MqttProfile) -> &mut MqttProfileConfig {
        match profile {
            MqttProfile::Sound => &mut self.sound_mqtt,
            MqttProfile::Light => &mut self.light_mqtt,
        }
    }

    /// Repairs values that would break runtime invariants. Returns `true`
    /// when anything changed so the caller can persist the repaired copy.
    pub fn sanitize(&mut self) -> bool {
        let mut changed = false;

        if self.power.validate().is_err() {
            self.power = PowerConfig::default();
            changed = true;
        }

        if let Some(index) = self.wifi.last_connected_index {
            if index >= CREDENTIAL_SLOTS {
                self.wifi.last_connected_index = None;
                changed = true;
            }
        }

        let trimmed = self.device_name.trim();
        if trimmed.len() != self.device_name.len() {
            self.device_name = trimmed.to_string();
            changed = true;
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn sanitize_restores_power_timeouts_when_out_of_order() {
        let mut config = KnobConfig::default();
        config.power.power_save_timeout_ms = 90_000;
        config.power.deep_sleep_timeout_ms = 60_000;

        assert!(config.sanitize());
        assert_eq!(config.power, PowerConfig::default());
    }

    #[test]
    fn sanitize_drops_out_of_range_slot_index() {
        let mut config = KnobConfig::default();
        config.wifi.last_connected_index = Some(7);

        assert!(config.sanitize());
        assert_eq!(config.wifi.last_connected_index, None);
        assert!(!config.sanitize());
    }

    #[test]
    fn port_validation_rejects_zero_and_oversized() {
        let mut profile = MqttProfileConfig {
            broker_url: "broker.local".to_string(),
            ..MqttProfileConfig::default()
        };
        assert_eq!(profile.validated_port(), Ok(8883));

        profile.port = 0;
        assert_eq!(profile.validated_port(), Err(ConfigError::PortOutOfRange(0)));

        profile.port = 70_000;
        assert_eq!(
            profile.validated_port(),
            Err(ConfigError::PortOutOfRange(70_000))
        );
    }

    #[test]
    fn saving_a_slot_makes_it_preferred() {
        let mut wifi = WifiConfig::default();
        wifi.save_slot(2, " Home ", "pw").unwrap();

        let (index, slot) = wifi.preferred_slot().unwrap();
        assert_eq!(index, 2);
        assert_eq!(slot.ssid, "Home");
        assert!(slot.remember);

        assert_eq!(wifi.save_slot(3, "x", "y"), Err(ConfigError::InvalidSlot(3)));
        wifi.clear_slot(2).unwrap();
        assert_eq!(wifi.last_connected_index, None);
        assert!(!wifi.any_slot_configured());
    }

    #[test]
    fn static_ip_requires_gateway_and_subnet() {
        let config = StaticIpConfig {
            enabled: true,
            ip: Some([192, 168, 1, 50]),
            ..StaticIpConfig::default()
        };
        assert_eq!(
            config.resolve(),
            Err(ConfigError::StaticIpMissing("gateway"))
        );

        let disabled = StaticIpConfig::default();
        assert_eq!(disabled.resolve(), Ok(None));
    }

    #[test]
    fn missing_optional_sections_deserialize_with_defaults() {
        let raw = r#"{
            "device_name": "Knob",
            "wifi": {"slots": [
                {"ssid": "Home", "password": "pw", "remember": true},
                {"ssid": "", "password": "", "remember": false},
                {"ssid": "", "password": "", "remember": false}
            ], "last_connected_index": 0},
            "sound_mqtt": {"broker_url": "b", "port": 1883, "username": "", "password": ""},
            "light_mqtt": {"broker_url": "", "port": 8883, "username": "", "password": ""}
        }"#;

        let config: KnobConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.power, PowerConfig::default());
        assert_eq!(config.sound_server.port, DEFAULT_SERVER_PORT);
        assert!(!config.wifi.static_ip.enabled);
    }
}
