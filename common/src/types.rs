use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StationStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl StationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MqttProfile {
    Sound,
    Light,
}

impl MqttProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sound => "sound",
            Self::Light => "light",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sound" => Some(Self::Sound),
            "light" => Some(Self::Light),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    Normal,
    PowerSave,
    DeepSleep,
}

impl PowerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::PowerSave => "POWER_SAVE",
            Self::DeepSleep => "DEEP_SLEEP",
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::PowerSave => 1,
            Self::DeepSleep => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Normal,
            1 => Self::PowerSave,
            _ => Self::DeepSleep,
        }
    }
}

/// Inbound message channels, one single-slot mailbox each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    MqttSound,
    MqttLight,
    Tcp,
    Serial,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::MqttSound,
        Channel::MqttLight,
        Channel::Tcp,
        Channel::Serial,
    ];

    pub fn for_profile(profile: MqttProfile) -> Self {
        match profile {
            MqttProfile::Sound => Self::MqttSound,
            MqttProfile::Light => Self::MqttLight,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::MqttSound => 0,
            Self::MqttLight => 1,
            Self::Tcp => 2,
            Self::Serial => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Display,
    Network,
}

impl LoopKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Display => "display",
            Self::Network => "network",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectivityStatus {
    #[serde(rename = "station")]
    pub station: StationStatus,
    #[serde(rename = "apActive")]
    pub ap_active: bool,
    pub channel: u8,
    #[serde(rename = "stationIp")]
    pub station_ip: Option<String>,
    #[serde(rename = "apIp")]
    pub ap_ip: Option<String>,
    #[serde(rename = "internetAvailable")]
    pub internet_available: bool,
    #[serde(rename = "mqttStatus")]
    pub mqtt_status: SessionStatus,
    #[serde(rename = "mqttProfile")]
    pub mqtt_profile: MqttProfile,
    #[serde(rename = "tcpClientConnected")]
    pub tcp_client_connected: bool,
    #[serde(rename = "signalBars")]
    pub signal_bars: u8,
    #[serde(rename = "powerState")]
    pub power_state: PowerState,
}
