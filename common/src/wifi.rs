use std::{net::Ipv4Addr, time::Duration};

use thiserror::Error;

use crate::{
    config::{KnobConfig, StaticIpSettings, WifiConfig},
    constants::{
        AP_CHECK_INTERVAL_MS, AP_EXPECTED_IP, AP_FALLBACK_SSID, AP_PASSWORD,
        WIFI_CONNECT_TIMEOUT, WIFI_SCAN_INTERVAL_MS,
    },
    internet::LinkState,
    types::StationStatus,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub ssid: String,
    pub channel: u8,
    pub rssi: i8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointConfig {
    pub ssid: String,
    pub password: String,
    pub channel: u8,
}

/// Radio driver primitives for a single-radio AP+STA chip.
pub trait WifiRadio: Send {
    /// (Re)configures and starts the soft AP on `config.channel`.
    fn start_access_point(&mut self, config: &AccessPointConfig) -> Result<(), RadioError>;
    fn stop_access_point(&mut self);
    fn access_point_ip(&self) -> Option<Ipv4Addr>;

    fn set_static_ip(&mut self, settings: Option<StaticIpSettings>) -> Result<(), RadioError>;
    /// Associates and waits up to `timeout` for the link to come up.
    fn associate(&mut self, ssid: &str, password: &str, timeout: Duration) -> bool;
    fn disconnect_station(&mut self);
    fn is_station_connected(&self) -> bool;
    fn station_channel(&self) -> Option<u8>;
    fn station_ip(&self) -> Option<Ipv4Addr>;
    fn rssi(&self) -> Option<i8>;
    fn scan(&mut self) -> Vec<ScanResult>;
}

/// Driver errors reduced to a message; callers only log them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct RadioError(pub String);

impl RadioError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiEvent {
    Reconnected,
    Disconnected,
}

pub struct WifiManager {
    radio: Box<dyn WifiRadio>,
    link: LinkState,
    status: StationStatus,
    ap_active: bool,
    ap_ip_verified: bool,
    channel: u8,
    ap_ssid: String,
    last_scan_ms: Option<u64>,
    last_ap_check_ms: u64,
}

impl WifiManager {
    pub fn new(radio: Box<dyn WifiRadio>, link: LinkState, device_name: &str) -> Self {
        let name = device_name.trim();
        let ap_ssid = if name.is_empty() {
            AP_FALLBACK_SSID.to_string()
        } else {
            name.to_string()
        };

        Self {
            radio,
            link,
            status: StationStatus::Disconnected,
            ap_active: false,
            ap_ip_verified: false,
            channel: 1,
            ap_ssid,
            last_scan_ms: None,
            last_ap_check_ms: 0,
        }
    }

    /// Brings up the AP, then tries the stored networks.
    pub fn initialize(&mut self, config: &mut KnobConfig, now_ms: u64) -> bool {
        match config.wifi.static_ip.resolve() {
            Ok(settings) => {
                if let Err(err) = self.radio.set_static_ip(settings) {
                    log::warn!("failed to apply static ip, using dhcp: {err}");
                }
            }
            Err(err) => log::warn!("invalid static ip configuration, using dhcp: {err}"),
        }

        self.start_ap_mode();
        self.last_ap_check_ms = now_ms;
        let connected = self.connect_to_wifi(&mut config.wifi);
        self.last_scan_ms = Some(now_ms);
        connected
    }

    pub fn start_ap_mode(&mut self) -> bool {
        let ap = AccessPointConfig {
            ssid: self.ap_ssid.clone(),
            password: AP_PASSWORD.to_string(),
            channel: self.channel,
        };

        if let Err(err) = self.radio.start_access_point(&ap) {
            log::warn!("failed to start access point `{}`: {err}", ap.ssid);
            self.ap_active = false;
            self.ap_ip_verified = false;
            return false;
        }

        // Marked active even when the address check is inconclusive.
        self.ap_active = true;
        self.ap_ip_verified = self.radio.access_point_ip() == Some(AP_EXPECTED_IP);
        if self.ap_ip_verified {
            log::info!("access point `{}` up on channel {}", ap.ssid, ap.channel);
        } else {
            log::warn!(
                "access point `{}` started on channel {} but its address is unverified",
                ap.ssid,
                ap.channel
            );
        }
        true
    }

    /// Tries the preferred slot, then the first stored slot visible in a
    /// scan. Updates `last_connected_index` when a different slot wins.
    pub fn connect_to_wifi(&mut self, wifi: &mut WifiConfig) -> bool {
        if let Some((index, slot)) = wifi.preferred_slot() {
            log::info!("connecting to last used network `{}` (slot {index})", slot.ssid);
            let (ssid, password) = (slot.ssid.clone(), slot.password.clone());
            if self.try_associate(&ssid, &password) {
                return true;
            }
        }

        if !wifi.any_slot_configured() {
            log::info!("no stored networks; staying in AP-only mode");
            return false;
        }

        let visible = self.radio.scan();
        log::info!("scan found {} networks", visible.len());

        let candidate = wifi.slots.iter().enumerate().find(|(_, slot)| {
            slot.is_configured()
                && visible.iter().any(|network| network.ssid == slot.ssid)
        });

        let Some((index, slot)) = candidate else {
            log::info!("no stored network in range; staying in AP-only mode");
            return false;
        };

        log::info!("found stored network `{}` (slot {index})", slot.ssid);
        let (ssid, password) = (slot.ssid.clone(), slot.password.clone());
        if !self.try_associate(&ssid, &password) {
            return false;
        }

        wifi.last_connected_index = Some(index);
        true
    }

    fn try_associate(&mut self, ssid: &str, password: &str) -> bool {
        self.status = StationStatus::Connecting;
        if !self.radio.associate(ssid, password, WIFI_CONNECT_TIMEOUT) {
            log::warn!("connection to `{ssid}` timed out");
            self.radio.disconnect_station();
            self.set_disconnected();
            return false;
        }

        self.status = StationStatus::Connected;
        self.link.set(true);
        if let Some(ip) = self.radio.station_ip() {
            log::info!("connected to `{ssid}`, ip {ip}");
        }
        self.sync_ap_channel();
        true
    }

    /// AP and STA share the radio, so the AP follows the station channel.
    fn sync_ap_channel(&mut self) {
        let Some(channel) = self.radio.station_channel() else {
            log::warn!("station channel unknown; leaving AP on channel {}", self.channel);
            return;
        };

        if channel == self.channel && self.ap_active {
            return;
        }

        log::info!("moving access point to channel {channel}");
        self.channel = channel;
        self.radio.stop_access_point();
        self.start_ap_mode();
    }

    fn set_disconnected(&mut self) {
        self.status = StationStatus::Disconnected;
        self.link.set(false);
    }

    pub fn update(&mut self, wifi: &mut WifiConfig, now_ms: u64) -> Option<WifiEvent> {
        let connected = self.radio.is_station_connected();
        let was_connected = self.status == StationStatus::Connected;

        let event = match (was_connected, connected) {
            (false, true) => {
                log::info!("station reconnected");
                self.status = StationStatus::Connected;
                self.link.set(true);
                self.sync_ap_channel();
                Some(WifiEvent::Reconnected)
            }
            (true, false) => {
                log::warn!("station disconnected");
                self.set_disconnected();
                Some(WifiEvent::Disconnected)
            }
            _ => None,
        };

        if !connected && wifi.any_slot_configured() {
            let due = match self.last_scan_ms {
                None => true,
                Some(last) => now_ms.saturating_sub(last) >= WIFI_SCAN_INTERVAL_MS,
            };
            if due {
                self.last_scan_ms = Some(now_ms);
                if self.connect_to_wifi(wifi) {
                    return Some(WifiEvent::Reconnected);
                }
            }
        }

        if now_ms.saturating_sub(self.last_ap_check_ms) >= AP_CHECK_INTERVAL_MS {
            self.last_ap_check_ms = now_ms;
            self.verify_access_point();
        }

        event
    }

    fn verify_access_point(&mut self) {
        if self.ap_active && self.radio.access_point_ip().is_some() {
            return;
        }
        log::warn!("access point has no address; restarting it");
        self.radio.stop_access_point();
        self.start_ap_mode();
    }

    pub fn is_wifi_connected(&self) -> bool {
        self.status == StationStatus::Connected
    }

    pub fn is_ap_mode_active(&self) -> bool {
        self.ap_active
    }

    pub fn ap_ip_verified(&self) -> bool {
        self.ap_ip_verified
    }

    pub fn station_status(&self) -> StationStatus {
        self.status
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn station_ip(&self) -> Option<Ipv4Addr> {
        if self.is_wifi_connected() {
            self.radio.station_ip()
        } else {
            None
        }
    }

    pub fn access_point_ip(&self) -> Option<Ipv4Addr> {
        if self.ap_active {
            self.radio.access_point_ip()
        } else {
            None
        }
    }

    /// Address shown to control-plane clients: the AP address while the AP
    /// is up, otherwise the station address.
    pub fn advertised_ip(&self) -> Option<Ipv4Addr> {
        self.access_point_ip().or_else(|| self.station_ip())
    }

    pub fn wifi_signal_strength(&self) -> u8 {
        if !self.is_wifi_connected() {
            return 0;
        }
        self.radio.rssi().map_or(0, signal_bars)
    }
}

pub fn signal_bars(rssi: i8) -> u8 {
    match rssi {
        r if r > -55 => 3,
        r if r > -70 => 2,
        r if r > -85 => 1,
        _ => 0,
    }
}
