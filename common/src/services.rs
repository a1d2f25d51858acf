use std::{net::SocketAddr, sync::Arc};

use crate::{
    config::KnobConfig,
    inbox::Inbox,
    internet::{InternetProber, LinkState, ReachabilityProbe},
    mqtt::{self, MqttSession, MqttTransport},
    store::SettingsStore,
    tcp::{ControlServer, ServerLink},
    types::{ConnectivityStatus, MqttProfile, PowerState},
    wifi::{WifiEvent, WifiManager, WifiRadio},
};

/// Subsystems serviced by the network loop, one per lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Wifi,
    Tcp,
    Mqtt,
}

impl Subsystem {
    pub const ORDER: [Subsystem; 3] = [Subsystem::Wifi, Subsystem::Tcp, Subsystem::Mqtt];
}

/// The connectivity context constructed once at startup and shared by the
/// two loops behind the scheduler lock.
pub struct ConnectivityServices {
    pub config: KnobConfig,
    store: Box<dyn SettingsStore>,
    pub wifi: WifiManager,
    pub internet: InternetProber,
    pub mqtt: MqttSession,
    pub tcp: ControlServer,
    pub server_link: ServerLink,
    pub inbox: Inbox,
}

impl ConnectivityServices {
    pub fn new(
        config: KnobConfig,
        store: Box<dyn SettingsStore>,
        radio: Box<dyn WifiRadio>,
        probe: Arc<dyn ReachabilityProbe>,
        transport: Box<dyn MqttTransport>,
        client_id: String,
    ) -> Self {
        let link = LinkState::new();
        let internet = InternetProber::new(link.clone(), probe);
        let wifi = WifiManager::new(radio, link, &config.device_name);
        let mqtt = MqttSession::new(transport, internet.clone(), client_id);

        Self {
            config,
            store,
            wifi,
            internet,
            mqtt,
            tcp: ControlServer::new(),
            server_link: ServerLink::new(),
            inbox: Inbox::new(),
        }
    }

    /// Brings up WiFi and the control server and loads the default broker
    /// profile. The broker connection itself is left to a background task.
    pub fn initialize(&mut self, tcp_addr: SocketAddr, now_ms: u64) {
        let before = self.config.wifi.last_connected_index;
        if self.wifi.initialize(&mut self.config, now_ms) {
            self.internet.check_internet_connectivity(now_ms);
        }
        self.persist_if_slot_changed(before);

        if let Err(err) = self.tcp.start(tcp_addr) {
            log::warn!("tcp control server failed to start on {tcp_addr}: {err}");
        }

        self.mqtt.initialize_mqtt(MqttProfile::Sound, &self.config);
        log::info!("connectivity initialized; mqtt connection will follow in background");
    }

    pub fn service(&mut self, subsystem: Subsystem, now_ms: u64) {
        match subsystem {
            Subsystem::Wifi => self.update_wifi(now_ms),
            Subsystem::Tcp => {
                let advertised = self.wifi.advertised_ip();
                self.tcp.update(advertised, &self.inbox);
            }
            Subsystem::Mqtt => self.mqtt.update(now_ms, &self.inbox, &self.config),
        }
    }

    fn update_wifi(&mut self, now_ms: u64) {
        let before = self.config.wifi.last_connected_index;
        match self.wifi.update(&mut self.config.wifi, now_ms) {
            Some(WifiEvent::Reconnected) => {
                self.internet.check_internet_connectivity(now_ms);
            }
            Some(WifiEvent::Disconnected) => self.internet.mark_unavailable(),
            None => self.internet.update(now_ms),
        }
        self.persist_if_slot_changed(before);
    }

    fn persist_if_slot_changed(&mut self, before: Option<usize>) {
        if self.config.wifi.last_connected_index != before {
            self.save_config();
        }
    }

    pub fn save_config(&mut self) -> bool {
        match self.store.save(&self.config) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("failed to save settings: {err:#}");
                false
            }
        }
    }

    pub fn connect_to_wifi(&mut self, now_ms: u64) -> bool {
        let before = self.config.wifi.last_connected_index;
        let connected = self.wifi.connect_to_wifi(&mut self.config.wifi);
        if connected {
            self.internet.check_internet_connectivity(now_ms);
        } else {
            self.internet.mark_unavailable();
        }
        self.persist_if_slot_changed(before);
        connected
    }

    pub fn start_ap_mode(&mut self) -> bool {
        self.wifi.start_ap_mode()
    }

    pub fn is_wifi_connected(&self) -> bool {
        self.wifi.is_wifi_connected()
    }

    pub fn is_ap_mode_active(&self) -> bool {
        self.wifi.is_ap_mode_active()
    }

    pub fn is_internet_available(&self) -> bool {
        self.internet.is_available()
    }

    pub fn wifi_signal_strength(&self) -> u8 {
        self.wifi.wifi_signal_strength()
    }

    pub fn send_tcp_response(&mut self, message: &str) -> bool {
        self.tcp.send_response(message)
    }

    pub fn send_mqtt_message(&self, topic: &str, payload: &str, now_ms: u64) -> bool {
        self.mqtt.send_mqtt_message(topic, payload, now_ms)
    }

    pub fn is_mqtt_connected(&self) -> bool {
        self.mqtt.is_mqtt_connected()
    }

    pub fn has_sound_mqtt_configured(&self) -> bool {
        mqtt::has_sound_mqtt_configured(&self.config)
    }

    pub fn has_light_mqtt_configured(&self) -> bool {
        mqtt::has_light_mqtt_configured(&self.config)
    }

    pub fn use_mqtt_profile(&mut self, profile: MqttProfile) -> bool {
        self.mqtt.initialize_mqtt(profile, &self.config)
    }

    pub fn connect_to_sound_server(&mut self) -> bool {
        let connected = self.wifi.is_wifi_connected();
        self.server_link.connect(&self.config.sound_server, connected)
    }

    pub fn connect_to_light_server(&mut self) -> bool {
        let connected = self.wifi.is_wifi_connected();
        self.server_link.connect(&self.config.light_server, connected)
    }

    pub fn status(&self, power_state: PowerState) -> ConnectivityStatus {
        ConnectivityStatus {
            station: self.wifi.station_status(),
            ap_active: self.wifi.is_ap_mode_active(),
            channel: self.wifi.channel(),
            station_ip: self.wifi.station_ip().map(|ip| ip.to_string()),
            ap_ip: self.wifi.access_point_ip().map(|ip| ip.to_string()),
            internet_available: self.internet.is_available(),
            mqtt_status: self.mqtt.status(),
            mqtt_profile: self.mqtt.profile(),
            tcp_client_connected: self.tcp.has_client(),
            signal_bars: self.wifi.wifi_signal_strength(),
            power_state,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::Ordering;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        internet::tests::ScriptedProbe,
        mqtt::{ConnectRejection, ConnectRequest, InboundMessage, TransportError},
        store::MemoryStore,
        types::StationStatus,
        wifi::tests::FakeRadio,
    };

    pub(crate) struct IdleTransport;

    impl MqttTransport for IdleTransport {
        fn connect(&mut self, _request: &ConnectRequest<'_>) -> Result<(), ConnectRejection> {
            Err(ConnectRejection::Unavailable)
        }

        fn is_connected(&self) -> bool {
            false
        }

        fn subscribe(&mut self, _topic: &str) -> Result<(), TransportError> {
            Ok(())
        }

        fn publish(&mut self, _topic: &str, _payload: &[u8]) -> Result<(), TransportError> {
            Err(TransportError("offline".to_string()))
        }

        fn poll(&mut self) -> Vec<InboundMessage> {
            Vec::new()
        }

        fn disconnect(&mut self) {}
    }

    pub(crate) fn services_with(
        config: KnobConfig,
        networks: &[(&str, &str, u8, i8)],
        reachable: bool,
    ) -> ConnectivityServices {
        ConnectivityServices::new(
            config,
            Box::new(MemoryStore::new()),
            Box::new(FakeRadio::new(networks)),
            ScriptedProbe::reachable(reachable),
            Box::new(IdleTransport),
            "ESP32-test-0000".to_string(),
        )
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn initialize_connects_and_probes_internet() {
        let mut config = KnobConfig::default();
        config.wifi.save_slot(0, "Home", "pw").unwrap();
        let mut services = services_with(config, &[("Home", "pw", 11, -60)], true);

        services.initialize(loopback(), 0);

        assert!(services.is_wifi_connected());
        assert!(services.is_internet_available());
        assert!(services.tcp.is_listening());
        let status = services.status(PowerState::Normal);
        assert_eq!(status.station, StationStatus::Connected);
        assert_eq!(status.channel, 11);
        assert_eq!(status.signal_bars, 2);
        assert!(services.internet.take_refresh_request());
    }

    #[test]
    fn internet_stays_unavailable_without_station() {
        let mut services = services_with(KnobConfig::default(), &[], true);
        services.initialize(loopback(), 0);

        for now in [0, 30_000, 60_000] {
            services.service(Subsystem::Wifi, now);
            assert!(!services.is_internet_available());
        }
        assert!(services.is_ap_mode_active());
    }

    #[test]
    fn scan_connect_persists_new_preferred_slot() {
        let mut config = KnobConfig::default();
        config.wifi.slots[1].ssid = "Office".to_string();
        config.wifi.slots[1].password = "o".to_string();
        let mut store = MemoryStore::new();
        store.save(&config).unwrap();
        let mut services = ConnectivityServices::new(
            config,
            Box::new(store),
            Box::new(FakeRadio::new(&[("Office", "o", 4, -50)])),
            ScriptedProbe::reachable(false),
            Box::new(IdleTransport),
            "id".to_string(),
        );

        assert!(services.connect_to_wifi(0));
        assert_eq!(services.config.wifi.last_connected_index, Some(1));
        assert!(!services.is_internet_available());
        assert_eq!(
            services.store.load().unwrap().wifi.last_connected_index,
            Some(1)
        );
    }

    #[test]
    fn sends_skip_while_offline() {
        let mut config = KnobConfig::default();
        config.sound_mqtt.broker_url = "broker.local".to_string();
        let probe = ScriptedProbe::reachable(false);
        let mut services = ConnectivityServices::new(
            config,
            Box::new(MemoryStore::new()),
            Box::new(FakeRadio::new(&[])),
            probe.clone(),
            Box::new(IdleTransport),
            "id".to_string(),
        );
        services.initialize(loopback(), 0);

        assert!(!services.send_mqtt_message("esp32/sound/setpoint", "1", 10));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        assert!(services.has_sound_mqtt_configured());
        assert!(!services.has_light_mqtt_configured());
    }
}
