use core::convert::TryInto;
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    cpu::Core,
    gpio::{AnyIOPin, AnyOutputPin, Input, Output, PinDriver, Pull},
    task::thread::ThreadSpawnConfiguration,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, Subnet,
    },
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::EspWifi,
};
use log::{info, warn};

use knob_common::{
    config::StaticIpSettings,
    constants::{
        DISPLAY_CORE, DISPLAY_TASK_PRIORITY, NETWORK_CORE, NETWORK_TASK_PRIORITY,
        POWER_SAVE_TASK_PRIORITY, TASK_STACK_SIZE, TCP_SERVER_PORT, TOUCH_WAKE_PIN,
        WIFI_CONNECT_POLL,
    },
    load_or_default,
    mqtt::{client_id_for, TransportError},
    system_clock, AccessPointConfig, ConnectRejection, ConnectRequest, ConnectivityConsole,
    ConnectivityServices, ConnectivityStatus, InboundMessage, InternetProber, KnobConfig,
    LoopKind, MqttTransport, PowerControl, PowerManager, RadioError, ScanResult, Scheduler,
    SettingsStore, SharedContext, SleepMonitor, StoreError, TcpProbe, UiSurface, WifiRadio,
};

const NVS_NAMESPACE: &str = "knob";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const BACKLIGHT_PIN: Option<&str> = option_env!("KNOB_BACKLIGHT_PIN");

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let mut store = NvsStore {
        partition: nvs_partition.clone(),
    };
    let config = load_or_default(&mut store);
    info!(
        "NVS config loaded: device `{}`, {} wifi slot(s), static_ip={}",
        config.device_name,
        config.wifi.slots.iter().filter(|slot| slot.is_configured()).count(),
        config.wifi.static_ip.enabled,
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition)).context("wifi driver init failed")?;

    let clock = system_clock();
    let seed = unsafe { esp_idf_svc::sys::esp_random() } as u16;
    let client_id = client_id_for(&config.device_name, seed);
    let mut services = ConnectivityServices::new(
        config,
        Box::new(store),
        Box::new(EspRadio::new(wifi)),
        Arc::new(TcpProbe::default()),
        Box::new(EspMqttTransport::default()),
        client_id,
    );
    services.initialize(SocketAddr::from(([0, 0, 0, 0], TCP_SERVER_PORT)), clock());

    let mqtt = services.mqtt.clone();
    let internet = services.internet.clone();
    let boot_config = services.config.clone();

    let power = PowerManager::new(Arc::new(EspPower::default()));
    let console = ConnectivityConsole::new(Box::new(std::io::stdout())).with_power(power.clone());
    let scheduler = Scheduler::new(
        SharedContext {
            services,
            ui: Box::new(PanelUi::new()),
            interpreter: Box::new(console),
        },
        power,
        clock.clone(),
    );

    let monitor = SleepMonitor::new(boot_config.power, clock());
    let _handle = scheduler.start(monitor)?;
    if let Err(err) = ThreadSpawnConfiguration::default().set() {
        warn!("failed to reset thread spawn configuration: {err}");
    }

    if let Err(err) = mqtt.spawn_initial_connect(boot_config, clock) {
        warn!("failed to spawn mqtt connect task: {err}");
    }

    let mut sntp = None;
    loop {
        thread::sleep(Duration::from_secs(1));
        if sntp.is_none() && internet.take_refresh_request() {
            sntp = start_sntp(&internet);
        }
    }
}

fn start_sntp(internet: &InternetProber) -> Option<EspSntp<'static>> {
    match EspSntp::new_default() {
        Ok(sntp) => {
            info!("SNTP started (internet checked at {:?}ms)", internet.last_checked_ms());
            Some(sntp)
        }
        Err(err) => {
            warn!("failed to start SNTP: {err}");
            None
        }
    }
}

struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl NvsStore {
    fn open(&self) -> Result<EspNvs<esp_idf_svc::nvs::NvsDefault>, StoreError> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| StoreError::Backend(err.to_string()))
    }
}

impl SettingsStore for NvsStore {
    fn load(&self) -> Result<KnobConfig, StoreError> {
        let nvs = self.open()?;
        let mut buffer = vec![0_u8; 4096];
        match nvs
            .get_str(NVS_RUNTIME_KEY, &mut buffer)
            .map_err(|err| StoreError::Backend(err.to_string()))?
        {
            Some(value) => Ok(serde_json::from_str::<KnobConfig>(value)?),
            None => Ok(KnobConfig::default()),
        }
    }

    fn save(&mut self, config: &KnobConfig) -> Result<(), StoreError> {
        let mut nvs = self.open()?;
        let payload = serde_json::to_string(config)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)
            .map_err(|err| StoreError::Backend(err.to_string()))
    }
}

/// AP+STA radio over the IDF driver. The station is always configured
/// alongside the AP so associating never tears the AP down.
struct EspRadio {
    wifi: EspWifi<'static>,
    access_point: Option<AccessPointConfiguration>,
    client: ClientConfiguration,
    static_netif: bool,
}

impl EspRadio {
    fn new(wifi: EspWifi<'static>) -> Self {
        Self {
            wifi,
            access_point: None,
            client: ClientConfiguration::default(),
            static_netif: false,
        }
    }

    fn apply(&mut self) -> Result<(), RadioError> {
        let configuration = match &self.access_point {
            Some(ap) => Configuration::Mixed(self.client.clone(), ap.clone()),
            None => Configuration::Client(self.client.clone()),
        };
        self.wifi
            .set_configuration(&configuration)
            .map_err(|err| RadioError::new(format!("set_configuration: {err}")))?;
        if !self.wifi.is_started().unwrap_or(false) {
            self.wifi
                .start()
                .map_err(|err| RadioError::new(format!("start: {err}")))?;
        }
        Ok(())
    }

    fn ap_record() -> Option<esp_idf_svc::sys::wifi_ap_record_t> {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        (rc == esp_idf_svc::sys::ESP_OK).then_some(ap_info)
    }
}

fn static_netif(settings: &StaticIpSettings) -> Result<EspNetif, RadioError> {
    let mask = Mask::try_from(settings.subnet)
        .map_err(|_| RadioError::new(format!("invalid subnet mask: {}", settings.subnet)))?;
    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
            IpClientSettings {
                ip: settings.ip,
                subnet: Subnet {
                    gateway: settings.gateway,
                    mask,
                },
                dns: settings.dns1,
                secondary_dns: settings.dns2,
            },
        ))),
        ..NetifConfiguration::wifi_default_client()
    };
    EspNetif::new_with_conf(&conf).map_err(|err| RadioError::new(format!("netif: {err}")))
}

impl WifiRadio for EspRadio {
    fn start_access_point(&mut self, config: &AccessPointConfig) -> Result<(), RadioError> {
        self.access_point = Some(AccessPointConfiguration {
            ssid: config
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| RadioError::new("AP SSID too long"))?,
            password: config
                .password
                .as_str()
                .try_into()
                .map_err(|_| RadioError::new("AP password too long"))?,
            auth_method: AuthMethod::WPA2Personal,
            channel: config.channel,
            ..Default::default()
        });
        self.apply()
    }

    fn stop_access_point(&mut self) {
        self.access_point = None;
        if let Err(err) = self.apply() {
            warn!("failed to stop AP: {err}");
        }
    }

    fn access_point_ip(&self) -> Option<Ipv4Addr> {
        self.access_point.as_ref()?;
        self.wifi
            .ap_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip)
            .filter(|ip| !ip.is_unspecified())
    }

    fn set_static_ip(&mut self, settings: Option<StaticIpSettings>) -> Result<(), RadioError> {
        let netif = match settings.as_ref() {
            Some(settings) => static_netif(settings)?,
            None if self.static_netif => {
                EspNetif::new_with_conf(&NetifConfiguration::wifi_default_client())
                    .map_err(|err| RadioError::new(format!("netif: {err}")))?
            }
            None => return Ok(()),
        };
        self.wifi
            .swap_netif_sta(netif)
            .map_err(|err| RadioError::new(format!("swap_netif_sta: {err}")))?;
        self.static_netif = settings.is_some();
        Ok(())
    }

    fn associate(&mut self, ssid: &str, password: &str, timeout: Duration) -> bool {
        let (Ok(ssid_field), Ok(password_field)) = (ssid.try_into(), password.try_into()) else {
            warn!("wifi credentials for `{ssid}` exceed driver limits");
            return false;
        };
        self.client = ClientConfiguration {
            ssid: ssid_field,
            password: password_field,
            auth_method: if password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPAWPA2Personal
            },
            ..Default::default()
        };
        if let Err(err) = self.apply() {
            warn!("wifi configure failed: {err}");
            return false;
        }

        let _ = self.wifi.disconnect();
        if let Err(err) = self.wifi.connect() {
            warn!("wifi connect to `{ssid}` failed: {err}");
            return false;
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.wifi.is_up().unwrap_or(false) {
                return true;
            }
            thread::sleep(WIFI_CONNECT_POLL);
        }
        let _ = self.wifi.disconnect();
        false
    }

    fn disconnect_station(&mut self) {
        if let Err(err) = self.wifi.disconnect() {
            warn!("wifi disconnect failed: {err}");
        }
    }

    fn is_station_connected(&self) -> bool {
        Self::ap_record().is_some()
    }

    fn station_channel(&self) -> Option<u8> {
        Self::ap_record().map(|record| record.primary)
    }

    fn station_ip(&self) -> Option<Ipv4Addr> {
        self.wifi
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip)
            .filter(|ip| !ip.is_unspecified())
    }

    fn rssi(&self) -> Option<i8> {
        Self::ap_record().map(|record| record.rssi)
    }

    fn scan(&mut self) -> Vec<ScanResult> {
        match self.wifi.scan() {
            Ok(found) => found
                .into_iter()
                .map(|ap| ScanResult {
                    ssid: ap.ssid.to_string(),
                    channel: ap.channel,
                    rssi: ap.signal_strength,
                })
                .collect(),
            Err(err) => {
                warn!("wifi scan failed: {err}");
                Vec::new()
            }
        }
    }
}

enum LinkEvent {
    ConnAck(Result<(), ConnectRejection>),
    Message(InboundMessage),
}

#[derive(Default)]
struct EspMqttTransport {
    client: Option<EspMqttClient<'static>>,
    events: Option<Receiver<LinkEvent>>,
    pending: Vec<InboundMessage>,
    connected: Arc<AtomicBool>,
}

impl EspMqttTransport {
    fn teardown(&mut self) {
        // Dropping the client stops the IDF task and ends the receiver.
        self.client = None;
        self.events = None;
        self.pending.clear();
        self.connected.store(false, Ordering::Release);
    }
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    events: SyncSender<LinkEvent>,
    connected: Arc<AtomicBool>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(6 * 1024)
        .spawn(move || {
            while let Ok(event) = conn.next() {
                match event.payload() {
                    EventPayload::Connected(_) => {
                        connected.store(true, Ordering::Release);
                        let _ = events.try_send(LinkEvent::ConnAck(Ok(())));
                    }
                    EventPayload::Disconnected => {
                        connected.store(false, Ordering::Release);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => {
                        let inbound = InboundMessage {
                            topic: topic.to_string(),
                            payload: data.to_vec(),
                        };
                        if events.try_send(LinkEvent::Message(inbound)).is_err() {
                            warn!("mqtt inbound queue full; message dropped");
                        }
                    }
                    EventPayload::Error(err) => {
                        if !connected.load(Ordering::Acquire) {
                            let _ = events.try_send(LinkEvent::ConnAck(Err(
                                ConnectRejection::ConnectFailed(err.to_string()),
                            )));
                        }
                    }
                    _ => {}
                }
            }
            connected.store(false, Ordering::Release);
            info!("mqtt receiver stopped");
        })?;
    Ok(())
}

impl MqttTransport for EspMqttTransport {
    fn connect(&mut self, request: &ConnectRequest<'_>) -> Result<(), ConnectRejection> {
        self.teardown();

        let tls = matches!(request.port, 8883 | 8884);
        let url = format!(
            "{}://{}:{}",
            if tls { "mqtts" } else { "mqtt" },
            request.host,
            request.port
        );
        let conf = MqttClientConfiguration {
            client_id: Some(request.client_id),
            username: request.username,
            password: request.password,
            keep_alive_interval: Some(Duration::from_secs(15)),
            network_timeout: request.timeout,
            crt_bundle_attach: if tls {
                Some(esp_idf_svc::sys::esp_crt_bundle_attach)
            } else {
                None
            },
            ..Default::default()
        };

        let (client, conn) = EspMqttClient::new(url.as_str(), &conf)
            .map_err(|err| ConnectRejection::ConnectFailed(err.to_string()))?;
        let (events_tx, events_rx) = mpsc::sync_channel(16);
        spawn_mqtt_receiver(conn, events_tx, self.connected.clone())
            .map_err(|err| ConnectRejection::ConnectFailed(err.to_string()))?;
        self.client = Some(client);

        let outcome = loop {
            match events_rx.recv_timeout(request.timeout) {
                Ok(LinkEvent::ConnAck(result)) => break result,
                Ok(LinkEvent::Message(message)) => self.pending.push(message),
                Err(RecvTimeoutError::Timeout) => break Err(ConnectRejection::Timeout),
                Err(RecvTimeoutError::Disconnected) => break Err(ConnectRejection::ConnectionLost),
            }
        };

        match outcome {
            Ok(()) => {
                self.events = Some(events_rx);
                Ok(())
            }
            Err(rejection) => {
                self.teardown();
                Err(rejection)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::Acquire)
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| TransportError("not connected".into()))?;
        client
            .subscribe(topic, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(|err| TransportError(err.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| TransportError("not connected".into()))?;
        client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .map(|_| ())
            .map_err(|err| TransportError(err.to_string()))
    }

    fn poll(&mut self) -> Vec<InboundMessage> {
        let mut messages = std::mem::take(&mut self.pending);
        if let Some(events) = self.events.as_ref() {
            while let Ok(event) = events.try_recv() {
                if let LinkEvent::Message(message) = event {
                    messages.push(message);
                }
            }
        }
        messages
    }

    fn disconnect(&mut self) {
        self.teardown();
        info!("mqtt disconnected");
    }
}

/// Touch interrupt line plus an optional backlight pin; rendering itself
/// happens elsewhere.
struct PanelUi {
    touch: Option<PinDriver<'static, AnyIOPin, Input>>,
    touch_was_low: bool,
    backlight: Option<PinDriver<'static, AnyOutputPin, Output>>,
    last: Option<ConnectivityStatus>,
}

impl PanelUi {
    fn new() -> Self {
        let touch = match unsafe { PinDriver::input(AnyIOPin::new(TOUCH_WAKE_PIN)) } {
            Ok(mut pin) => {
                if let Err(err) = pin.set_pull(Pull::Up) {
                    warn!("touch line pull-up failed: {err}");
                }
                Some(pin)
            }
            Err(err) => {
                warn!("touch line unavailable on GPIO{TOUCH_WAKE_PIN}: {err}");
                None
            }
        };

        let backlight = BACKLIGHT_PIN
            .and_then(|raw| raw.parse::<i32>().ok())
            .and_then(|pin| match unsafe { PinDriver::output(AnyOutputPin::new(pin)) } {
                Ok(mut driver) => {
                    let _ = driver.set_high();
                    Some(driver)
                }
                Err(err) => {
                    warn!("backlight unavailable on GPIO{pin}: {err}");
                    None
                }
            });

        Self {
            touch,
            touch_was_low: false,
            backlight,
            last: None,
        }
    }
}

impl UiSurface for PanelUi {
    fn update(&mut self, status: &ConnectivityStatus) {
        if self.last.as_ref() != Some(status) {
            info!(
                "wifi {} ch{} bars {} internet {} mqtt {}",
                status.station.as_str(),
                status.channel,
                status.signal_bars,
                status.internet_available,
                status.mqtt_status.as_str()
            );
            self.last = Some(status.clone());
        }
    }

    fn has_new_event(&mut self) -> bool {
        let Some(touch) = self.touch.as_ref() else {
            return false;
        };
        let low = touch.is_low();
        let pressed = low && !self.touch_was_low;
        self.touch_was_low = low;
        pressed
    }

    fn set_backlight(&mut self, on: bool) {
        let Some(pin) = self.backlight.as_mut() else {
            return;
        };
        let result = if on { pin.set_high() } else { pin.set_low() };
        if let Err(err) = result {
            warn!("failed to drive backlight: {err}");
        }
    }

    fn power_down(&mut self) {
        self.set_backlight(false);
    }
}

/// FreeRTOS handles of the two loop tasks, stored as addresses.
#[derive(Default)]
struct EspPower {
    tasks: Mutex<[Option<usize>; 2]>,
}

fn loop_slot(kind: LoopKind) -> usize {
    match kind {
        LoopKind::Display => 0,
        LoopKind::Network => 1,
    }
}

fn normal_priority(kind: LoopKind) -> u8 {
    match kind {
        LoopKind::Display => DISPLAY_TASK_PRIORITY,
        LoopKind::Network => NETWORK_TASK_PRIORITY,
    }
}

impl PowerControl for EspPower {
    fn prepare_spawn(&self, kind: LoopKind) {
        let (name, core): (&'static [u8], u8) = match kind {
            LoopKind::Display => (b"display-loop\0", DISPLAY_CORE),
            LoopKind::Network => (b"network-loop\0", NETWORK_CORE),
        };
        let config = ThreadSpawnConfiguration {
            name: Some(name),
            stack_size: TASK_STACK_SIZE,
            priority: normal_priority(kind),
            pin_to_core: Some(if core == 0 { Core::Core0 } else { Core::Core1 }),
            ..Default::default()
        };
        if let Err(err) = config.set() {
            warn!("failed to set {} task placement: {err}", kind.as_str());
        }
    }

    fn register_loop(&self, kind: LoopKind) {
        let handle = unsafe { esp_idf_svc::sys::xTaskGetCurrentTaskHandle() };
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)[loop_slot(kind)] =
            Some(handle as usize);
        info!("{} loop running on core {:?}", kind.as_str(), esp_idf_hal::cpu::core());
    }

    fn set_power_save(&self, enabled: bool) {
        let tasks = *self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for kind in [LoopKind::Display, LoopKind::Network] {
            let Some(handle) = tasks[loop_slot(kind)] else {
                continue;
            };
            let priority = if enabled {
                POWER_SAVE_TASK_PRIORITY
            } else {
                normal_priority(kind)
            };
            unsafe {
                esp_idf_svc::sys::vTaskPrioritySet(
                    handle as esp_idf_svc::sys::TaskHandle_t,
                    u32::from(priority),
                )
            };
        }

        let mode = if enabled {
            esp_idf_svc::sys::wifi_ps_type_t_WIFI_PS_MIN_MODEM
        } else {
            esp_idf_svc::sys::wifi_ps_type_t_WIFI_PS_NONE
        };
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(mode) };
        if rc != esp_idf_svc::sys::ESP_OK {
            warn!("failed to change wifi power save: esp_err_t={rc}");
        }
        info!("power save {}", if enabled { "enabled" } else { "disabled" });
    }

    fn enter_deep_sleep(&self, wake_pins: &[i32]) {
        let mask = wake_pins.iter().fold(0_u64, |mask, pin| mask | (1_u64 << pin));
        unsafe {
            for &pin in wake_pins {
                esp_idf_svc::sys::rtc_gpio_init(pin);
                esp_idf_svc::sys::rtc_gpio_set_direction(
                    pin,
                    esp_idf_svc::sys::rtc_gpio_mode_t_RTC_GPIO_MODE_INPUT_ONLY,
                );
                esp_idf_svc::sys::rtc_gpio_pullup_en(pin);
                esp_idf_svc::sys::rtc_gpio_pulldown_dis(pin);
            }
            let rc = esp_idf_svc::sys::esp_sleep_enable_ext1_wakeup(
                mask,
                esp_idf_svc::sys::esp_sleep_ext1_wakeup_mode_t_ESP_EXT1_WAKEUP_ANY_LOW,
            );
            if rc != esp_idf_svc::sys::ESP_OK {
                warn!("ext1 wakeup setup failed: esp_err_t={rc}");
            }
        }
        info!("entering deep sleep");
        thread::sleep(Duration::from_millis(100));
        unsafe { esp_idf_svc::sys::esp_deep_sleep_start() };
    }
}
