use std::{
    io::{BufRead, ErrorKind},
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, Incoming, MqttOptions, QoS};
use tokio::{runtime::Handle, sync::Notify, task::JoinHandle};
use tracing::{info, warn};

use knob_common::{
    config::StaticIpSettings,
    constants::{AP_EXPECTED_IP, TCP_SERVER_PORT},
    load_or_default,
    mqtt::{client_id_for, TransportError},
    system_clock, AccessPointConfig, Channel, ConnectRejection, ConnectRequest,
    ConnectivityConsole, ConnectivityServices, ConnectivityStatus, InboundMessage, Inbox,
    InternetProber, KnobConfig, LoopKind, MqttTransport, PowerControl, PowerManager, RadioError,
    ScanResult, Scheduler, SettingsStore, SharedContext, SleepMonitor, StoreError, TcpProbe,
    UiSurface, WifiRadio,
};

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut store = FileStore::new();
    let config = load_or_default(&mut store);
    let clock = system_clock();

    let client_id = client_id_for(&config.device_name, client_seed());
    let mut services = ConnectivityServices::new(
        config,
        Box::new(store),
        Box::new(SimulatedRadio::from_env()),
        Arc::new(TcpProbe::default()),
        Box::new(RumqttTransport::new(Handle::current())),
        client_id,
    );

    let tcp_port = std::env::var("KNOB_TCP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(TCP_SERVER_PORT);
    services.initialize(SocketAddr::from(([0, 0, 0, 0], tcp_port)), clock());

    let inbox = services.inbox.clone();
    let mqtt = services.mqtt.clone();
    let internet = services.internet.clone();
    let boot_config = services.config.clone();

    let halted = Arc::new(Notify::new());
    let power = PowerManager::new(Arc::new(HostPower {
        halted: halted.clone(),
    }));
    let console = ConnectivityConsole::new(Box::new(std::io::stdout())).with_power(power.clone());
    let scheduler = Scheduler::new(
        SharedContext {
            services,
            ui: Box::new(LogUi::default()),
            interpreter: Box::new(console),
        },
        power,
        clock.clone(),
    );

    let monitor = SleepMonitor::new(boot_config.power, clock());
    let handle = scheduler.start(monitor)?;

    if let Err(err) = mqtt.spawn_initial_connect(boot_config, clock) {
        warn!("failed to spawn mqtt connect task: {err}");
    }
    spawn_serial_reader(inbox)?;
    spawn_refresh_watch(internet);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("ctrl-c received, stopping loops");
        }
        _ = halted.notified() => info!("device entered deep sleep"),
    }

    handle.stop();
    tokio::task::spawn_blocking(move || handle.join()).await?;
    Ok(())
}

fn client_seed() -> u16 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| (elapsed.subsec_nanos() & 0xffff) as u16)
        .unwrap_or(0)
}

/// Stdin stands in for the serial console.
fn spawn_serial_reader(inbox: Inbox) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("serial-reader".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => inbox.deliver(Channel::Serial, &line),
                    Err(err) => {
                        warn!("stdin read failed: {err}");
                        break;
                    }
                }
            }
        })?;
    Ok(())
}

fn spawn_refresh_watch(internet: InternetProber) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            if internet.take_refresh_request() {
                info!("internet available; time and weather refresh requested");
            }
        }
    });
}

struct FileStore {
    path: PathBuf,
}

impl FileStore {
    fn new() -> Self {
        let data_dir = std::env::var("KNOB_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.knob"));
        Self {
            path: data_dir.join("settings.json"),
        }
    }
}

impl SettingsStore for FileStore {
    fn load(&self) -> Result<KnobConfig, StoreError> {
        match std::fs::read(&self.path) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(KnobConfig::default()),
            Err(err) => Err(StoreError::Backend(err.to_string())),
        }
    }

    fn save(&mut self, config: &KnobConfig) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| StoreError::Backend(err.to_string()))?;
        }
        let payload = serde_json::to_vec_pretty(config)?;
        std::fs::write(&self.path, payload).map_err(|err| StoreError::Backend(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SimNetwork {
    ssid: String,
    password: String,
    channel: u8,
    rssi: i8,
}

/// Parses `ssid:password:channel:rssi` entries separated by commas.
fn parse_sim_networks(raw: &str) -> Vec<SimNetwork> {
    raw.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .filter_map(|entry| {
            let fields: Vec<&str> = entry.trim().split(':').collect();
            let [ssid, password, channel, rssi] = fields[..] else {
                warn!("ignoring simulated network `{entry}`");
                return None;
            };
            match (channel.parse::<u8>(), rssi.parse::<i8>()) {
                (Ok(channel), Ok(rssi)) if (1..=13).contains(&channel) => Some(SimNetwork {
                    ssid: ssid.to_string(),
                    password: password.to_string(),
                    channel,
                    rssi,
                }),
                _ => {
                    warn!("ignoring simulated network `{entry}`");
                    None
                }
            }
        })
        .collect()
}

/// In-process radio: networks come from `KNOB_SIM_NETWORKS`.
struct SimulatedRadio {
    networks: Vec<SimNetwork>,
    access_point: Option<AccessPointConfig>,
    joined: Option<usize>,
    static_ip: Option<StaticIpSettings>,
}

impl SimulatedRadio {
    fn from_env() -> Self {
        let networks = std::env::var("KNOB_SIM_NETWORKS")
            .map(|raw| parse_sim_networks(&raw))
            .unwrap_or_default();
        info!("simulated radio with {} visible network(s)", networks.len());
        Self {
            networks,
            access_point: None,
            joined: None,
            static_ip: None,
        }
    }

    fn joined(&self) -> Option<&SimNetwork> {
        self.joined.and_then(|index| self.networks.get(index))
    }
}

impl WifiRadio for SimulatedRadio {
    fn start_access_point(&mut self, config: &AccessPointConfig) -> Result<(), RadioError> {
        info!(
            "simulated ap `{}` on channel {}",
            config.ssid, config.channel
        );
        self.access_point = Some(config.clone());
        Ok(())
    }

    fn stop_access_point(&mut self) {
        self.access_point = None;
    }

    fn access_point_ip(&self) -> Option<Ipv4Addr> {
        self.access_point.as_ref().map(|_| AP_EXPECTED_IP)
    }

    fn set_static_ip(&mut self, settings: Option<StaticIpSettings>) -> Result<(), RadioError> {
        self.static_ip = settings;
        Ok(())
    }

    fn associate(&mut self, ssid: &str, password: &str, _timeout: Duration) -> bool {
        self.joined = self
            .networks
            .iter()
            .position(|network| network.ssid == ssid && network.password == password);
        self.joined.is_some()
    }

    fn disconnect_station(&mut self) {
        self.joined = None;
    }

    fn is_station_connected(&self) -> bool {
        self.joined.is_some()
    }

    fn station_channel(&self) -> Option<u8> {
        self.joined().map(|network| network.channel)
    }

    fn station_ip(&self) -> Option<Ipv4Addr> {
        self.joined()?;
        Some(
            self.static_ip
                .as_ref()
                .map_or(Ipv4Addr::new(192, 168, 1, 50), |settings| settings.ip),
        )
    }

    fn rssi(&self) -> Option<i8> {
        self.joined().map(|network| network.rssi)
    }

    fn scan(&mut self) -> Vec<ScanResult> {
        self.networks
            .iter()
            .map(|network| ScanResult {
                ssid: network.ssid.clone(),
                channel: network.channel,
                rssi: network.rssi,
            })
            .collect()
    }
}

enum LinkEvent {
    ConnAck(Result<(), ConnectRejection>),
    Message(InboundMessage),
}

/// rumqttc client driven by a task on the tokio runtime. The event task
/// ends on the first connection error; the session decides when to retry.
struct RumqttTransport {
    runtime: Handle,
    client: Option<AsyncClient>,
    task: Option<JoinHandle<()>>,
    events: Option<Receiver<LinkEvent>>,
    pending: Vec<InboundMessage>,
    connected: Arc<AtomicBool>,
}

impl RumqttTransport {
    fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            client: None,
            task: None,
            events: None,
            pending: Vec::new(),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn teardown(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.try_disconnect();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.events = None;
        self.pending.clear();
        self.connected.store(false, Ordering::Release);
    }
}

fn map_connection_error(err: &ConnectionError) -> ConnectRejection {
    match err {
        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion => ConnectRejection::BadProtocol,
            ConnectReturnCode::BadClientId => ConnectRejection::BadClientId,
            ConnectReturnCode::ServiceUnavailable => ConnectRejection::Unavailable,
            ConnectReturnCode::BadUserNamePassword => ConnectRejection::BadCredentials,
            ConnectReturnCode::NotAuthorized => ConnectRejection::Unauthorized,
            ConnectReturnCode::Success => ConnectRejection::Disconnected,
        },
        ConnectionError::Io(io) => ConnectRejection::ConnectFailed(io.to_string()),
        other => ConnectRejection::ConnectFailed(other.to_string()),
    }
}

fn spawn_event_task(
    runtime: &Handle,
    mut eventloop: rumqttc::EventLoop,
    events: SyncSender<LinkEvent>,
    connected: Arc<AtomicBool>,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    connected.store(true, Ordering::Release);
                    let _ = events.try_send(LinkEvent::ConnAck(Ok(())));
                }
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    let inbound = InboundMessage {
                        topic: message.topic,
                        payload: message.payload.to_vec(),
                    };
                    if events.try_send(LinkEvent::Message(inbound)).is_err() {
                        warn!("mqtt inbound queue full; message dropped");
                    }
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    connected.store(false, Ordering::Release);
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    if connected.swap(false, Ordering::AcqRel) {
                        warn!("mqtt connection lost: {err}");
                    } else {
                        let _ = events.try_send(LinkEvent::ConnAck(Err(map_connection_error(&err))));
                    }
                    break;
                }
            }
        }
    })
}

impl MqttTransport for RumqttTransport {
    fn connect(&mut self, request: &ConnectRequest<'_>) -> Result<(), ConnectRejection> {
        self.teardown();

        let mut options = MqttOptions::new(request.client_id, request.host, request.port);
        options.set_keep_alive(Duration::from_secs(15));
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (request.username, request.password) {
            options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        let (events_tx, events_rx) = mpsc::sync_channel(64);
        self.task = Some(spawn_event_task(
            &self.runtime,
            eventloop,
            events_tx,
            self.connected.clone(),
        ));
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
        self.connected.load(Ordering::Acquire)
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| TransportError("not connected".into()))?;
        client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|err| TransportError(err.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| TransportError("not connected".into()))?;
        client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
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

/// Logs status changes in place of a display.
#[derive(Default)]
struct LogUi {
    last: Option<ConnectivityStatus>,
}

impl UiSurface for LogUi {
    fn update(&mut self, status: &ConnectivityStatus) {
        if self.last.as_ref() != Some(status) {
            match serde_json::to_string(status) {
                Ok(json) => info!("status {json}"),
                Err(err) => warn!("status not serializable: {err}"),
            }
            self.last = Some(status.clone());
        }
    }

    fn has_new_event(&mut self) -> bool {
        false
    }

    fn set_backlight(&mut self, on: bool) {
        info!("backlight {}", if on { "on" } else { "off" });
    }

    fn power_down(&mut self) {
        info!("display powered down");
    }
}

struct HostPower {
    halted: Arc<Notify>,
}

impl PowerControl for HostPower {
    fn register_loop(&self, kind: LoopKind) {
        info!("{} loop running", kind.as_str());
    }

    fn set_power_save(&self, enabled: bool) {
        info!("power save {}", if enabled { "enabled" } else { "disabled" });
    }

    fn enter_deep_sleep(&self, wake_pins: &[i32]) {
        info!("deep sleep; wake pins {wake_pins:?}");
        self.halted.notify_one();
    }
}
