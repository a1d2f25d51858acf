use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, TryLockError,
    },
    thread,
    time::Duration,
};

use thiserror::Error;

use crate::{
    clock::Clock,
    config::KnobConfig,
    constants::{
        MQTT_BOOT_CONNECT_DELAY, MQTT_CONNECT_TIMEOUT, MQTT_MAX_PAYLOAD_BYTES,
        MQTT_MIN_SEND_SPACING_MS, MQTT_RECONNECT_DELAY_MS, TASK_STACK_SIZE,
    },
    inbox::{truncate_payload, Inbox},
    internet::InternetProber,
    topics::SUBSCRIBE_TOPICS,
    types::{Channel, MqttProfile, SessionStatus},
};

/// Broker rejection categories, numbered like the classic Arduino client
/// state codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectRejection {
    #[error("connection timeout")]
    Timeout,
    #[error("connection lost")]
    ConnectionLost,
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("disconnected")]
    Disconnected,
    #[error("bad protocol")]
    BadProtocol,
    #[error("bad client id")]
    BadClientId,
    #[error("server unavailable")]
    Unavailable,
    #[error("bad credentials")]
    BadCredentials,
    #[error("unauthorized")]
    Unauthorized,
}

impl ConnectRejection {
    pub fn code(&self) -> i8 {
        match self {
            Self::Timeout => -4,
            Self::ConnectionLost => -3,
            Self::ConnectFailed(_) => -2,
            Self::Disconnected => -1,
            Self::BadProtocol => 1,
            Self::BadClientId => 2,
            Self::Unavailable => 3,
            Self::BadCredentials => 4,
            Self::Unauthorized => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest<'a> {
    pub client_id: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// The MQTT packet engine. `connect` blocks for at most `request.timeout`;
/// `poll` never blocks.
pub trait MqttTransport: Send {
    fn connect(&mut self, request: &ConnectRequest<'_>) -> Result<(), ConnectRejection>;
    fn is_connected(&self) -> bool;
    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;
    fn poll(&mut self) -> Vec<InboundMessage>;
    fn disconnect(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Why the most recent connect attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    LinkDown,
    Rejected(ConnectRejection),
}

#[derive(Debug)]
struct SessionCore {
    target: Option<BrokerTarget>,
    profile: MqttProfile,
    status: SessionStatus,
    last_attempt_ms: Option<u64>,
    last_send_ms: Option<u64>,
    last_failure: Option<ConnectFailure>,
    initialized: bool,
    /// Bumped whenever the profile or target changes.
    generation: u64,
}

impl SessionCore {
    fn backoff_elapsed(&self, now_ms: u64) -> bool {
        match self.last_attempt_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= MQTT_RECONNECT_DELAY_MS,
        }
    }
}

struct SessionShared {
    core: Mutex<SessionCore>,
    transport: Mutex<Box<dyn MqttTransport>>,
    in_flight: AtomicBool,
    internet: InternetProber,
    client_id: String,
}

/// Cloneable handle to the one broker session of the device.
#[derive(Clone)]
pub struct MqttSession {
    shared: Arc<SessionShared>,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub fn client_id_for(device_name: &str, seed: u16) -> String {
    let prefix: String = device_name.chars().take(8).collect();
    format!("ESP32-{prefix}-{seed:04x}")
}

impl MqttSession {
    pub fn new(
        transport: Box<dyn MqttTransport>,
        internet: InternetProber,
        client_id: String,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                core: Mutex::new(SessionCore {
                    target: None,
                    profile: MqttProfile::Sound,
                    status: SessionStatus::Disconnected,
                    last_attempt_ms: None,
                    last_send_ms: None,
                    last_failure: None,
                    initialized: false,
                    generation: 0,
                }),
                transport: Mutex::new(transport),
                in_flight: AtomicBool::new(false),
                internet,
                client_id,
            }),
        }
    }

    fn core(&self) -> MutexGuard<'_, SessionCore> {
        self.shared
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Transport access for the loops; a connect in progress holds the
    /// transport, so loop callers skip instead of waiting.
    fn try_transport(&self) -> Option<MutexGuard<'_, Box<dyn MqttTransport>>> {
        match self.shared.transport.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Loads the broker target for `profile`. Does not connect.
    pub fn initialize_mqtt(&self, profile: MqttProfile, config: &KnobConfig) -> bool {
        let settings = config.mqtt_profile(profile);
        let mut core = self.core();
        let switching = core.profile != profile;
        core.profile = profile;

        let target = if !settings.is_configured() {
            log::warn!("{} mqtt broker url is empty", profile.as_str());
            None
        } else {
            match settings.validated_port() {
                Ok(port) => Some(BrokerTarget {
                    host: settings.broker_url.trim().to_string(),
                    port,
                    username: settings.username.clone(),
                    password: settings.password.clone(),
                }),
                Err(err) => {
                    log::warn!("{} mqtt configuration rejected: {err}", profile.as_str());
                    None
                }
            }
        };

        let changed = core.target != target || switching;
        core.target = target;
        if changed {
            core.generation = core.generation.wrapping_add(1);
        }
        let configured = core.target.is_some();
        drop(core);

        if changed {
            self.disconnect();
        }

        if let Some(target) = self.core().target.as_ref() {
            log::info!(
                "mqtt {} profile: broker {}:{} user `{}` (password {} chars)",
                profile.as_str(),
                target.host,
                target.port,
                target.username,
                target.password.len()
            );
        }
        configured
    }

    pub fn connect_to_mqtt_server(&self, now_ms: u64) -> bool {
        if self
            .shared
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::info!("mqtt connection attempt already in progress");
            return false;
        }
        let _in_flight = InFlight(&self.shared.in_flight);

        let (target, generation) = {
            let mut core = self.core();
            let Some(target) = core.target.clone() else {
                log::warn!("mqtt broker not configured; skipping connect");
                return false;
            };
            if !core.backoff_elapsed(now_ms) {
                log::debug!("mqtt connect skipped inside backoff window");
                return false;
            }
            core.last_attempt_ms = Some(now_ms);
            core.status = SessionStatus::Connecting;
            (target, core.generation)
        };

        log::info!("connecting to mqtt broker {}:{}", target.host, target.port);
        let request = ConnectRequest {
            client_id: &self.shared.client_id,
            host: &target.host,
            port: target.port,
            username: (!target.username.is_empty()).then_some(target.username.as_str()),
            password: (!target.password.is_empty()).then_some(target.password.as_str()),
            timeout: MQTT_CONNECT_TIMEOUT,
        };

        let mut transport = self
            .shared
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match transport.connect(&request) {
            Ok(()) => {
                for topic in SUBSCRIBE_TOPICS {
                    if let Err(err) = transport.subscribe(topic) {
                        log::warn!("mqtt subscribe to {topic} failed: {err}");
                    }
                }
                drop(transport);

                let mut core = self.core();
                if core.generation != generation {
                    drop(core);
                    log::info!(
                        "mqtt target changed during connect; dropping session to {}",
                        target.host
                    );
                    self.shared
                        .transport
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .disconnect();
                    let mut core = self.core();
                    core.status = SessionStatus::Disconnected;
                    core.last_attempt_ms = None;
                    return false;
                }
                core.status = SessionStatus::Connected;
                core.initialized = true;
                core.last_failure = None;
                log::info!("connected to mqtt broker; subscribed to {} topics", SUBSCRIBE_TOPICS.len());
                true
            }
            Err(rejection) => {
                drop(transport);
                let failure = if self.shared.internet.check_internet_connectivity(now_ms) {
                    log::warn!(
                        "mqtt broker rejected connection: {rejection} (state {})",
                        rejection.code()
                    );
                    ConnectFailure::Rejected(rejection)
                } else {
                    log::warn!("internet connectivity lost during mqtt connection attempt");
                    ConnectFailure::LinkDown
                };

                let mut core = self.core();
                core.status = SessionStatus::Disconnected;
                core.last_failure = Some(failure);
                false
            }
        }
    }

    /// Publishes unless offline, unconfigured, or inside the send spacing.
    /// Dropped sends are not retried.
    pub fn send_mqtt_message(&self, topic: &str, payload: &str, now_ms: u64) -> bool {
        if !self.shared.internet.is_available() || self.core().target.is_none() {
            log::info!("not sending mqtt message (no internet/broker) topic {topic}: {payload}");
            return false;
        }

        if payload.len() > MQTT_MAX_PAYLOAD_BYTES {
            log::warn!("mqtt message too long (max {MQTT_MAX_PAYLOAD_BYTES} bytes)");
            return false;
        }

        if let Some(last) = self.core().last_send_ms {
            if now_ms.saturating_sub(last) < MQTT_MIN_SEND_SPACING_MS {
                log::debug!("mqtt send to {topic} dropped by rate limit");
                return false;
            }
        }

        let Some(mut transport) = self.try_transport() else {
            log::debug!("mqtt transport busy; send to {topic} dropped");
            return false;
        };
        if !transport.is_connected() {
            log::warn!("mqtt client not connected; send to {topic} dropped");
            return false;
        }

        match transport.publish(topic, payload.as_bytes()) {
            Ok(()) => {
                drop(transport);
                self.core().last_send_ms = Some(now_ms);
                log::info!("sent mqtt message on [{topic}]: {payload}");
                true
            }
            Err(err) => {
                log::warn!("mqtt publish to {topic} failed: {err}");
                false
            }
        }
    }

    pub fn update(&self, now_ms: u64, inbox: &Inbox, config: &KnobConfig) {
        if self.shared.in_flight.load(Ordering::Acquire) {
            return;
        }

        if !self.shared.internet.is_available() {
            if self.transport_connected() {
                log::info!("internet connectivity lost, disconnecting mqtt");
                self.disconnect();
            }
            return;
        }

        let (has_target, profile, backoff_elapsed) = {
            let core = self.core();
            (core.target.is_some(), core.profile, core.backoff_elapsed(now_ms))
        };

        if !has_target {
            if backoff_elapsed {
                self.core().last_attempt_ms = Some(now_ms);
                self.initialize_mqtt(profile, config);
            }
            return;
        }

        if !self.transport_connected() {
            let mut core = self.core();
            if core.status == SessionStatus::Connected {
                log::warn!("mqtt session dropped");
                core.status = SessionStatus::Disconnected;
            }
            drop(core);

            if backoff_elapsed {
                log::info!("internet available, attempting periodic mqtt connection");
                self.connect_to_mqtt_server(now_ms);
            }
            return;
        }

        let messages = match self.try_transport() {
            Some(mut transport) => transport.poll(),
            None => return,
        };

        let channel = Channel::for_profile(profile);
        for message in messages {
            let text = String::from_utf8_lossy(&message.payload);
            let text = truncate_payload(&text);
            log::info!("received mqtt message on [{}]: {text}", message.topic);
            inbox.deliver(channel, text);
        }
    }

    fn transport_connected(&self) -> bool {
        match self.try_transport() {
            Some(transport) => transport.is_connected(),
            None => self.core().status == SessionStatus::Connected,
        }
    }

    pub fn disconnect(&self) {
        if let Some(mut transport) = self.try_transport() {
            if transport.is_connected() {
                transport.disconnect();
            }
        }
        self.core().status = SessionStatus::Disconnected;
    }

    pub fn is_mqtt_connected(&self) -> bool {
        self.shared.internet.is_available() && self.transport_connected()
    }

    pub fn status(&self) -> SessionStatus {
        self.core().status
    }

    pub fn profile(&self) -> MqttProfile {
        self.core().profile
    }

    pub fn target(&self) -> Option<BrokerTarget> {
        self.core().target.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.core().initialized
    }

    pub fn last_failure(&self) -> Option<ConnectFailure> {
        self.core().last_failure.clone()
    }

    pub fn is_connect_in_flight(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Runs the first broker connection on its own thread so neither loop
    /// stalls on it.
    pub fn spawn_initial_connect(
        &self,
        config: KnobConfig,
        clock: Clock,
    ) -> io::Result<thread::JoinHandle<bool>> {
        let session = self.clone();
        thread::Builder::new()
            .name("mqtt-connect".into())
            .stack_size(TASK_STACK_SIZE)
            .spawn(move || {
                thread::sleep(MQTT_BOOT_CONNECT_DELAY);
                log::info!("starting mqtt connection in background task");
                let profile = session.profile();
                if !session.initialize_mqtt(profile, &config) {
                    return false;
                }
                session.connect_to_mqtt_server(clock())
            })
    }
}

pub fn has_sound_mqtt_configured(config: &KnobConfig) -> bool {
    config.sound_mqtt.is_configured()
}

pub fn has_light_mqtt_configured(config: &KnobConfig) -> bool {
    config.light_mqtt.is_configured()
}
