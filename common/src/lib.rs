pub mod clock;
pub mod config;
pub mod console;
pub mod constants;
pub mod inbox;
pub mod internet;
pub mod mqtt;
pub mod scheduler;
pub mod services;
pub mod sleep;
pub mod store;
pub mod tcp;
pub mod topics;
pub mod types;
pub mod wifi;

pub use clock::{monotonic_ms, system_clock, Clock};
pub use config::{ConfigError, KnobConfig, MqttProfileConfig, PowerConfig, WifiConfig};
pub use console::ConnectivityConsole;
pub use inbox::Inbox;
pub use internet::{InternetProber, ReachabilityProbe, TcpProbe};
pub use mqtt::{ConnectRejection, ConnectRequest, InboundMessage, MqttSession, MqttTransport};
pub use scheduler::{
    CommandInterpreter, PowerControl, PowerManager, Scheduler, SchedulerHandle, SharedContext,
    UiSurface,
};
pub use services::{ConnectivityServices, Subsystem};
pub use sleep::{PowerTransition, SleepMonitor};
pub use store::{load_or_default, SettingsStore, StoreError};
pub use topics::*;
pub use types::{
    Channel, ConnectivityStatus, LoopKind, MqttProfile, PowerState, SessionStatus, StationStatus,
};
pub use wifi::{AccessPointConfig, RadioError, ScanResult, WifiManager, WifiRadio};
