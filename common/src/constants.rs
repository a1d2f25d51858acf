use std::{net::Ipv4Addr, time::Duration};

pub const AP_PASSWORD: &str = "knobsetup";
pub const AP_FALLBACK_SSID: &str = "ESP32-Setup";
pub const AP_EXPECTED_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);

pub const WIFI_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const WIFI_CONNECT_POLL: Duration = Duration::from_millis(250);
pub const WIFI_SCAN_INTERVAL_MS: u64 = 60_000;
pub const AP_CHECK_INTERVAL_MS: u64 = 30_000;

pub const INTERNET_CHECK_INTERVAL_MS: u64 = 30_000;
pub const INTERNET_PROBE_HOST: &str = "8.8.8.8:53";
pub const INTERNET_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub const MQTT_RECONNECT_DELAY_MS: u64 = 5_000;
pub const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const MQTT_MIN_SEND_SPACING_MS: u64 = 100;
pub const MQTT_MAX_PAYLOAD_BYTES: usize = 255;
pub const MQTT_BOOT_CONNECT_DELAY: Duration = Duration::from_millis(100);

pub const TCP_SERVER_PORT: u16 = 23;
pub const TCP_MAX_LINES_PER_CYCLE: usize = 3;
pub const TCP_MAX_LINE_BYTES: usize = 512;
pub const SERVER_LINK_TIMEOUT: Duration = Duration::from_secs(5);

pub const LOCK_TIMEOUT: Duration = Duration::from_millis(10);
pub const DISPLAY_DELAY_NORMAL: Duration = Duration::from_millis(5);
pub const DISPLAY_DELAY_POWER_SAVE: Duration = Duration::from_millis(300);
pub const NETWORK_DELAY_NORMAL: Duration = Duration::from_millis(10);
pub const NETWORK_DELAY_POWER_SAVE: Duration = Duration::from_millis(250);

pub const TASK_STACK_SIZE: usize = 8192;
pub const DISPLAY_TASK_PRIORITY: u8 = 2;
pub const NETWORK_TASK_PRIORITY: u8 = 1;
pub const POWER_SAVE_TASK_PRIORITY: u8 = 1;
pub const DISPLAY_CORE: u8 = 0;
pub const NETWORK_CORE: u8 = 1;

pub const TOUCH_WAKE_PIN: i32 = 5;
pub const KNOB_WAKE_PIN: i32 = 16;
pub const WAKE_PINS: [i32; 2] = [TOUCH_WAKE_PIN, KNOB_WAKE_PIN];
