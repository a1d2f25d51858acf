use std::io::Write;

use crate::{
    config::CREDENTIAL_SLOTS,
    scheduler::{CommandInterpreter, PowerManager},
    services::ConnectivityServices,
    types::{Channel, MqttProfile, PowerState},
};

const HELP_HINT: &str = "Type 'help' for available commands";

const COMMANDS: &[(&str, &str)] = &[
    ("help", "Show available commands"),
    ("status", "Print the connectivity status as JSON"),
    (
        "connectWifi",
        "connectWifi:SSID:Password:Slot - Save and connect to Wi-Fi (slot 0-2)",
    ),
    ("clearWifi", "clearWifi:Slot - Clear a stored Wi-Fi slot"),
    ("showNetworks", "Show stored Wi-Fi networks"),
    (
        "configureSoundMQTT",
        "configureSoundMQTT:URL:Port:Username:Password - Configure the sound broker",
    ),
    (
        "configureLightMQTT",
        "configureLightMQTT:URL:Port:Username:Password - Configure the light broker",
    ),
    (
        "useMQTTProfile",
        "useMQTTProfile:sound|light - Switch the active broker profile",
    ),
    ("publish", "publish:topic:payload - Publish on the active broker"),
    ("connectSoundServer", "Connect to the configured sound server"),
    ("connectLightServer", "Connect to the configured light server"),
    ("sendData", "sendData:payload - Send to the connected server"),
    ("sleep", "Enter deep sleep now"),
];

/// Line-oriented interpreter for the connectivity commands arriving on the
/// serial console and the TCP control socket. Replies go back to the
/// channel the line arrived on.
pub struct ConnectivityConsole {
    serial: Box<dyn Write + Send>,
    power: Option<PowerManager>,
}

impl ConnectivityConsole {
    pub fn new(serial: Box<dyn Write + Send>) -> Self {
        Self {
            serial,
            power: None,
        }
    }

    /// Enables the `sleep` command and the power state in `status`.
    pub fn with_power(mut self, power: PowerManager) -> Self {
        self.power = Some(power);
        self
    }

    fn reply(&mut self, services: &mut ConnectivityServices, origin: Channel, line: &str) {
        match origin {
            Channel::Tcp => {
                services.send_tcp_response(line);
            }
            _ => {
                if let Err(err) = writeln!(self.serial, "{line}") {
                    log::warn!("serial reply failed: {err}");
                }
            }
        }
    }

    pub fn execute(
        &mut self,
        services: &mut ConnectivityServices,
        origin: Channel,
        line: &str,
        now_ms: u64,
    ) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let (name, params) = line.split_once(':').unwrap_or((line, ""));

        match name {
            "help" => {
                self.reply(services, origin, "Available commands:");
                for (_, description) in COMMANDS {
                    self.reply(services, origin, &format!("  {description}"));
                }
            }
            "status" => {
                let state = self
                    .power
                    .as_ref()
                    .map_or(PowerState::Normal, PowerManager::state);
                let reply = match serde_json::to_string(&services.status(state)) {
                    Ok(json) => json,
                    Err(err) => format!("[Error] status unavailable: {err}"),
                };
                self.reply(services, origin, &reply);
            }
            "connectWifi" => self.connect_wifi(services, origin, params, now_ms),
            "clearWifi" => {
                let reply = match params.trim().parse::<usize>() {
                    Ok(slot) => match services.config.wifi.clear_slot(slot) {
                        Ok(()) => {
                            services.save_config();
                            format!("[WiFi] Slot {slot} cleared")
                        }
                        Err(err) => format!("[Error] {err}"),
                    },
                    Err(_) => "[Error] Invalid format! Use: clearWifi:Slot".to_string(),
                };
                self.reply(services, origin, &reply);
            }
            "showNetworks" => {
                self.reply(services, origin, "Stored Wi-Fi networks:");
                let lines: Vec<String> = services
                    .config
                    .wifi
                    .slots
                    .iter()
                    .enumerate()
                    .map(|(index, slot)| {
                        let marker = if services.config.wifi.last_connected_index == Some(index) {
                            " (last)"
                        } else {
                            ""
                        };
                        format!("[Slot {index}] SSID: {}{marker}", slot.ssid)
                    })
                    .collect();
                for line in lines {
                    self.reply(services, origin, &line);
                }
            }
            "configureSoundMQTT" => {
                self.configure_mqtt(services, origin, MqttProfile::Sound, params)
            }
            "configureLightMQTT" => {
                self.configure_mqtt(services, origin, MqttProfile::Light, params)
            }
            "useMQTTProfile" => {
                let reply = match MqttProfile::parse(params.trim()) {
                    Some(profile) if services.use_mqtt_profile(profile) => {
                        format!("[MQTT] Using {} profile", profile.as_str())
                    }
                    Some(profile) => {
                        format!("[MQTT] {} profile is not configured", profile.as_str())
                    }
                    None => "[Error] Invalid profile! Use: useMQTTProfile:sound|light".to_string(),
                };
                self.reply(services, origin, &reply);
            }
            "publish" => {
                let reply = match params.split_once(':') {
                    Some((topic, payload)) if !topic.is_empty() => {
                        if services.send_mqtt_message(topic, payload, now_ms) {
                            format!("[MQTT] Published to {topic}")
                        } else {
                            format!("[MQTT] Publish to {topic} not sent")
                        }
                    }
                    _ => "[Error] Invalid format! Use: publish:topic:payload".to_string(),
                };
                self.reply(services, origin, &reply);
            }
            "connectSoundServer" | "connectLightServer" => {
                let connected = if name == "connectSoundServer" {
                    services.connect_to_sound_server()
                } else {
                    services.connect_to_light_server()
                };
                let reply = if connected {
                    "[Server] Connected"
                } else {
                    "[Server] Connection failed"
                };
                self.reply(services, origin, reply);
            }
            "sendData" => {
                let reply = if services.server_link.send_data(params) {
                    "[Server] Data sent"
                } else {
                    "[Server] Not connected"
                };
                self.reply(services, origin, reply);
            }
            "sleep" => match self.power.as_ref() {
                Some(power) => {
                    power.request_deep_sleep();
                    self.reply(services, origin, "[Power] Deep sleep requested");
                }
                None => self.unknown(services, origin, line),
            },
            _ => self.unknown(services, origin, line),
        }
    }

    fn unknown(&mut self, services: &mut ConnectivityServices, origin: Channel, line: &str) {
        log::warn!("unknown command from {origin:?}: {line}");
        self.reply(services, origin, &format!("[Error] Unknown command: {line}"));
        self.reply(services, origin, HELP_HINT);
    }

    fn connect_wifi(
        &mut self,
        services: &mut ConnectivityServices,
        origin: Channel,
        params: &str,
        now_ms: u64,
    ) {
        let (Some((ssid, rest)), Some((_, slot))) = (params.split_once(':'), params.rsplit_once(':'))
        else {
            self.reply(
                services,
                origin,
                "[WiFi] Invalid format! Use: connectWifi:SSID:Password:Slot",
            );
            return;
        };
        let Some((password, _)) = rest.rsplit_once(':') else {
            self.reply(
                services,
                origin,
                "[WiFi] Invalid format! Use: connectWifi:SSID:Password:Slot",
            );
            return;
        };

        let slot = match slot.trim().parse::<usize>() {
            Ok(slot) if slot < CREDENTIAL_SLOTS => slot,
            _ => {
                self.reply(
                    services,
                    origin,
                    "[WiFi] Invalid slot! Must be 0, 1, or 2. Defaulting to slot 1.",
                );
                1
            }
        };

        if let Err(err) = services.config.wifi.save_slot(slot, ssid, password) {
            self.reply(services, origin, &format!("[Error] {err}"));
            return;
        }
        services.save_config();
        self.reply(
            services,
            origin,
            &format!("[WiFi] Credentials saved to slot {slot}. Attempting connection..."),
        );

        let reply = if services.connect_to_wifi(now_ms) {
            match services.wifi.station_ip() {
                Some(ip) => format!("[WiFi] Connected. IP: {ip}"),
                None => "[WiFi] Connected".to_string(),
            }
        } else {
            "[WiFi] Connection failed".to_string()
        };
        self.reply(services, origin, &reply);
    }

    fn configure_mqtt(
        &mut self,
        services: &mut ConnectivityServices,
        origin: Channel,
        profile: MqttProfile,
        params: &str,
    ) {
        let fields: Vec<&str> = params.splitn(4, ':').collect();
        let [url, port, username, password] = fields[..] else {
            self.reply(
                services,
                origin,
                "[Error] Invalid format! Use: configureXMQTT:URL:Port:Username:Password",
            );
            return;
        };
        let port = match port.trim().parse::<u32>() {
            Ok(port) if (1..=u32::from(u16::MAX)).contains(&port) => port,
            _ => {
                self.reply(
                    services,
                    origin,
                    "[Error] Invalid port number. Must be between 1 and 65535.",
                );
                return;
            }
        };

        let settings = services.config.mqtt_profile_mut(profile);
        settings.broker_url = url.trim().to_string();
        settings.port = port;
        settings.username = username.to_string();
        settings.password = password.to_string();
        services.save_config();

        if services.mqtt.profile() == profile {
            services.use_mqtt_profile(profile);
        }
        self.reply(
            services,
            origin,
            &format!(
                "[Config] {} MQTT server configured: {}:{port} user `{username}`",
                profile.as_str(),
                url.trim()
            ),
        );
    }
}

impl CommandInterpreter for ConnectivityConsole {
    fn update(&mut self, services: &mut ConnectivityServices, now_ms: u64) {
        for origin in [Channel::Serial, Channel::Tcp] {
            if let Some(line) = services.inbox.take(origin) {
                self.execute(services, origin, &line, now_ms);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{config::KnobConfig, services::tests::services_with};

    #[derive(Clone, Default)]
    struct Transcript(Arc<Mutex<Vec<u8>>>);

    impl Write for Transcript {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Transcript {
        fn lines(&self) -> Vec<String> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    fn console() -> (ConnectivityConsole, Transcript) {
        let transcript = Transcript::default();
        (
            ConnectivityConsole::new(Box::new(transcript.clone())),
            transcript,
        )
    }

    #[test]
    fn unknown_command_reports_error_and_hint() {
        let (mut console, transcript) = console();
        let mut services = services_with(KnobConfig::default(), &[], false);

        console.execute(&mut services, Channel::Serial, "dance", 0);

        assert_eq!(
            transcript.lines(),
            vec![
                "[Error] Unknown command: dance".to_string(),
                HELP_HINT.to_string()
            ]
        );
    }

    #[test]
    fn connect_wifi_saves_slot_and_connects() {
        let (mut console, transcript) = console();
        let mut services = services_with(KnobConfig::default(), &[("Home", "pw:1", 6, -50)], true);

        console.execute(&mut services, Channel::Serial, "connectWifi:Home:pw:1:2", 0);

        assert_eq!(services.config.wifi.slots[2].ssid, "Home");
        assert_eq!(services.config.wifi.slots[2].password, "pw:1");
        assert_eq!(services.config.wifi.last_connected_index, Some(2));
        assert!(services.is_wifi_connected());
        assert!(transcript
            .lines()
            .last()
            .is_some_and(|line| line.starts_with("[WiFi] Connected")));
    }

    #[test]
    fn connect_wifi_out_of_range_slot_defaults_to_one() {
        let (mut console, _) = console();
        let mut services = services_with(KnobConfig::default(), &[], false);

        console.execute(&mut services, Channel::Serial, "connectWifi:Cafe:latte:9", 0);

        assert_eq!(services.config.wifi.slots[1].ssid, "Cafe");
        assert!(!services.is_wifi_connected());
    }

    #[test]
    fn configure_mqtt_rejects_bad_port() {
        let (mut console, transcript) = console();
        let mut services = services_with(KnobConfig::default(), &[], false);

        console.execute(
            &mut services,
            Channel::Serial,
            "configureLightMQTT:broker.local:70000:u:p",
            0,
        );
        assert!(!services.has_light_mqtt_configured());
        assert_eq!(
            transcript.lines(),
            vec!["[Error] Invalid port number. Must be between 1 and 65535.".to_string()]
        );

        console.execute(
            &mut services,
            Channel::Serial,
            "configureLightMQTT:broker.local:1883:u:p:w",
            0,
        );
        assert!(services.has_light_mqtt_configured());
        assert_eq!(services.config.light_mqtt.password, "p:w");
    }

    #[test]
    fn use_profile_switches_session() {
        let (mut console, _) = console();
        let mut config = KnobConfig::default();
        config.light_mqtt.broker_url = "light.local".to_string();
        let mut services = services_with(config, &[], false);

        console.execute(&mut services, Channel::Serial, "useMQTTProfile:light", 0);

        assert_eq!(services.mqtt.profile(), MqttProfile::Light);
        assert_eq!(
            services.mqtt.target().map(|target| target.host),
            Some("light.local".to_string())
        );
    }

    #[test]
    fn status_is_json_snapshot() {
        let (mut console, transcript) = console();
        let mut services = services_with(KnobConfig::default(), &[], false);

        console.execute(&mut services, Channel::Serial, "status", 0);

        let lines = transcript.lines();
        let value: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(value["internetAvailable"], serde_json::json!(false));
    }

    #[test]
    fn update_consumes_serial_slot_once() {
        let (mut console, transcript) = console();
        let mut services = services_with(KnobConfig::default(), &[], false);
        services.inbox.deliver(Channel::Serial, "clearWifi:0");

        console.update(&mut services, 0);
        console.update(&mut services, 1);

        assert_eq!(transcript.lines(), vec!["[WiFi] Slot 0 cleared".to_string()]);
    }

    #[test]
    fn sleep_without_power_manager_is_unknown() {
        let (mut console, transcript) = console();
        let mut services = services_with(KnobConfig::default(), &[], false);

        console.execute(&mut services, Channel::Serial, "sleep", 0);

        assert_eq!(transcript.lines()[0], "[Error] Unknown command: sleep");
    }
}
