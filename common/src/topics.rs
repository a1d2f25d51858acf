pub const TOPIC_LED_MODE: &str = "ledRing/modeControl";
pub const TOPIC_LED_CONFIGURE: &str = "esp32/ledRing/configure";
pub const TOPIC_LED_BRIGHTNESS: &str = "ledRing/brightnessControl";
pub const TOPIC_LED_COLOR: &str = "ledRing/colorControl";

pub const TOPIC_SOUND_CONTROL: &str = "esp32/sound/control";
pub const TOPIC_SOUND_GET_STATE: &str = "esp32/sound/get_state";
pub const TOPIC_SOUND_SETPOINT: &str = "esp32/sound/setpoint";
pub const TOPIC_SOUND_RESPONSE: &str = "esp32/sound/response";

/// Subscribed on every successful broker connection.
pub const SUBSCRIBE_TOPICS: [&str; 5] = [
    TOPIC_LED_MODE,
    TOPIC_LED_CONFIGURE,
    TOPIC_LED_BRIGHTNESS,
    TOPIC_LED_COLOR,
    TOPIC_SOUND_CONTROL,
];
