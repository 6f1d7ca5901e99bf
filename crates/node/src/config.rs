//! TOML config loading and validation for the greenhouse node.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

use greenhouse_control::controller::{LightSettings, MoistureSettings, TemperatureSettings};
use greenhouse_control::daynight::Schedule;
use greenhouse_control::roof::RoofSettings;
use greenhouse_control::sensor::ReaderSettings;
use greenhouse_control::telemetry::{QoS, ReporterSettings};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub sensors: SensorsConfig,
    pub actuators: ActuatorsConfig,
    pub controllers: ControllersConfig,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub logic: LogicConfig,
    #[serde(default)]
    pub logger: LoggerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorsConfig {
    pub light: AnalogSensorEntry,
    pub moisture: AnalogSensorEntry,
    pub temperature: ProbeEntry,
}

/// Analog probe on one ADS1115 channel.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalogSensorEntry {
    pub channel: u8,
    /// Voltage that reads as 100 %.
    pub max_voltage: f64,
    pub history_length: usize,
    pub decimals: u32,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

/// DS18B20 1-Wire temperature probe.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeEntry {
    pub history_length: usize,
    pub decimals: u32,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
    #[serde(default = "default_probe_delay_ms")]
    pub probe_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActuatorsConfig {
    pub pump_pin: u8,
    /// Many relay boards switch on a low level.
    #[serde(default)]
    pub pump_active_low: bool,
    pub light_pin: u8,
    #[serde(default)]
    pub heater_pin: Option<u8>,
    #[serde(default)]
    pub heartbeat_pin: Option<u8>,
    #[serde(default = "default_pwm_frequency_hz")]
    pub pwm_frequency_hz: f64,
    #[serde(default)]
    pub vent: Option<VentEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VentEntry {
    pub step_pin: u8,
    pub direction_pin: u8,
    pub sleep_pin: u8,
    pub brake_pin: u8,
    pub open_switch_pin: u8,
    pub close_switch_pin: u8,
    #[serde(default)]
    pub motion: RoofSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllersConfig {
    pub moisture: MoistureSettings,
    pub light: LightSettings,
    /// Needs `[actuators.vent]`.
    #[serde(default)]
    pub temperature: Option<TemperatureSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic: String,
    pub qos: QoS,
    pub keep_alive_secs: u64,
    pub interval_ms: u64,
    pub retry_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "greenhouse-node".into(),
            topic: "greenhouse/telemetry".into(),
            qos: QoS::AtLeastOnce,
            keep_alive_secs: 30,
            interval_ms: 5000,
            retry_secs: 5,
        }
    }
}

impl MqttConfig {
    pub fn reporter(&self) -> ReporterSettings {
        ReporterSettings {
            topic: self.topic.clone(),
            qos: self.qos,
            interval_ms: self.interval_ms,
            retry_secs: self.retry_secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogicConfig {
    pub interval_ms: u64,
    pub utc_offset_hours: i8,
}

impl Default for LogicConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            utc_offset_hours: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    /// The link is managed outside this process.
    #[default]
    Static,
    /// Drive the Wi-Fi interface through NetworkManager's `nmcli`.
    Nmcli,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub kind: LinkKind,
    pub interface: String,
    /// Saved NetworkManager connection to bring up.
    pub connection: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            kind: LinkKind::Static,
            interface: "wlan0".into(),
            connection: String::new(),
        }
    }
}

fn default_poll_ms() -> u64 {
    500
}

fn default_probe_attempts() -> u32 {
    10
}

fn default_probe_delay_ms() -> u64 {
    1000
}

fn default_pwm_frequency_hz() -> f64 {
    1000.0
}

impl AnalogSensorEntry {
    pub fn reader(&self) -> ReaderSettings {
        ReaderSettings {
            history_length: self.history_length,
            decimals: self.decimals,
            poll_ms: self.poll_ms,
        }
    }
}

impl ProbeEntry {
    pub fn reader(&self) -> ReaderSettings {
        ReaderSettings {
            history_length: self.history_length,
            decimals: self.decimals,
            poll_ms: self.poll_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and GPIO 28+ are not on the
/// header.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// ADS1115 single-ended inputs are AIN0-AIN3.
const MAX_ADC_CHANNEL: u8 = 3;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_sensors(&mut errors);
        self.validate_pins(&mut errors);
        self.validate_controllers(&mut errors);
        self.validate_runtime(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let mut seen_channels: HashSet<u8> = HashSet::new();

        for (name, s) in [
            ("light", &self.sensors.light),
            ("moisture", &self.sensors.moisture),
        ] {
            if s.channel > MAX_ADC_CHANNEL {
                errors.push(format!(
                    "sensor '{name}': channel {} out of range (0-{MAX_ADC_CHANNEL})",
                    s.channel
                ));
            } else if !seen_channels.insert(s.channel) {
                errors.push(format!(
                    "sensor '{name}': channel {} is already used by another sensor",
                    s.channel
                ));
            }
            if s.max_voltage <= 0.0 {
                errors.push(format!(
                    "sensor '{name}': max_voltage must be positive, got {}",
                    s.max_voltage
                ));
            }
            if s.history_length == 0 {
                errors.push(format!("sensor '{name}': history_length must be positive"));
            }
            if s.poll_ms == 0 {
                errors.push(format!("sensor '{name}': poll_ms must be positive"));
            }
        }

        let t = &self.sensors.temperature;
        if t.history_length == 0 {
            errors.push("sensor 'temperature': history_length must be positive".into());
        }
        if t.poll_ms == 0 {
            errors.push("sensor 'temperature': poll_ms must be positive".into());
        }
        if t.probe_attempts == 0 {
            errors.push("sensor 'temperature': probe_attempts must be positive".into());
        }
    }

    fn validate_pins(&self, errors: &mut Vec<String>) {
        let a = &self.actuators;
        let mut pins: Vec<(&str, u8)> = vec![("pump_pin", a.pump_pin), ("light_pin", a.light_pin)];
        if let Some(p) = a.heater_pin {
            pins.push(("heater_pin", p));
        }
        if let Some(p) = a.heartbeat_pin {
            pins.push(("heartbeat_pin", p));
        }
        if let Some(v) = &a.vent {
            pins.extend([
                ("vent.step_pin", v.step_pin),
                ("vent.direction_pin", v.direction_pin),
                ("vent.sleep_pin", v.sleep_pin),
                ("vent.brake_pin", v.brake_pin),
                ("vent.open_switch_pin", v.open_switch_pin),
                ("vent.close_switch_pin", v.close_switch_pin),
            ]);
            if v.motion.max_travel_steps == 0 {
                errors.push("actuators.vent: max_travel_steps must be positive".into());
            }
            if v.motion.burst_steps == 0 {
                errors.push("actuators.vent: burst_steps must be positive".into());
            }
        }

        let mut seen: HashSet<u8> = HashSet::new();
        for (name, pin) in pins {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "actuators.{name}: {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen.insert(pin) {
                errors.push(format!(
                    "actuators.{name}: pin {pin} is already used by another output"
                ));
            }
        }

        if a.pwm_frequency_hz <= 0.0 {
            errors.push(format!(
                "actuators: pwm_frequency_hz must be positive, got {}",
                a.pwm_frequency_hz
            ));
        }
    }

    fn validate_controllers(&self, errors: &mut Vec<String>) {
        let m = &self.controllers.moisture;
        for (field, v) in [
            ("low_threshold", m.low_threshold),
            ("high_threshold", m.high_threshold),
        ] {
            if !(0.0..=100.0).contains(&v) {
                errors.push(format!(
                    "controllers.moisture: {field} {v} out of range [0, 100]"
                ));
            }
        }
        if m.high_threshold <= m.low_threshold {
            errors.push(format!(
                "controllers.moisture: high_threshold ({}) must be greater than low_threshold ({})",
                m.high_threshold, m.low_threshold
            ));
        }
        if m.keep_on_secs == 0 {
            errors.push("controllers.moisture: keep_on_secs must be positive".into());
        }
        if m.max_cycles == Some(0) {
            errors.push("controllers.moisture: max_cycles must be positive when set".into());
        }

        let l = &self.controllers.light;
        if !(l.threshold > 0.0 && l.threshold <= 100.0) {
            errors.push(format!(
                "controllers.light: threshold {} out of range (0, 100]",
                l.threshold
            ));
        }

        if let Some(t) = &self.controllers.temperature {
            if t.max_threshold <= t.min_threshold {
                errors.push(format!(
                    "controllers.temperature: max_threshold ({}) must be greater than min_threshold ({})",
                    t.max_threshold, t.min_threshold
                ));
            }
            if t.hysteresis < 0.0 {
                errors.push(format!(
                    "controllers.temperature: hysteresis must not be negative, got {}",
                    t.hysteresis
                ));
            }
            if t.min_threshold + t.hysteresis >= t.max_threshold - t.hysteresis {
                errors.push(format!(
                    "controllers.temperature: heating target ({}) must stay below cooling target ({})",
                    t.min_threshold + t.hysteresis,
                    t.max_threshold - t.hysteresis
                ));
            }
            if t.inertia_secs == 0 {
                errors.push("controllers.temperature: inertia_secs must be positive".into());
            }
            if self.actuators.vent.is_none() {
                errors.push(
                    "controllers.temperature: requires an [actuators.vent] section".into(),
                );
            }
        }
    }

    fn validate_runtime(&self, errors: &mut Vec<String>) {
        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt: host is empty".into());
        }
        if self.mqtt.topic.trim().is_empty() {
            errors.push("mqtt: topic is empty".into());
        }
        if self.mqtt.interval_ms == 0 {
            errors.push("mqtt: interval_ms must be positive".into());
        }
        if self.mqtt.keep_alive_secs < 5 {
            errors.push(format!(
                "mqtt: keep_alive_secs must be at least 5, got {}",
                self.mqtt.keep_alive_secs
            ));
        }
        if self.logic.interval_ms == 0 {
            errors.push("logic: interval_ms must be positive".into());
        }
        if !(-12..=14).contains(&self.logic.utc_offset_hours) {
            errors.push(format!(
                "logic: utc_offset_hours {} out of range [-12, 14]",
                self.logic.utc_offset_hours
            ));
        }
        if self.logger.enabled && self.logger.interval_secs == 0 {
            errors.push("logger: interval_secs must be positive".into());
        }
        if matches!(self.network.kind, LinkKind::Nmcli) {
            if self.network.interface.trim().is_empty() {
                errors.push("network: interface is empty".into());
            }
            if self.network.connection.trim().is_empty() {
                errors.push("network: nmcli links need a connection name".into());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use greenhouse_control::controller::ControllerKind;
    use greenhouse_control::daynight::Phase;

    const MINIMAL: &str = r#"
[sensors.light]
channel = 0
max_voltage = 3.3
history_length = 5
decimals = 0

[sensors.moisture]
channel = 1
max_voltage = 3.3
history_length = 5
decimals = 0

[sensors.temperature]
history_length = 3
decimals = 1

[actuators]
pump_pin = 17
light_pin = 18

[controllers.moisture]
low_threshold = 30
high_threshold = 70
keep_on_secs = 5
irrigation_delay_secs = 60

[controllers.light]
threshold = 50
"#;

    fn valid_config() -> Config {
        parse(MINIMAL).unwrap()
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_minimal_config_fills_defaults() {
        let cfg = valid_config();
        assert_eq!(cfg.sensors.light.poll_ms, 500);
        assert_eq!(cfg.sensors.temperature.probe_attempts, 10);
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.mqtt.qos, QoS::AtLeastOnce);
        assert_eq!(cfg.logic.utc_offset_hours, 2);
        assert!(cfg.actuators.vent.is_none());
        assert!(cfg.controllers.temperature.is_none());
        assert_eq!(cfg.controllers.moisture.max_cycles, None);
        assert_eq!(
            cfg.schedule.enabling(Phase::Night, ControllerKind::Light),
            Some(false)
        );
    }

    #[test]
    fn parse_full_config() {
        let toml_str = format!(
            "{MINIMAL}{}",
            r#"
[actuators.vent]
step_pin = 5
direction_pin = 6
sleep_pin = 12
brake_pin = 16
open_switch_pin = 20
close_switch_pin = 21

[actuators.vent.motion]
max_travel_steps = 400

[controllers.temperature]
min_threshold = 18
max_threshold = 28
hysteresis = 1.5
inertia_secs = 120

[schedule]
day = { start = "07:00", end = "21:00" }
night = { start = "21:00", end = "07:00" }
morning = { start = "07:00", end = "12:00" }
afternoon = { start = "12:00", end = "18:00" }
evening = { start = "18:00", end = "24:00" }
rules = [
  { phase = "night", controller = "light", enabled = false },
  { phase = "night", controller = "moisture", enabled = false },
]

[mqtt]
host = "broker.local"
topic = "gh/1"
qos = 2

[network]
kind = "nmcli"
connection = "greenhouse-wifi"
"#
        );
        let cfg = parse(&toml_str).unwrap();
        let vent = cfg.actuators.vent.as_ref().unwrap();
        assert_eq!(vent.motion.max_travel_steps, 400);
        assert_eq!(vent.motion.burst_steps, 50);
        assert_eq!(cfg.mqtt.qos, QoS::ExactlyOnce);
        assert_eq!(cfg.mqtt.reporter().topic, "gh/1");
        assert!(matches!(cfg.network.kind, LinkKind::Nmcli));
        assert_eq!(
            cfg.schedule.enabling(Phase::Night, ControllerKind::Moisture),
            Some(false)
        );
        assert_eq!(
            cfg.schedule.enabling(Phase::Day, ControllerKind::Light),
            None
        );
    }

    #[test]
    fn shipped_config_is_valid() {
        let cfg = parse(include_str!("../../../config.toml")).unwrap();
        assert!(cfg.actuators.vent.is_some());
        assert!(cfg.controllers.temperature.is_some());
        assert!(cfg.actuators.pump_active_low);
    }

    #[test]
    fn invalid_qos_is_a_parse_error() {
        let toml_str = format!("{MINIMAL}\n[mqtt]\nqos = 3\n");
        assert!(parse(&toml_str).is_err());
    }

    #[test]
    fn missing_controller_section_is_a_parse_error() {
        let toml_str = MINIMAL.replace("[controllers.light]\nthreshold = 50\n", "");
        assert!(parse(&toml_str).is_err());
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn moisture_band_must_be_ordered() {
        let mut cfg = valid_config();
        cfg.controllers.moisture.low_threshold = 70.0;
        cfg.controllers.moisture.high_threshold = 70.0;
        assert_validation_err(
            &cfg,
            "high_threshold (70) must be greater than low_threshold (70)",
        );
    }

    #[test]
    fn moisture_threshold_out_of_range() {
        let mut cfg = valid_config();
        cfg.controllers.moisture.high_threshold = 120.0;
        assert_validation_err(&cfg, "high_threshold 120 out of range");
    }

    #[test]
    fn zero_cycle_limit_rejected() {
        let mut cfg = valid_config();
        cfg.controllers.moisture.max_cycles = Some(0);
        assert_validation_err(&cfg, "max_cycles");
    }

    #[test]
    fn light_threshold_zero_rejected() {
        let mut cfg = valid_config();
        cfg.controllers.light.threshold = 0.0;
        assert_validation_err(&cfg, "controllers.light: threshold");
    }

    #[test]
    fn duplicate_adc_channel_rejected() {
        let mut cfg = valid_config();
        cfg.sensors.moisture.channel = 0;
        assert_validation_err(&cfg, "channel 0 is already used");
    }

    #[test]
    fn adc_channel_out_of_range() {
        let mut cfg = valid_config();
        cfg.sensors.light.channel = 4;
        assert_validation_err(&cfg, "channel 4 out of range");
    }

    #[test]
    fn reserved_gpio_pin_rejected() {
        let mut cfg = valid_config();
        cfg.actuators.pump_pin = 1;
        assert_validation_err(&cfg, "actuators.pump_pin: 1 is not a valid BCM GPIO pin");
    }

    #[test]
    fn shared_gpio_pin_rejected() {
        let mut cfg = valid_config();
        cfg.actuators.heartbeat_pin = Some(18);
        assert_validation_err(&cfg, "actuators.heartbeat_pin: pin 18 is already used");
    }

    #[test]
    fn temperature_controller_needs_vent() {
        let mut cfg = valid_config();
        cfg.controllers.temperature = Some(TemperatureSettings {
            min_threshold: 18.0,
            max_threshold: 28.0,
            hysteresis: 1.0,
            inertia_secs: 60,
        });
        assert_validation_err(&cfg, "requires an [actuators.vent] section");
    }

    #[test]
    fn temperature_targets_must_not_cross() {
        let mut cfg = valid_config();
        cfg.controllers.temperature = Some(TemperatureSettings {
            min_threshold: 18.0,
            max_threshold: 20.0,
            hysteresis: 2.0,
            inertia_secs: 60,
        });
        assert_validation_err(
            &cfg,
            "heating target (20) must stay below cooling target (18)",
        );
    }

    #[test]
    fn utc_offset_out_of_range() {
        let mut cfg = valid_config();
        cfg.logic.utc_offset_hours = 20;
        assert_validation_err(&cfg, "utc_offset_hours 20");
    }

    #[test]
    fn nmcli_needs_connection_name() {
        let mut cfg = valid_config();
        cfg.network.kind = LinkKind::Nmcli;
        assert_validation_err(&cfg, "nmcli links need a connection name");
    }

    #[test]
    fn collects_all_errors() {
        let mut cfg = valid_config();
        cfg.sensors.light.history_length = 0;
        cfg.controllers.moisture.keep_on_secs = 0;
        cfg.mqtt.topic = " ".into();
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("3 errors"), "got: {msg}");
    }
}
