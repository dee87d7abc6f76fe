use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::rules::{RuleError, RuleSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    #[serde(rename = "light")]
    Light,
    #[serde(rename = "fan")]
    Fan,
    #[serde(rename = "water")]
    Water,
    #[serde(rename = "window")]
    Window,
    #[serde(rename = "lightSensor")]
    LightSensor,
}

impl Device {
    /// Devices driven by rules, in evaluation order.
    pub const AUTOMATABLE: [Device; 4] = [Self::Light, Self::Fan, Self::Water, Self::Window];

    pub const ALL: [Device; 5] = [
        Self::Light,
        Self::Fan,
        Self::Water,
        Self::Window,
        Self::LightSensor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Fan => "fan",
            Self::Water => "water",
            Self::Window => "window",
            Self::LightSensor => "lightSensor",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = RuleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|device| device.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| RuleError::UnknownDevice(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorChannel {
    Temperature,
    Co2,
    Soil,
    Light,
}

impl SensorChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Co2 => "co2",
            Self::Soil => "soil",
            Self::Light => "light",
        }
    }
}

impl FromStr for SensorChannel {
    type Err = RuleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "temperature" => Ok(Self::Temperature),
            "co2" => Ok(Self::Co2),
            "soil" => Ok(Self::Soil),
            "light" => Ok(Self::Light),
            _ => Err(RuleError::UnknownSensor(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    Above,
    Below,
}

impl Condition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Above => "above",
            Self::Below => "below",
        }
    }

    /// Both bounds are inclusive.
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Above => value >= threshold,
            Self::Below => value <= threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAction {
    On,
    Off,
}

impl DeviceAction {
    pub fn from_state(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }
}

/// Last known on/off state of every device, as reported by the actuator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStates {
    pub light: bool,
    pub fan: bool,
    pub water: bool,
    pub window: bool,
    #[serde(rename = "lightSensor", default)]
    pub light_sensor: bool,
}

impl DeviceStates {
    pub fn get(&self, device: Device) -> bool {
        match device {
            Device::Light => self.light,
            Device::Fan => self.fan,
            Device::Water => self.water,
            Device::Window => self.window,
            Device::LightSensor => self.light_sensor,
        }
    }

    pub fn set(&mut self, device: Device, on: bool) {
        match device {
            Device::Light => self.light = on,
            Device::Fan => self.fan = on,
            Device::Water => self.water = on,
            Device::Window => self.window = on,
            Device::LightSensor => self.light_sensor = on,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub temperature: f64,
    pub humidity: f64,
    pub power: f64,
    pub soil: f64,
    pub co2: f64,
    pub light: f64,
}

impl Default for SensorSnapshot {
    fn default() -> Self {
        Self {
            temperature: 25.0,
            humidity: 61.0,
            power: 144.0,
            soil: 46.0,
            co2: 410.0,
            light: 50.0,
        }
    }
}

impl SensorSnapshot {
    pub fn value(&self, channel: SensorChannel) -> f64 {
        match channel {
            SensorChannel::Temperature => self.temperature,
            SensorChannel::Co2 => self.co2,
            SensorChannel::Soil => self.soil,
            SensorChannel::Light => self.light,
        }
    }
}

/// Body of `GET /api/status` on the greenhouse backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusPayload {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub power: Option<f64>,
    #[serde(default)]
    pub soil: Option<f64>,
    #[serde(default)]
    pub co2: Option<f64>,
    #[serde(default)]
    pub light: Option<f64>,
    #[serde(default)]
    pub devices: Option<DeviceStates>,
}

impl StatusPayload {
    pub fn snapshot(&self) -> SensorSnapshot {
        let defaults = SensorSnapshot::default();
        let pick = |value: Option<f64>, fallback: f64| {
            value.filter(|value| value.is_finite()).unwrap_or(fallback)
        };

        SensorSnapshot {
            temperature: pick(self.temperature, defaults.temperature),
            humidity: pick(self.humidity, defaults.humidity),
            power: pick(self.power, defaults.power),
            soil: pick(self.soil, defaults.soil),
            co2: pick(self.co2, defaults.co2),
            light: pick(self.light, defaults.light),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub device: Device,
    pub status: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub devices: Option<DeviceStates>,
}

impl ControlResponse {
    /// The full device map, or `None` when the response cannot be trusted.
    pub fn authoritative_states(&self) -> Option<DeviceStates> {
        if self.success {
            self.devices
        } else {
            None
        }
    }
}

/// Most recent state change made by the evaluator, kept for override detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LastAutoAction {
    pub device: Device,
    pub action: DeviceAction,
    #[serde(rename = "atMs")]
    pub at_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleStatus {
    pub device: Device,
    pub enabled: bool,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub sensors: SensorSnapshot,
    pub devices: DeviceStates,
    #[serde(rename = "autoMode")]
    pub auto_mode: bool,
    pub rules: RuleSet,
    #[serde(rename = "rulesVersion")]
    pub rules_version: u64,
    #[serde(rename = "ruleStatus")]
    pub rule_status: Vec<RuleStatus>,
    #[serde(rename = "lastAutoAction")]
    pub last_auto_action: Option<LastAutoAction>,
    #[serde(rename = "stateVersion")]
    pub state_version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_names_parse_case_insensitively() {
        assert_eq!("LightSensor".parse::<Device>().unwrap(), Device::LightSensor);
        assert_eq!(" fan ".parse::<Device>().unwrap(), Device::Fan);
        assert!("heater".parse::<Device>().is_err());
    }

    #[test]
    fn device_states_tolerate_missing_light_sensor() {
        let states: DeviceStates =
            serde_json::from_str(r#"{"light":true,"fan":false,"water":true,"window":false}"#)
                .unwrap();

        assert!(states.get(Device::Light));
        assert!(states.get(Device::Water));
        assert!(!states.get(Device::LightSensor));
    }

    #[test]
    fn device_states_require_rule_devices() {
        let parsed = serde_json::from_str::<DeviceStates>(r#"{"light":true,"fan":false}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn status_snapshot_falls_back_to_dashboard_defaults() {
        let status: StatusPayload =
            serde_json::from_str(r#"{"temperature":18.5,"co2":520}"#).unwrap();
        let snapshot = status.snapshot();

        assert_eq!(snapshot.temperature, 18.5);
        assert_eq!(snapshot.co2, 520.0);
        assert_eq!(snapshot.soil, 46.0);
        assert_eq!(snapshot.light, 50.0);
        assert!(status.devices.is_none());
    }

    #[test]
    fn unsuccessful_control_response_is_not_authoritative() {
        let response = ControlResponse {
            success: false,
            devices: Some(DeviceStates::default()),
        };
        assert!(response.authoritative_states().is_none());

        let partial: ControlResponse = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert!(partial.authoritative_states().is_none());
    }
}
