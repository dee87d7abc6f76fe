use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Condition, Device, DeviceAction, SensorChannel, SensorSnapshot};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("unknown sensor channel: {0}")]
    UnknownSensor(String),
    #[error("device {0} has no automatic control rule")]
    NotAutomatable(Device),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub enabled: bool,
    pub sensor: SensorChannel,
    pub condition: Condition,
    pub threshold: f64,
    pub action: DeviceAction,
}

impl Rule {
    /// Target state for the device, or `None` when the rule is disabled.
    ///
    /// A rule whose condition does not hold always drives its device off.
    pub fn target_state(&self, sensors: &SensorSnapshot) -> Option<bool> {
        if !self.enabled {
            return None;
        }
        Some(self.condition_holds(sensors) && self.action.is_on())
    }

    pub fn condition_holds(&self, sensors: &SensorSnapshot) -> bool {
        self.condition
            .holds(sensors.value(self.sensor), self.threshold)
    }

    pub fn is_active(&self, sensors: &SensorSnapshot, auto_mode: bool) -> bool {
        auto_mode && self.enabled && self.condition_holds(sensors)
    }
}

/// Valid threshold span and adjustment step for one device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl ThresholdRange {
    pub fn for_device(device: Device) -> Option<Self> {
        let (min, max, step) = match device {
            Device::Light => (100.0, 950.0, 50.0),
            Device::Fan => (350.0, 600.0, 50.0),
            Device::Water => (20.0, 60.0, 5.0),
            Device::Window => (20.0, 35.0, 1.0),
            Device::LightSensor => return None,
        };
        Some(Self { min, max, step })
    }

    pub fn clamp(&self, value: f64) -> f64 {
        if value.is_finite() {
            value.clamp(self.min, self.max)
        } else {
            self.min
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepDirection {
    Up,
    Down,
}

/// Partial rule update; absent fields keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RulePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor: Option<SensorChannel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<DeviceAction>,
}

impl RulePatch {
    pub fn apply_to(&self, rule: &mut Rule) {
        if let Some(enabled) = self.enabled {
            rule.enabled = enabled;
        }
        if let Some(sensor) = self.sensor {
            rule.sensor = sensor;
        }
        if let Some(condition) = self.condition {
            rule.condition = condition;
        }
        if let Some(threshold) = self.threshold {
            rule.threshold = threshold;
        }
        if let Some(action) = self.action {
            rule.action = action;
        }
    }
}

/// One rule per automatable device. The fixed fields keep the set complete.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub light: Rule,
    pub fan: Rule,
    pub water: Rule,
    pub window: Rule,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            light: Rule {
                enabled: true,
                sensor: SensorChannel::Light,
                condition: Condition::Above,
                threshold: 800.0,
                action: DeviceAction::On,
            },
            fan: Rule {
                enabled: true,
                sensor: SensorChannel::Co2,
                condition: Condition::Above,
                threshold: 450.0,
                action: DeviceAction::On,
            },
            water: Rule {
                enabled: true,
                sensor: SensorChannel::Soil,
                condition: Condition::Below,
                threshold: 40.0,
                action: DeviceAction::On,
            },
            window: Rule {
                enabled: true,
                sensor: SensorChannel::Temperature,
                condition: Condition::Above,
                threshold: 25.0,
                action: DeviceAction::On,
            },
        }
    }
}

impl RuleSet {
    pub fn get(&self, device: Device) -> Option<&Rule> {
        match device {
            Device::Light => Some(&self.light),
            Device::Fan => Some(&self.fan),
            Device::Water => Some(&self.water),
            Device::Window => Some(&self.window),
            Device::LightSensor => None,
        }
    }

    pub fn get_mut(&mut self, device: Device) -> Option<&mut Rule> {
        match device {
            Device::Light => Some(&mut self.light),
            Device::Fan => Some(&mut self.fan),
            Device::Water => Some(&mut self.water),
            Device::Window => Some(&mut self.window),
            Device::LightSensor => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Device, &Rule)> + '_ {
        Device::AUTOMATABLE
            .into_iter()
            .filter_map(move |device| self.get(device).map(|rule| (device, rule)))
    }

    pub fn is_enabled(&self, device: Device) -> bool {
        self.get(device).map(|rule| rule.enabled).unwrap_or(false)
    }

    /// Merges `patch` into the rule for `device`. Returns whether anything changed.
    pub fn apply_patch(&mut self, device: Device, patch: &RulePatch) -> Result<bool, RuleError> {
        let range = ThresholdRange::for_device(device).ok_or(RuleError::NotAutomatable(device))?;
        let rule = self
            .get_mut(device)
            .ok_or(RuleError::NotAutomatable(device))?;

        let before = *rule;
        patch.apply_to(rule);
        rule.threshold = range.clamp(rule.threshold);
        Ok(*rule != before)
    }

    pub fn nudge_threshold(
        &mut self,
        device: Device,
        direction: StepDirection,
    ) -> Result<bool, RuleError> {
        let range = ThresholdRange::for_device(device).ok_or(RuleError::NotAutomatable(device))?;
        let current = self
            .get(device)
            .ok_or(RuleError::NotAutomatable(device))?
            .threshold;

        let next = match direction {
            StepDirection::Up => current + range.step,
            StepDirection::Down => current - range.step,
        };
        self.apply_patch(
            device,
            &RulePatch {
                threshold: Some(next),
                ..RulePatch::default()
            },
        )
    }

    pub fn sanitize(&mut self) {
        for device in Device::AUTOMATABLE {
            let Some(range) = ThresholdRange::for_device(device) else {
                continue;
            };
            if let Some(rule) = self.get_mut(device) {
                rule.threshold = range.clamp(rule.threshold);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sensors(temperature: f64, co2: f64, soil: f64, light: f64) -> SensorSnapshot {
        SensorSnapshot {
            temperature,
            co2,
            soil,
            light,
            ..SensorSnapshot::default()
        }
    }

    #[test]
    fn patch_only_touches_named_device() {
        let mut rules = RuleSet::default();
        let changed = rules
            .apply_patch(
                Device::Fan,
                &RulePatch {
                    enabled: Some(false),
                    threshold: Some(500.0),
                    ..RulePatch::default()
                },
            )
            .unwrap();

        assert!(changed);
        assert_eq!(rules.fan.threshold, 500.0);
        assert!(!rules.fan.enabled);
        assert_eq!(rules.fan.sensor, SensorChannel::Co2);
        assert_eq!(rules.light, RuleSet::default().light);
        assert_eq!(rules.water, RuleSet::default().water);
        assert_eq!(rules.window, RuleSet::default().window);
    }

    #[test]
    fn patch_clamps_threshold_into_device_range() {
        let mut rules = RuleSet::default();
        rules
            .apply_patch(
                Device::Water,
                &RulePatch {
                    threshold: Some(95.0),
                    ..RulePatch::default()
                },
            )
            .unwrap();
        assert_eq!(rules.water.threshold, 60.0);

        rules
            .apply_patch(
                Device::Window,
                &RulePatch {
                    threshold: Some(f64::NAN),
                    ..RulePatch::default()
                },
            )
            .unwrap();
        assert_eq!(rules.window.threshold, 20.0);
    }

    #[test]
    fn identical_patch_reports_no_change() {
        let mut rules = RuleSet::default();
        let changed = rules
            .apply_patch(
                Device::Light,
                &RulePatch {
                    enabled: Some(true),
                    ..RulePatch::default()
                },
            )
            .unwrap();
        assert!(!changed);
    }

    #[test]
    fn light_sensor_has_no_rule() {
        let mut rules = RuleSet::default();
        assert_eq!(
            rules.apply_patch(Device::LightSensor, &RulePatch::default()),
            Err(RuleError::NotAutomatable(Device::LightSensor))
        );
        assert!(!rules.is_enabled(Device::LightSensor));
    }

    #[test]
    fn nudge_moves_by_device_step_and_stops_at_bounds() {
        let mut rules = RuleSet::default();

        rules.nudge_threshold(Device::Fan, StepDirection::Up).unwrap();
        assert_eq!(rules.fan.threshold, 500.0);

        rules.fan.threshold = 600.0;
        let changed = rules.nudge_threshold(Device::Fan, StepDirection::Up).unwrap();
        assert!(!changed);
        assert_eq!(rules.fan.threshold, 600.0);

        rules.nudge_threshold(Device::Window, StepDirection::Down).unwrap();
        assert_eq!(rules.window.threshold, 24.0);

        rules.light.threshold = 100.0;
        rules.nudge_threshold(Device::Light, StepDirection::Down).unwrap();
        assert_eq!(rules.light.threshold, 100.0);
    }

    #[test]
    fn sanitize_clamps_every_rule() {
        let mut rules = RuleSet::default();
        rules.light.threshold = 5_000.0;
        rules.fan.threshold = 0.0;
        rules.sanitize();

        assert_eq!(rules.light.threshold, 950.0);
        assert_eq!(rules.fan.threshold, 350.0);
    }

    #[test]
    fn condition_bounds_are_inclusive() {
        let above = Rule {
            enabled: true,
            sensor: SensorChannel::Co2,
            condition: Condition::Above,
            threshold: 450.0,
            action: DeviceAction::On,
        };
        assert_eq!(above.target_state(&sensors(25.0, 450.0, 46.0, 50.0)), Some(true));
        assert_eq!(above.target_state(&sensors(25.0, 449.9, 46.0, 50.0)), Some(false));

        let below = Rule {
            condition: Condition::Below,
            ..above
        };
        assert_eq!(below.target_state(&sensors(25.0, 450.0, 46.0, 50.0)), Some(true));
        assert_eq!(below.target_state(&sensors(25.0, 450.1, 46.0, 50.0)), Some(false));
    }

    #[test]
    fn off_action_never_turns_device_on() {
        let rule = Rule {
            enabled: true,
            sensor: SensorChannel::Soil,
            condition: Condition::Below,
            threshold: 40.0,
            action: DeviceAction::Off,
        };
        assert_eq!(rule.target_state(&sensors(25.0, 410.0, 30.0, 50.0)), Some(false));
        assert_eq!(rule.target_state(&sensors(25.0, 410.0, 50.0, 50.0)), Some(false));
    }

    #[test]
    fn disabled_rule_has_no_target_and_is_inactive() {
        let mut rules = RuleSet::default();
        rules.fan.enabled = false;
        let readings = sensors(25.0, 900.0, 46.0, 50.0);

        assert_eq!(rules.fan.target_state(&readings), None);
        assert!(!rules.fan.is_active(&readings, true));
        assert!(rules.window.is_active(&sensors(30.0, 410.0, 46.0, 50.0), true));
        assert!(!rules.window.is_active(&sensors(30.0, 410.0, 46.0, 50.0), false));
    }

    #[test]
    fn rule_set_serializes_every_device() {
        let value = serde_json::to_value(RuleSet::default()).unwrap();
        for device in Device::AUTOMATABLE {
            assert!(value.get(device.as_str()).is_some(), "{device} missing");
        }
        assert_eq!(value["water"]["condition"], "below");
        assert_eq!(value["fan"]["sensor"], "co2");
    }
}
