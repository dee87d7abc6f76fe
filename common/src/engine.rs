use std::collections::HashMap;

use serde::Serialize;

use crate::{
    config::ControllerConfig,
    rules::RuleSet,
    types::{
        ControllerStatus, Device, DeviceAction, DeviceStates, LastAutoAction, RuleStatus,
        SensorSnapshot,
    },
};

/// Version of the optimistic device map an actuator exchange was started against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(u64);

impl Ticket {
    pub fn version(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuationOrigin {
    Automatic,
    Manual,
    EmergencyStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actuation {
    pub device: Device,
    pub state: bool,
    pub ticket: Ticket,
    pub origin: ActuationOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OverrideKind {
    /// Light switched back on shortly after the evaluator turned it off.
    LightGraceWindow,
    /// Manual control of a device whose rule is enabled.
    ActiveRule,
}

impl OverrideKind {
    pub fn message(self, device: Device) -> String {
        match self {
            Self::LightGraceWindow => "Auto mode was disabled because the light that was just \
                 switched off automatically was turned back on. Devices are now under manual control."
                .to_string(),
            Self::ActiveRule => format!(
                "Auto mode was disabled because {device} is under automatic control \
                 and was operated manually."
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManualControl {
    pub actuation: Actuation,
    /// Set when the request must switch auto mode off.
    pub override_kind: Option<OverrideKind>,
}

/// Latest optimistic write to one device.
#[derive(Debug, Clone, Copy)]
struct DeviceWrite {
    ticket: u64,
    pending: bool,
}

#[derive(Debug, Clone)]
pub struct AutoControlEngine {
    override_grace_ms: u64,
    devices: DeviceStates,
    version: u64,
    writes: HashMap<Device, DeviceWrite>,
    last_auto_action: Option<LastAutoAction>,
}

impl AutoControlEngine {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            override_grace_ms: config.override_grace_ms,
            devices: DeviceStates::default(),
            version: 0,
            writes: HashMap::new(),
            last_auto_action: None,
        }
    }

    pub fn devices(&self) -> DeviceStates {
        self.devices
    }

    pub fn last_auto_action(&self) -> Option<LastAutoAction> {
        self.last_auto_action
    }

    pub fn clear_last_auto_action(&mut self) {
        self.last_auto_action = None;
    }

    /// Ticket for an exchange that does not write optimistically, such as a status fetch.
    pub fn current_ticket(&self) -> Ticket {
        Ticket(self.version)
    }

    /// One evaluation pass over every rule. Devices already in their target
    /// state produce no actuation.
    pub fn evaluate(
        &mut self,
        rules: &RuleSet,
        auto_mode: bool,
        sensors: &SensorSnapshot,
        now_ms: u64,
    ) -> Vec<Actuation> {
        let mut actuations = Vec::new();
        if !auto_mode {
            return actuations;
        }

        self.expire_last_auto_action(now_ms);

        for (device, rule) in rules.iter() {
            let Some(target) = rule.target_state(sensors) else {
                continue;
            };
            if self.devices.get(device) == target {
                continue;
            }

            self.last_auto_action = Some(LastAutoAction {
                device,
                action: DeviceAction::from_state(target),
                at_ms: now_ms,
            });
            let ticket = self.begin_write(device, target);
            actuations.push(Actuation {
                device,
                state: target,
                ticket,
                origin: ActuationOrigin::Automatic,
            });
        }

        actuations
    }

    /// Applies the override policy for a user-initiated switch and writes the
    /// requested state optimistically.
    pub fn manual_control(
        &mut self,
        device: Device,
        desired: bool,
        rules: &RuleSet,
        auto_mode: bool,
        now_ms: u64,
    ) -> ManualControl {
        self.expire_last_auto_action(now_ms);

        let override_kind = if !auto_mode {
            None
        } else if device == Device::Light && desired && self.light_recently_auto_off(now_ms) {
            Some(OverrideKind::LightGraceWindow)
        } else if rules.is_enabled(device) {
            Some(OverrideKind::ActiveRule)
        } else {
            None
        };

        if override_kind.is_some() {
            self.last_auto_action = None;
        }

        let ticket = self.begin_write(device, desired);
        ManualControl {
            actuation: Actuation {
                device,
                state: desired,
                ticket,
                origin: ActuationOrigin::Manual,
            },
            override_kind,
        }
    }

    /// Optimistically switches every rule-driven device off.
    pub fn emergency_stop(&mut self) -> Vec<Actuation> {
        Device::AUTOMATABLE
            .into_iter()
            .map(|device| Actuation {
                device,
                state: false,
                ticket: self.begin_write(device, false),
                origin: ActuationOrigin::EmergencyStop,
            })
            .collect()
    }

    /// Adopts an authoritative device map. A device keeps its local value
    /// while its latest write is unresolved or newer than `ticket`.
    /// Returns whether every device was taken from `states`.
    pub fn reconcile(&mut self, ticket: Ticket, states: DeviceStates) -> bool {
        let mut applied_all = true;
        for device in Device::ALL {
            let fresh = match self.writes.get(&device) {
                Some(write) => !write.pending && write.ticket <= ticket.0,
                None => true,
            };
            if fresh {
                self.devices.set(device, states.get(device));
            } else {
                applied_all = false;
            }
        }
        applied_all
    }

    /// Resolves the exchange started by `actuation`, then reconciles the
    /// device map it returned. `None` means the call failed or was malformed.
    pub fn complete(&mut self, actuation: &Actuation, states: Option<DeviceStates>) -> bool {
        if let Some(write) = self.writes.get_mut(&actuation.device) {
            if write.ticket == actuation.ticket.0 {
                write.pending = false;
            }
        }
        match states {
            Some(states) => self.reconcile(actuation.ticket, states),
            None => false,
        }
    }

    pub fn has_pending_write(&self, device: Device) -> bool {
        self.writes
            .get(&device)
            .map(|write| write.pending)
            .unwrap_or(false)
    }

    pub fn status(
        &self,
        rules: &RuleSet,
        rules_version: u64,
        auto_mode: bool,
        sensors: &SensorSnapshot,
    ) -> ControllerStatus {
        let rule_status = rules
            .iter()
            .map(|(device, rule)| RuleStatus {
                device,
                enabled: rule.enabled,
                active: rule.is_active(sensors, auto_mode),
            })
            .collect();

        ControllerStatus {
            sensors: *sensors,
            devices: self.devices,
            auto_mode,
            rules: *rules,
            rules_version,
            rule_status,
            last_auto_action: self.last_auto_action,
            state_version: self.version,
        }
    }

    fn begin_write(&mut self, device: Device, state: bool) -> Ticket {
        self.version += 1;
        self.devices.set(device, state);
        self.writes.insert(
            device,
            DeviceWrite {
                ticket: self.version,
                pending: true,
            },
        );
        Ticket(self.version)
    }

    fn light_recently_auto_off(&self, now_ms: u64) -> bool {
        matches!(
            self.last_auto_action,
            Some(LastAutoAction {
                device: Device::Light,
                action: DeviceAction::Off,
                at_ms,
            }) if now_ms.saturating_sub(at_ms) < self.override_grace_ms
        )
    }

    fn expire_last_auto_action(&mut self, now_ms: u64) {
        if let Some(last) = self.last_auto_action {
            if now_ms.saturating_sub(last.at_ms) >= self.override_grace_ms {
                self.last_auto_action = None;
            }
        }
    }
}
