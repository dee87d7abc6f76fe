pub mod config;
pub mod engine;
pub mod rules;
pub mod topics;
pub mod types;

pub use config::{ControllerConfig, NetworkConfig, RuntimeConfig};
pub use engine::{
    Actuation, ActuationOrigin, AutoControlEngine, ManualControl, OverrideKind, Ticket,
};
pub use rules::{Rule, RuleError, RulePatch, RuleSet, StepDirection, ThresholdRange};
pub use topics::*;
pub use types::{
    Condition, ControlRequest, ControlResponse, ControllerStatus, Device, DeviceAction,
    DeviceStates, LastAutoAction, RuleStatus, SensorChannel, SensorSnapshot, StatusPayload,
};
