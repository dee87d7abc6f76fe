//! In-memory fakes for the controller's external collaborators.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex,
};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use greenhouse_common::{ControlResponse, Device, DeviceStates, RuleSet, StatusPayload};

use crate::actuator::{Actuator, ActuatorError};
use crate::sync::{SettingsSync, SyncError};

/// Actuator that keeps its own device map and records every call.
#[derive(Default)]
pub struct FakeActuator {
    devices: Mutex<DeviceStates>,
    status: Mutex<StatusPayload>,
    calls: Mutex<Vec<(Device, bool)>>,
    fetches: AtomicUsize,
    failing: AtomicBool,
    malformed: AtomicBool,
    delay: Mutex<Option<Duration>>,
    delays: Mutex<VecDeque<Duration>>,
}

impl FakeActuator {
    pub fn with_devices(devices: DeviceStates) -> Self {
        Self {
            devices: Mutex::new(devices),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(Device, bool)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn devices(&self) -> DeviceStates {
        *self.devices.lock().unwrap()
    }

    pub fn set_status(&self, status: StatusPayload) {
        *self.status.lock().unwrap() = status;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_malformed(&self, malformed: bool) {
        self.malformed.store(malformed, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Delays only the next control call not yet claimed by an earlier push.
    pub fn push_delay(&self, delay: Duration) {
        self.delays.lock().unwrap().push_back(delay);
    }
}

#[async_trait]
impl Actuator for FakeActuator {
    async fn fetch_status(&self) -> Result<StatusPayload, ActuatorError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut status = self.status.lock().unwrap().clone();
        status.devices = Some(self.devices());
        Ok(status)
    }

    async fn control_device(
        &self,
        device: Device,
        desired: bool,
    ) -> Result<ControlResponse, ActuatorError> {
        self.calls.lock().unwrap().push((device, desired));

        let queued = self.delays.lock().unwrap().pop_front();
        let delay = queued.or(*self.delay.lock().unwrap());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(ActuatorError::Status(StatusCode::INTERNAL_SERVER_ERROR));
        }

        self.devices.lock().unwrap().set(device, desired);
        if self.malformed.load(Ordering::SeqCst) {
            return Ok(ControlResponse {
                success: true,
                devices: None,
            });
        }

        Ok(ControlResponse {
            success: true,
            devices: Some(self.devices()),
        })
    }
}

/// Settings sync that records what would have been persisted.
#[derive(Default)]
pub struct RecordingSync {
    rules: Mutex<Vec<RuleSet>>,
    auto_modes: Mutex<Vec<bool>>,
    failing: bool,
}

impl RecordingSync {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn persisted_rules(&self) -> Vec<RuleSet> {
        self.rules.lock().unwrap().clone()
    }

    pub fn persisted_auto_modes(&self) -> Vec<bool> {
        self.auto_modes.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), SyncError> {
        if self.failing {
            return Err(SyncError::Io(std::io::Error::other("settings backend offline")));
        }
        Ok(())
    }
}

#[async_trait]
impl SettingsSync for RecordingSync {
    async fn persist_rules(&self, rules: &RuleSet) -> Result<(), SyncError> {
        self.check()?;
        self.rules.lock().unwrap().push(*rules);
        Ok(())
    }

    async fn persist_auto_mode(&self, enabled: bool) -> Result<(), SyncError> {
        self.check()?;
        self.auto_modes.lock().unwrap().push(enabled);
        Ok(())
    }
}
