use std::{
    sync::{Arc, OnceLock},
    time::Instant,
};

use chrono::Utc;
use serde::Serialize;
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, info, warn};

use greenhouse_common::{
    Actuation, AutoControlEngine, ControllerConfig, ControllerStatus, Device, DeviceStates,
    OverrideKind, SensorSnapshot, StatusPayload, Ticket,
};

use crate::{
    actuator::{Actuator, ActuatorError},
    store::RuleStore,
};

const NOTICE_CAPACITY: usize = 32;

/// User-facing notification that a manual switch turned auto mode off.
#[derive(Debug, Clone, Serialize)]
pub struct OverrideNotice {
    pub kind: OverrideKind,
    pub device: Device,
    pub message: String,
    #[serde(rename = "atEpoch")]
    pub at_epoch: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualControlOutcome {
    pub device: Device,
    pub state: bool,
    pub notice: Option<OverrideNotice>,
}

/// Runs the decision engine against the actuator: optimistic write, remote
/// call, then reconcile or resync.
pub struct AutoControlEvaluator {
    engine: Mutex<AutoControlEngine>,
    store: Arc<RuleStore>,
    actuator: Arc<dyn Actuator>,
    sensors: watch::Sender<SensorSnapshot>,
    notices: broadcast::Sender<OverrideNotice>,
    shutdown: watch::Sender<bool>,
}

impl AutoControlEvaluator {
    pub fn new(
        config: &ControllerConfig,
        store: Arc<RuleStore>,
        actuator: Arc<dyn Actuator>,
    ) -> Arc<Self> {
        let (sensors, _) = watch::channel(SensorSnapshot::default());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            engine: Mutex::new(AutoControlEngine::new(config)),
            store,
            actuator,
            sensors,
            notices,
            shutdown,
        })
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    /// Publishes a fresh snapshot. Every update triggers an evaluation pass,
    /// even when the readings did not change.
    pub fn update_sensors(&self, snapshot: SensorSnapshot) {
        self.sensors.send_replace(snapshot);
    }

    pub fn sensors(&self) -> SensorSnapshot {
        *self.sensors.borrow()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<OverrideNotice> {
        self.notices.subscribe()
    }

    pub async fn status(&self) -> ControllerStatus {
        let rules = self.store.rules();
        let auto_mode = self.store.get_auto_mode();
        let sensors = self.sensors();
        let engine = self.engine.lock().await;
        engine.status(&rules.value, rules.version, auto_mode, &sensors)
    }

    /// Evaluates every rule once and waits for the resulting actuator calls.
    /// Returns how many devices were switched.
    pub async fn run_pass(self: &Arc<Self>) -> usize {
        self.run_pass_at(monotonic_ms()).await
    }

    async fn run_pass_at(self: &Arc<Self>, now_ms: u64) -> usize {
        if self.is_shut_down() {
            return 0;
        }

        let actuations = {
            let mut engine = self.engine.lock().await;
            let rules = self.store.get_rules();
            let auto_mode = self.store.get_auto_mode();
            let sensors = self.sensors();

            let actuations = engine.evaluate(&rules, auto_mode, &sensors, now_ms);
            for actuation in &actuations {
                if let Some(rule) = rules.get(actuation.device) {
                    info!(
                        "auto control: {} {} ({} {} {} {})",
                        actuation.device,
                        on_off(actuation.state),
                        rule.sensor.as_str(),
                        sensors.value(rule.sensor),
                        rule.condition.as_str(),
                        rule.threshold
                    );
                }
            }
            actuations
        };

        let count = actuations.len();
        let mut calls = JoinSet::new();
        for actuation in actuations {
            let evaluator = Arc::clone(self);
            calls.spawn(async move { evaluator.actuate(actuation).await });
        }
        while calls.join_next().await.is_some() {}
        count
    }

    /// Applies the override policy, then switches the device.
    pub async fn manual_control(&self, device: Device, desired: bool) -> ManualControlOutcome {
        self.manual_control_at(device, desired, monotonic_ms()).await
    }

    async fn manual_control_at(
        &self,
        device: Device,
        desired: bool,
        now_ms: u64,
    ) -> ManualControlOutcome {
        let control = {
            let mut engine = self.engine.lock().await;
            let rules = self.store.get_rules();
            let auto_mode = self.store.get_auto_mode();
            let control = engine.manual_control(device, desired, &rules, auto_mode, now_ms);
            if control.override_kind.is_some() {
                self.store.publish_auto_mode(false);
            }
            control
        };

        let notice = match control.override_kind {
            Some(kind) => {
                self.store.persist_auto_mode().await;
                let notice = OverrideNotice {
                    kind,
                    device,
                    message: kind.message(device),
                    at_epoch: Utc::now().timestamp(),
                };
                warn!("{}", notice.message);
                let _ = self.notices.send(notice.clone());
                Some(notice)
            }
            None => None,
        };

        info!("manual control: {device} {}", on_off(desired));
        self.actuate(control.actuation).await;

        ManualControlOutcome {
            device,
            state: desired,
            notice,
        }
    }

    /// Switches auto mode through the store. Turning it off also forgets the
    /// last automatic action.
    pub async fn set_auto_mode(&self, enabled: bool) -> bool {
        let changed = self.store.set_auto_mode(enabled).await;
        if !enabled {
            self.engine.lock().await.clear_last_auto_action();
        }
        changed
    }

    /// Turns every rule-driven device off one call at a time, then
    /// resynchronises. Returns the devices whose call failed.
    pub async fn emergency_stop(&self) -> Vec<Device> {
        let actuations = self.engine.lock().await.emergency_stop();
        warn!("emergency stop: switching every automated device off");

        let mut failed = Vec::new();
        for actuation in actuations {
            match self
                .actuator
                .control_device(actuation.device, actuation.state)
                .await
            {
                Ok(response) => match response.authoritative_states() {
                    Some(states) => {
                        self.complete(&actuation, Some(states)).await;
                    }
                    None => {
                        warn!("emergency stop of {}: malformed response", actuation.device);
                        self.complete(&actuation, None).await;
                        failed.push(actuation.device);
                    }
                },
                Err(err) => {
                    warn!("emergency stop of {} failed: {err}", actuation.device);
                    self.complete(&actuation, None).await;
                    failed.push(actuation.device);
                }
            }
        }

        self.resync().await;
        failed
    }

    /// Fetches status, reconciles device states and publishes the readings.
    pub async fn refresh_status(&self) -> Result<(), ActuatorError> {
        let status = self.fetch_and_reconcile().await?;
        if !self.is_shut_down() {
            self.update_sensors(status.snapshot());
        }
        Ok(())
    }

    /// Starts the trigger loop: a pass per sensor update or rule change.
    /// Passes may overlap; stale reconciliations are discarded by version.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let evaluator = Arc::clone(self);
        let mut sensors = self.sensors.subscribe();
        let mut rules = self.store.watch_rules();
        let mut auto_mode = self.store.watch_auto_mode();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = sensors.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    changed = rules.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    changed = auto_mode.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let enabled = auto_mode.borrow_and_update().value;
                        if !enabled {
                            evaluator.engine.lock().await.clear_last_auto_action();
                            continue;
                        }
                    }
                    _ = shutdown.changed() => break,
                }

                if evaluator.is_shut_down() {
                    break;
                }
                let pass = Arc::clone(&evaluator);
                tokio::spawn(async move {
                    pass.run_pass().await;
                });
            }
            debug!("auto control trigger loop stopped");
        })
    }

    /// Stops the trigger loop; actuator responses arriving later are ignored.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn actuate(&self, actuation: Actuation) {
        let result = self
            .actuator
            .control_device(actuation.device, actuation.state)
            .await;

        if self.is_shut_down() {
            debug!("ignoring actuator response for {} after shutdown", actuation.device);
            return;
        }

        match result {
            Ok(response) => match response.authoritative_states() {
                Some(states) => {
                    self.complete(&actuation, Some(states)).await;
                }
                None => {
                    warn!(
                        "malformed actuator response for {}, resynchronising",
                        actuation.device
                    );
                    self.complete(&actuation, None).await;
                    self.resync().await;
                }
            },
            Err(err) => {
                warn!("actuator call for {} failed: {err}", actuation.device);
                self.complete(&actuation, None).await;
                self.resync().await;
            }
        }
    }

    async fn complete(&self, actuation: &Actuation, states: Option<DeviceStates>) {
        let carried_states = states.is_some();
        let mut engine = self.engine.lock().await;
        if !engine.complete(actuation, states) && carried_states {
            log_kept_devices(&engine, actuation.ticket);
        }
    }

    async fn reconcile(&self, ticket: Ticket, states: DeviceStates) {
        let mut engine = self.engine.lock().await;
        if !engine.reconcile(ticket, states) {
            log_kept_devices(&engine, ticket);
        }
    }

    // Device states only; publishing readings here would re-trigger the pass
    // that just failed.
    async fn resync(&self) {
        if let Err(err) = self.fetch_and_reconcile().await {
            warn!("status resync failed: {err}");
        }
    }

    async fn fetch_and_reconcile(&self) -> Result<StatusPayload, ActuatorError> {
        let ticket = self.engine.lock().await.current_ticket();
        let status = self.actuator.fetch_status().await?;

        if self.is_shut_down() {
            return Ok(status);
        }
        match status.devices {
            Some(devices) => {
                self.reconcile(ticket, devices).await;
            }
            None => warn!("actuator status carried no device states"),
        }
        Ok(status)
    }
}

fn log_kept_devices(engine: &AutoControlEngine, ticket: Ticket) {
    let pending: Vec<Device> = Device::ALL
        .into_iter()
        .filter(|device| engine.has_pending_write(*device))
        .collect();
    debug!(
        "device states from version {} are stale for some devices (pending: {pending:?})",
        ticket.version()
    );
}

fn on_off(state: bool) -> &'static str {
    if state {
        "on"
    } else {
        "off"
    }
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
