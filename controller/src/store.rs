use std::sync::Arc;

use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

use greenhouse_common::{Device, RuleError, RulePatch, RuleSet, StepDirection};

use crate::sync::SettingsSync;

/// Immutable snapshot tagged with the mutation count that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Delivery handle for a callback subscription; dropping it unsubscribes.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Process-wide owner of the rule set and the auto-mode flag.
pub struct RuleStore {
    rules: watch::Sender<Versioned<RuleSet>>,
    auto_mode: watch::Sender<Versioned<bool>>,
    sync: Arc<dyn SettingsSync>,
}

impl RuleStore {
    pub fn new(mut rules: RuleSet, auto_mode: bool, sync: Arc<dyn SettingsSync>) -> Self {
        rules.sanitize();
        let (rules, _) = watch::channel(Versioned {
            version: 0,
            value: rules,
        });
        let (auto_mode, _) = watch::channel(Versioned {
            version: 0,
            value: auto_mode,
        });

        Self {
            rules,
            auto_mode,
            sync,
        }
    }

    pub fn rules(&self) -> Versioned<RuleSet> {
        *self.rules.borrow()
    }

    pub fn get_rules(&self) -> RuleSet {
        self.rules.borrow().value
    }

    pub fn auto_mode(&self) -> Versioned<bool> {
        *self.auto_mode.borrow()
    }

    pub fn get_auto_mode(&self) -> bool {
        self.auto_mode.borrow().value
    }

    pub async fn set_rule(&self, device: Device, patch: RulePatch) -> Result<RuleSet, RuleError> {
        self.update_rules(|rules| rules.apply_patch(device, &patch))
            .await
    }

    pub async fn nudge_threshold(
        &self,
        device: Device,
        direction: StepDirection,
    ) -> Result<RuleSet, RuleError> {
        self.update_rules(|rules| rules.nudge_threshold(device, direction))
            .await
    }

    /// Switches auto mode and persists the change. Returns whether it changed.
    pub async fn set_auto_mode(&self, enabled: bool) -> bool {
        let changed = self.publish_auto_mode(enabled);
        if changed {
            self.persist_auto_mode().await;
        }
        changed
    }

    /// Broadcasts a new auto-mode value without persisting it.
    pub fn publish_auto_mode(&self, enabled: bool) -> bool {
        let changed = self.auto_mode.send_if_modified(|current| {
            if current.value == enabled {
                return false;
            }
            *current = Versioned {
                version: current.version + 1,
                value: enabled,
            };
            true
        });
        if changed {
            info!("auto mode {}", if enabled { "enabled" } else { "disabled" });
        }
        changed
    }

    pub async fn persist_auto_mode(&self) {
        let enabled = self.get_auto_mode();
        if let Err(err) = self.sync.persist_auto_mode(enabled).await {
            warn!("failed to persist auto mode: {err}");
        }
    }

    /// Adopts a rule set received from the settings channel.
    pub fn reconcile_rules(&self, mut remote: RuleSet) -> bool {
        remote.sanitize();
        self.rules.send_if_modified(|current| {
            if current.value == remote {
                return false;
            }
            *current = Versioned {
                version: current.version + 1,
                value: remote,
            };
            true
        })
    }

    /// Adopts an auto-mode value received from the settings channel.
    pub fn reconcile_auto_mode(&self, enabled: bool) -> bool {
        self.publish_auto_mode(enabled)
    }

    pub fn watch_rules(&self) -> watch::Receiver<Versioned<RuleSet>> {
        self.rules.subscribe()
    }

    pub fn watch_auto_mode(&self) -> watch::Receiver<Versioned<bool>> {
        self.auto_mode.subscribe()
    }

    /// Calls `callback` with the current rules right away, then on every change.
    pub fn subscribe_rules<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(Versioned<RuleSet>) + Send + 'static,
    {
        spawn_subscription(self.rules.subscribe(), callback)
    }

    /// Calls `callback` with the current flag right away, then on every change.
    pub fn subscribe_auto_mode<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(Versioned<bool>) + Send + 'static,
    {
        spawn_subscription(self.auto_mode.subscribe(), callback)
    }

    async fn update_rules<F>(&self, update: F) -> Result<RuleSet, RuleError>
    where
        F: FnOnce(&mut RuleSet) -> Result<bool, RuleError>,
    {
        let mut outcome = Ok(false);
        self.rules.send_if_modified(|current| {
            let mut next = current.value;
            outcome = update(&mut next);
            if !matches!(outcome, Ok(true)) {
                return false;
            }
            *current = Versioned {
                version: current.version + 1,
                value: next,
            };
            true
        });

        let rules = self.get_rules();
        if outcome? {
            if let Err(err) = self.sync.persist_rules(&rules).await {
                warn!("failed to persist auto control rules: {err}");
            }
        }
        Ok(rules)
    }
}

fn spawn_subscription<T, F>(mut receiver: watch::Receiver<T>, mut callback: F) -> Subscription
where
    T: Clone + Send + Sync + 'static,
    F: FnMut(T) + Send + 'static,
{
    let task = tokio::spawn(async move {
        loop {
            let value = receiver.borrow_and_update().clone();
            callback(value);
            if receiver.changed().await.is_err() {
                break;
            }
        }
    });
    Subscription { task }
}
