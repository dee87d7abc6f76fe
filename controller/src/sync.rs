use std::{io::ErrorKind, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use greenhouse_common::{RuleSet, RuntimeConfig, TOPIC_AUTO_MODE, TOPIC_AUTO_SETTINGS};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("settings serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("settings publish failed: {0}")]
    Publish(#[from] rumqttc::ClientError),
    #[error("settings file access failed: {0}")]
    Io(#[from] std::io::Error),
}

/// External persistence and broadcast of the shared auto-control settings.
#[async_trait]
pub trait SettingsSync: Send + Sync {
    async fn persist_rules(&self, rules: &RuleSet) -> Result<(), SyncError>;

    async fn persist_auto_mode(&self, enabled: bool) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsEnvelope {
    pub origin: String,
    pub rules: RuleSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoModeEnvelope {
    pub origin: String,
    pub enabled: bool,
}

#[derive(Clone)]
pub struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl AppStore {
    pub fn new() -> Self {
        let data_dir = std::env::var("GREENHOUSE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.greenhouse"));
        Self::at(data_dir)
    }

    pub fn at(data_dir: PathBuf) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn load_runtime_config(&self) -> Result<RuntimeConfig, SyncError> {
        let _guard = self.lock.lock().await;
        self.read_runtime().await
    }

    /// Read-modify-write of the runtime file under one lock.
    pub async fn update_runtime<F>(&self, update: F) -> Result<(), SyncError>
    where
        F: FnOnce(&mut RuntimeConfig) + Send,
    {
        let _guard = self.lock.lock().await;
        let mut runtime = self.read_runtime().await?;
        update(&mut runtime);

        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(&runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }

    async fn read_runtime(&self) -> Result<RuntimeConfig, SyncError> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Writes settings to the runtime file and publishes them retained over MQTT.
pub struct MqttSettingsSync {
    mqtt: AsyncClient,
    origin: String,
    store: AppStore,
}

impl MqttSettingsSync {
    pub fn new(mqtt: AsyncClient, origin: impl Into<String>, store: AppStore) -> Self {
        Self {
            mqtt,
            origin: origin.into(),
            store,
        }
    }
}

#[async_trait]
impl SettingsSync for MqttSettingsSync {
    async fn persist_rules(&self, rules: &RuleSet) -> Result<(), SyncError> {
        let rules = *rules;
        self.store
            .update_runtime(move |runtime| runtime.rules = rules)
            .await?;

        let payload = serde_json::to_vec(&SettingsEnvelope {
            origin: self.origin.clone(),
            rules,
        })?;
        self.mqtt
            .publish(TOPIC_AUTO_SETTINGS, QoS::AtLeastOnce, true, payload)
            .await?;
        Ok(())
    }

    async fn persist_auto_mode(&self, enabled: bool) -> Result<(), SyncError> {
        self.store
            .update_runtime(move |runtime| runtime.auto_mode = enabled)
            .await?;

        let payload = serde_json::to_vec(&AutoModeEnvelope {
            origin: self.origin.clone(),
            enabled,
        })?;
        self.mqtt
            .publish(TOPIC_AUTO_MODE, QoS::AtLeastOnce, true, payload)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("greenhouse-{name}-{}", std::process::id()))
    }

    #[tokio::test]
    async fn missing_runtime_file_loads_defaults() {
        let store = AppStore::at(temp_dir("missing"));
        let runtime = store.load_runtime_config().await.unwrap();

        assert!(!runtime.auto_mode);
        assert_eq!(runtime.rules, RuleSet::default());
    }

    #[tokio::test]
    async fn update_keeps_unrelated_fields() {
        let dir = temp_dir("update");
        let store = AppStore::at(dir.clone());

        store
            .update_runtime(|runtime| runtime.network.http_port = 9090)
            .await
            .unwrap();
        store
            .update_runtime(|runtime| runtime.auto_mode = true)
            .await
            .unwrap();

        let runtime = store.load_runtime_config().await.unwrap();
        assert!(runtime.auto_mode);
        assert_eq!(runtime.network.http_port, 9090);

        let _ = tokio::fs::remove_dir_all(dir).await;
    }
}
