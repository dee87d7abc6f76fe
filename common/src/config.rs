use serde::{Deserialize, Serialize};

use crate::rules::RuleSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub poll_interval_ms: u64,
    pub override_grace_ms: u64,
    pub state_publish_interval_ms: u64,
    pub actuator_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30_000,
            override_grace_ms: 30_000,
            state_publish_interval_ms: 10_000,
            actuator_timeout_ms: 10_000,
        }
    }
}

impl ControllerConfig {
    pub fn sanitize(&mut self) {
        self.poll_interval_ms = self.poll_interval_ms.clamp(1_000, 600_000);
        self.override_grace_ms = self.override_grace_ms.min(600_000);
        self.state_publish_interval_ms = self.state_publish_interval_ms.clamp(1_000, 600_000);
        self.actuator_timeout_ms = self.actuator_timeout_ms.clamp(500, 120_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub backend_url: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:5000".to_string(),
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub rules: RuleSet,
    #[serde(default)]
    pub auto_mode: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            network: NetworkConfig::default(),
            rules: RuleSet::default(),
            auto_mode: false,
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.controller.sanitize();
        self.rules.sanitize();
        self.network.backend_url = self.network.backend_url.trim_end_matches('/').to_string();
        if self.network.http_port == 0 {
            self.network.http_port = 8080;
        }
    }
}
