use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

use greenhouse_common::{ControlRequest, ControlResponse, Device, StatusPayload};

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("actuator request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("actuator answered with status {0}")]
    Status(StatusCode),
    #[error("malformed actuator response: {0}")]
    Malformed(String),
}

/// Remote side of the greenhouse: sensor readings and device switching.
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn fetch_status(&self) -> Result<StatusPayload, ActuatorError>;

    /// Must be safe to call with the state a device already has.
    async fn control_device(
        &self,
        device: Device,
        desired: bool,
    ) -> Result<ControlResponse, ActuatorError>;
}

pub struct HttpActuator {
    client: Client,
    base_url: String,
}

impl HttpActuator {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .build()
            .context("failed to build actuator http client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ActuatorError> {
        let status = response.status();
        if !status.is_success() {
            return Err(ActuatorError::Status(status));
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|err| ActuatorError::Malformed(err.to_string()))
    }
}

#[async_trait]
impl Actuator for HttpActuator {
    async fn fetch_status(&self) -> Result<StatusPayload, ActuatorError> {
        let response = self.client.get(self.url("/api/status")).send().await?;
        Self::decode(response).await
    }

    async fn control_device(
        &self,
        device: Device,
        desired: bool,
    ) -> Result<ControlResponse, ActuatorError> {
        let request = ControlRequest {
            device,
            status: desired,
        };
        let response = self
            .client
            .post(self.url("/api/control"))
            .json(&request)
            .send()
            .await?;
        Self::decode(response).await
    }
}
