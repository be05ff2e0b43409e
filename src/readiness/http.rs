//! HTTP status probe.
//!
//! `GET`s a status endpoint and reads one or more boolean flags out of the
//! JSON body via JSON pointers. Anything other than `200 OK` with a JSON
//! body is "not ready".

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use super::StatusProbe;
use crate::config::ReadinessConfig;

/// User-Agent header sent with probe requests.
const USER_AGENT: &str = concat!("sandbox-host/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("status request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("status endpoint answered {0}")]
    Status(u16),

    #[error("status body is not JSON: {0}")]
    Malformed(String),
}

pub struct HttpStatusProbe {
    client: Client,
    url: Url,
    flags: Vec<String>,
}

impl HttpStatusProbe {
    pub fn new(url: Url, flags: Vec<String>, client: Client) -> Self {
        Self { client, url, flags }
    }

    pub fn from_config(config: &ReadinessConfig) -> anyhow::Result<Self> {
        let url = Url::parse(&config.url)?;
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Ok(Self::new(url, config.flags.clone(), client))
    }
}

/// True when every pointer resolves to boolean `true`.
pub fn flags_ready(body: &Value, flags: &[String]) -> bool {
    !flags.is_empty()
        && flags
            .iter()
            .all(|pointer| body.pointer(pointer).and_then(Value::as_bool) == Some(true))
}

#[async_trait]
impl StatusProbe for HttpStatusProbe {
    async fn check(&self) -> Result<bool, ProbeError> {
        let response = self.client.get(self.url.clone()).send().await?;
        if response.status() != StatusCode::OK {
            return Err(ProbeError::Status(response.status().as_u16()));
        }

        let text = response.text().await?;
        let body: Value =
            serde_json::from_str(&text).map_err(|e| ProbeError::Malformed(e.to_string()))?;
        Ok(flags_ready(&body, &self.flags))
    }

    fn description(&self) -> String {
        format!("{} ({})", self.url, self.flags.join(", "))
    }
}
