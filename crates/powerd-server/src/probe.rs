//! Agent-side health probe over HTTP.

use async_trait::async_trait;
use powerd_core::{Error, HealthProbe, Result};
use std::time::Duration;

/// Queries the agent health endpoint `http://{host}:{port}/api/v1/health/{service}`.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    port: u16,
}

impl HttpHealthProbe {
    pub fn new(port: u16) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { client, port }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, host: &str, service: &str) -> Result<bool> {
        let url = format!("http://{host}:{}/api/v1/health/{service}", self.port);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::dependency_unavailable(format!("agent probe {host}: {e}")))?;
        Ok(response.status().is_success())
    }
}
