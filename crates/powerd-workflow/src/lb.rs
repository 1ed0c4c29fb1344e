//! Load balancer port consumed by traffic-switch steps.

use async_trait::async_trait;
use powerd_core::{Error, Result};

#[async_trait]
pub trait LoadBalancer: Send + Sync {
    async fn add_server(&self, server: &str) -> Result<()>;

    async fn remove_server(&self, server: &str) -> Result<()>;

    async fn switch_traffic(&self, from: &[String], to: &[String]) -> Result<()>;
}

/// HTTP load balancer driven through its management API.
pub struct HttpLoadBalancer {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpLoadBalancer {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let url = format!("{}/{path}", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::dependency_unavailable(format!("load balancer: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::dependency_unavailable(format!(
                "load balancer returned {} for {path}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LoadBalancer for HttpLoadBalancer {
    async fn add_server(&self, server: &str) -> Result<()> {
        self.post("servers/add", serde_json::json!({ "server": server }))
            .await
    }

    async fn remove_server(&self, server: &str) -> Result<()> {
        self.post("servers/remove", serde_json::json!({ "server": server }))
            .await
    }

    async fn switch_traffic(&self, from: &[String], to: &[String]) -> Result<()> {
        self.post(
            "traffic/switch",
            serde_json::json!({ "from": from, "to": to }),
        )
        .await
    }
}

/// No-op load balancer for fleets fronted elsewhere (and for tests).
pub struct NoopLoadBalancer;

#[async_trait]
impl LoadBalancer for NoopLoadBalancer {
    async fn add_server(&self, server: &str) -> Result<()> {
        tracing::debug!("noop lb: add {server}");
        Ok(())
    }

    async fn remove_server(&self, server: &str) -> Result<()> {
        tracing::debug!("noop lb: remove {server}");
        Ok(())
    }

    async fn switch_traffic(&self, from: &[String], to: &[String]) -> Result<()> {
        tracing::debug!("noop lb: switch {from:?} -> {to:?}");
        Ok(())
    }
}
