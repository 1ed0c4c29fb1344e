//! Message bus port and the in-process implementation.
//!
//! Publishing is at-least-once: agents consuming `deploy.{host}` and
//! `service.{host}` must be idempotent on `(workflow_id, step_id)`.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Topic names produced by the engines.
pub mod topics {
    pub fn deploy(host: &str) -> String {
        format!("deploy.{host}")
    }

    pub fn service(host: &str) -> String {
        format!("service.{host}")
    }

    pub fn rollback(host: &str) -> String {
        format!("rollback.{host}")
    }

    pub const ALERT_CREATED: &str = "alerts.alert.created";
    pub const ALERT_ACKNOWLEDGED: &str = "alerts.alert.acknowledged";
    pub const ALERT_RESOLVED: &str = "alerts.alert.resolved";
    pub const ALERT_ESCALATED: &str = "alerts.alert.escalated";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

/// Deployment command carried on `deploy.{host}` and `rollback.{host}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentCommand {
    pub deployment_id: Uuid,
    pub target_server_id: String,
    pub service_name: String,
    pub strategy: String,
    pub package_url: String,
    pub version: String,
    pub configuration: HashMap<String, serde_json::Value>,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<BusMessage>;
}

/// Broadcast-channel bus for single-process deployments and tests.
pub struct InMemoryBus {
    sender: broadcast::Sender<BusMessage>,
}

impl InMemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<()> {
        let message = BusMessage {
            topic: topic.to_string(),
            payload,
            published_at: Utc::now(),
        };
        // A send error only means no live subscribers; at-least-once allows it.
        if let Err(e) = self.sender.send(message) {
            tracing::debug!("no subscribers for bus message: {e}");
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }
}

/// Parse a deployment command back out of a bus payload.
impl DeploymentCommand {
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(payload.clone())
            .map_err(|e| Error::internal(format!("malformed deployment command: {e}")))
    }
}
