//! Slack-compatible incoming-webhook notifications.

use super::{render_alert_text, required_setting};
use crate::model::Alert;
use crate::notify::{ChannelType, NotificationChannel, NotificationHandler};
use async_trait::async_trait;
use powerd_core::{Error, Result};

/// Posts a text payload to the channel's `webhook_url` setting.
pub struct SlackNotificationHandler {
    client: reqwest::Client,
}

impl SlackNotificationHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for SlackNotificationHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationHandler for SlackNotificationHandler {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Slack
    }

    async fn send(&self, alert: &Alert, channel: &NotificationChannel) -> Result<()> {
        let url = required_setting(channel, "webhook_url")?;

        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "text": render_alert_text(alert) }))
            .send()
            .await
            .map_err(|e| Error::dependency_unavailable(format!("slack post failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::dependency_unavailable(format!(
                "slack webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
