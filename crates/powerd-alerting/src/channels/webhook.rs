//! Generic JSON webhook notifications.

use super::required_setting;
use crate::model::Alert;
use crate::notify::{ChannelType, NotificationChannel, NotificationHandler};
use async_trait::async_trait;
use powerd_core::{Error, Result};

/// Posts the alert as JSON to the channel's `url` setting.
pub struct WebhookNotificationHandler {
    client: reqwest::Client,
}

impl WebhookNotificationHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebhookNotificationHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationHandler for WebhookNotificationHandler {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Webhook
    }

    async fn send(&self, alert: &Alert, channel: &NotificationChannel) -> Result<()> {
        let url = required_setting(channel, "url")?;

        let response = self
            .client
            .post(url)
            .json(alert)
            .send()
            .await
            .map_err(|e| Error::dependency_unavailable(format!("webhook post failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::dependency_unavailable(format!(
                "webhook {url} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
