//! SMTP email notifications.

use super::{render_alert_text, required_setting};
use crate::model::Alert;
use crate::notify::{ChannelType, NotificationChannel, NotificationHandler};
use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use powerd_core::{Error, Result};

/// Sends alerts over SMTP. Channel settings: `smtp_host`, `smtp_username`,
/// `smtp_password`, `from`, `to`.
pub struct EmailNotificationHandler;

#[async_trait]
impl NotificationHandler for EmailNotificationHandler {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Email
    }

    async fn send(&self, alert: &Alert, channel: &NotificationChannel) -> Result<()> {
        let host = required_setting(channel, "smtp_host")?;
        let username = required_setting(channel, "smtp_username")?;
        let password = required_setting(channel, "smtp_password")?;
        let from = required_setting(channel, "from")?;
        let to = required_setting(channel, "to")?;

        let from: Mailbox = from
            .parse()
            .map_err(|e| Error::invalid_configuration(format!("bad from address: {e}")))?;
        let to: Mailbox = to
            .parse()
            .map_err(|e| Error::invalid_configuration(format!("bad to address: {e}")))?;

        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(format!("PowerDaemon alert: {}", alert.title))
            .body(render_alert_text(alert))
            .map_err(|e| Error::internal(format!("message build failed: {e}")))?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .map_err(|e| Error::invalid_configuration(format!("smtp relay {host}: {e}")))?
            .credentials(Credentials::new(username.to_string(), password.to_string()))
            .build();

        transport
            .send(message)
            .await
            .map_err(|e| Error::dependency_unavailable(format!("smtp send failed: {e}")))?;
        Ok(())
    }
}
