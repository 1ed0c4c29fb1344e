//! Notification channel handlers.

mod email;
mod slack;
mod webhook;

pub use email::EmailNotificationHandler;
pub use slack::SlackNotificationHandler;
pub use webhook::WebhookNotificationHandler;

use crate::model::{Alert, AlertSeverity};

/// Shared plain-text rendering used by the transports.
pub(crate) fn render_alert_text(alert: &Alert) -> String {
    let severity = match alert.severity {
        AlertSeverity::Info => "INFO",
        AlertSeverity::Warning => "WARNING",
        AlertSeverity::Critical => "CRITICAL",
    };
    let mut text = format!(
        "[{severity}] {}\n{}\nobserved {} {} against threshold {} {}",
        alert.title, alert.message, alert.actual_value, alert.unit, alert.threshold_value, alert.unit
    );
    if let Some(host) = &alert.host_id {
        text.push_str(&format!("\nhost: {host}"));
    }
    if let Some(service) = &alert.service_id {
        text.push_str(&format!("\nservice: {service}"));
    }
    text
}

pub(crate) fn required_setting<'a>(
    channel: &'a crate::notify::NotificationChannel,
    key: &str,
) -> powerd_core::Result<&'a str> {
    channel
        .settings
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| {
            powerd_core::Error::invalid_configuration(format!(
                "channel {} is missing setting {key}",
                channel.name
            ))
        })
}
