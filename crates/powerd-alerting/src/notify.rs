//! Notification channel registry and dispatcher.
//!
//! Channels are typed (email, webhook, slack); a handler registered per
//! type performs the actual send. Outcomes land in the alert's
//! notification log, and failed sends queue for a bounded background
//! retry. Notification failures never affect alert state.

use crate::model::{Alert, NotificationRecord};
use crate::store::AlertStore;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use powerd_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const MAX_SEND_CONCURRENCY: usize = 5;
const MAX_RETRY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    Email,
    Webhook,
    Slack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub name: String,
    pub channel_type: ChannelType,
    pub enabled: bool,
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

#[async_trait]
pub trait NotificationHandler: Send + Sync {
    fn channel_type(&self) -> ChannelType;

    async fn send(&self, alert: &Alert, channel: &NotificationChannel) -> Result<()>;
}

struct PendingNotification {
    alert_id: Uuid,
    channel_name: String,
    attempts: u32,
}

pub struct NotificationDispatcher {
    store: Arc<AlertStore>,
    channels: RwLock<HashMap<String, NotificationChannel>>,
    handlers: RwLock<HashMap<ChannelType, Arc<dyn NotificationHandler>>>,
    retry_queue: Mutex<VecDeque<PendingNotification>>,
}

impl NotificationDispatcher {
    pub fn new(store: Arc<AlertStore>) -> Self {
        Self {
            store,
            channels: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            retry_queue: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn register_channel(&self, channel: NotificationChannel) {
        self.channels
            .write()
            .await
            .insert(channel.name.clone(), channel);
    }

    pub async fn register_handler(&self, handler: Arc<dyn NotificationHandler>) {
        self.handlers
            .write()
            .await
            .insert(handler.channel_type(), handler);
    }

    pub async fn channels(&self) -> Vec<NotificationChannel> {
        self.channels.read().await.values().cloned().collect()
    }

    /// Send one alert to one named channel. Returns whether a send was
    /// attempted (disabled channels are skipped).
    pub async fn dispatch(&self, alert: &Alert, channel_name: &str) -> Result<bool> {
        let channel = {
            let channels = self.channels.read().await;
            channels.get(channel_name).cloned()
        }
        .ok_or_else(|| Error::not_found(format!("notification channel {channel_name}")))?;

        if !channel.enabled {
            tracing::debug!("skipping disabled notification channel {channel_name}");
            return Ok(false);
        }

        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&channel.channel_type).cloned()
        }
        .ok_or_else(|| {
            Error::invalid_configuration(format!(
                "no handler registered for {:?} channels",
                channel.channel_type
            ))
        })?;

        let outcome = handler.send(alert, &channel).await;
        let record = NotificationRecord {
            timestamp: Utc::now(),
            channel: channel_name.to_string(),
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(ToString::to_string),
        };
        if let Err(e) = self.store.record_notification(alert.id, record).await {
            tracing::warn!("failed to record notification outcome: {e}");
        }

        if let Err(e) = outcome {
            tracing::warn!("notification to {channel_name} failed: {e}; queueing retry");
            self.retry_queue.lock().await.push_back(PendingNotification {
                alert_id: alert.id,
                channel_name: channel_name.to_string(),
                attempts: 1,
            });
        }
        Ok(true)
    }

    /// Fan an alert out to several channels, at most
    /// [`MAX_SEND_CONCURRENCY`] in flight.
    pub async fn dispatch_all(&self, alert: &Alert, channel_names: &[String]) {
        futures::stream::iter(channel_names)
            .for_each_concurrent(Some(MAX_SEND_CONCURRENCY), |name| async move {
                if let Err(e) = self.dispatch(alert, name).await {
                    tracing::warn!("notification dispatch to {name} failed: {e}");
                }
            })
            .await;
    }

    /// One pass over the retry queue. Exhausted entries are dropped.
    pub async fn retry_pending(&self) -> Result<usize> {
        let pending: Vec<PendingNotification> = {
            let mut queue = self.retry_queue.lock().await;
            queue.drain(..).collect()
        };
        let attempted = pending.len();

        for entry in pending {
            let alert = match self.store.get_alert(entry.alert_id).await {
                Ok(alert) => alert,
                // Alert cleaned up since the failure; nothing to deliver.
                Err(_) => continue,
            };

            let channel = {
                let channels = self.channels.read().await;
                channels.get(&entry.channel_name).cloned()
            };
            let Some(channel) = channel else { continue };
            if !channel.enabled {
                continue;
            }
            let handler = {
                let handlers = self.handlers.read().await;
                handlers.get(&channel.channel_type).cloned()
            };
            let Some(handler) = handler else { continue };

            let outcome = handler.send(&alert, &channel).await;
            let record = NotificationRecord {
                timestamp: Utc::now(),
                channel: entry.channel_name.clone(),
                success: outcome.is_ok(),
                error: outcome.as_ref().err().map(ToString::to_string),
            };
            if let Err(e) = self.store.record_notification(alert.id, record).await {
                tracing::warn!("failed to record retry outcome: {e}");
            }

            if outcome.is_err() {
                if entry.attempts + 1 >= MAX_RETRY_ATTEMPTS {
                    tracing::warn!(
                        "dropping notification for alert {} to {} after {} attempts",
                        entry.alert_id,
                        entry.channel_name,
                        entry.attempts + 1
                    );
                } else {
                    self.retry_queue.lock().await.push_back(PendingNotification {
                        alert_id: entry.alert_id,
                        channel_name: entry.channel_name,
                        attempts: entry.attempts + 1,
                    });
                }
            }
        }
        Ok(attempted)
    }

    /// Background retry worker.
    pub async fn run_retry_worker(
        &self,
        cancel: CancellationToken,
        interval: Duration,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => return Ok(()),
            }
            if let Err(e) = self.retry_pending().await {
                tracing::warn!("notification retry pass failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AlertSeverity;
    use crate::store::CreateAlertRequest;
    use powerd_core::{InMemoryBus, MemoryCache};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Handler that fails a configurable number of times before succeeding.
    struct FlakyHandler {
        failures_left: AtomicU32,
        sends: AtomicU32,
    }

    impl FlakyHandler {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                sends: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl NotificationHandler for FlakyHandler {
        fn channel_type(&self) -> ChannelType {
            ChannelType::Webhook
        }

        async fn send(&self, _alert: &Alert, _channel: &NotificationChannel) -> Result<()> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::dependency_unavailable("endpoint down"));
            }
            Ok(())
        }
    }

    fn channel(name: &str, enabled: bool) -> NotificationChannel {
        NotificationChannel {
            name: name.to_string(),
            channel_type: ChannelType::Webhook,
            enabled,
            settings: HashMap::new(),
        }
    }

    async fn fixture(handler: Arc<FlakyHandler>) -> (Arc<AlertStore>, NotificationDispatcher, Alert) {
        let store = Arc::new(AlertStore::new(
            Arc::new(MemoryCache::new()),
            Arc::new(InMemoryBus::default()),
        ));
        let dispatcher = NotificationDispatcher::new(store.clone());
        dispatcher.register_handler(handler).await;
        dispatcher.register_channel(channel("ops-webhook", true)).await;

        let (alert, _) = store
            .create_alert(CreateAlertRequest {
                title: "CPU high".into(),
                message: "cpu above threshold".into(),
                severity: AlertSeverity::Warning,
                category: "resource".into(),
                host_id: None,
                service_id: None,
                rule_id: "r1".into(),
                metric: "cpu_usage_percent".into(),
                filters: HashMap::new(),
                threshold_value: 80.0,
                actual_value: 92.0,
                unit: "%".into(),
                tags: vec![],
            })
            .await
            .unwrap();
        (store, dispatcher, alert)
    }

    #[tokio::test]
    async fn successful_send_is_recorded_on_the_alert() {
        let handler = Arc::new(FlakyHandler::new(0));
        let (store, dispatcher, alert) = fixture(handler.clone()).await;

        assert!(dispatcher.dispatch(&alert, "ops-webhook").await.unwrap());

        let refreshed = store.get_alert(alert.id).await.unwrap();
        assert_eq!(refreshed.notifications.len(), 1);
        assert!(refreshed.notifications[0].success);
    }

    #[tokio::test]
    async fn disabled_channel_is_skipped() {
        let handler = Arc::new(FlakyHandler::new(0));
        let (_, dispatcher, alert) = fixture(handler.clone()).await;
        dispatcher.register_channel(channel("muted", false)).await;

        let attempted = dispatcher.dispatch(&alert, "muted").await.unwrap();
        assert!(!attempted);
        assert_eq!(handler.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_channel_is_not_found() {
        let handler = Arc::new(FlakyHandler::new(0));
        let (_, dispatcher, alert) = fixture(handler).await;
        assert!(matches!(
            dispatcher.dispatch(&alert, "missing").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_send_retries_until_success() {
        let handler = Arc::new(FlakyHandler::new(1));
        let (store, dispatcher, alert) = fixture(handler.clone()).await;

        dispatcher.dispatch(&alert, "ops-webhook").await.unwrap();
        let refreshed = store.get_alert(alert.id).await.unwrap();
        assert!(!refreshed.notifications[0].success);

        let retried = dispatcher.retry_pending().await.unwrap();
        assert_eq!(retried, 1);
        let refreshed = store.get_alert(alert.id).await.unwrap();
        assert_eq!(refreshed.notifications.len(), 2);
        assert!(refreshed.notifications[1].success);

        // Queue is drained after the successful retry.
        assert_eq!(dispatcher.retry_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let handler = Arc::new(FlakyHandler::new(u32::MAX));
        let (_, dispatcher, alert) = fixture(handler.clone()).await;

        dispatcher.dispatch(&alert, "ops-webhook").await.unwrap();
        // First retry pass re-queues, second drops at the attempt cap.
        assert_eq!(dispatcher.retry_pending().await.unwrap(), 1);
        assert_eq!(dispatcher.retry_pending().await.unwrap(), 1);
        assert_eq!(dispatcher.retry_pending().await.unwrap(), 0);
        assert_eq!(handler.sends.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn batch_dispatch_covers_all_channels() {
        let handler = Arc::new(FlakyHandler::new(0));
        let (store, dispatcher, alert) = fixture(handler.clone()).await;
        for i in 0..7 {
            dispatcher
                .register_channel(channel(&format!("hook-{i}"), true))
                .await;
        }

        let names: Vec<String> = (0..7).map(|i| format!("hook-{i}")).collect();
        dispatcher.dispatch_all(&alert, &names).await;

        assert_eq!(handler.sends.load(Ordering::SeqCst), 7);
        let refreshed = store.get_alert(alert.id).await.unwrap();
        assert_eq!(refreshed.notifications.len(), 7);
    }
}
