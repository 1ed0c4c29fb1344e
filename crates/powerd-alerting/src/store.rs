//! Alert lifecycle store.
//!
//! Owns alert state, deduplicates by fingerprint under a brief
//! per-fingerprint lease, and mirrors coordination keys (active set,
//! fingerprint index, suppression timers) into the cache.

use crate::model::{fingerprint, Alert, AlertSeverity, AlertStatus, NotificationRecord};
use chrono::Utc;
use powerd_core::bus::topics;
use powerd_core::cache::{keys, ttl};
use powerd_core::{CacheStore, CacheStoreExt, Error, Lease, MessageBus, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

const ALERT_RECORD_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
const FINGERPRINT_LEASE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAlertRequest {
    pub title: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub category: String,
    pub host_id: Option<String>,
    pub service_id: Option<String>,
    pub rule_id: String,
    pub metric: String,
    #[serde(default)]
    pub filters: HashMap<String, String>,
    pub threshold_value: f64,
    pub actual_value: f64,
    pub unit: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertStatsSummary {
    pub total: usize,
    pub active: usize,
    pub acknowledged: usize,
    pub suppressed: usize,
    pub resolved: usize,
    pub by_severity: HashMap<String, usize>,
}

pub struct AlertStore {
    cache: Arc<dyn CacheStore>,
    bus: Arc<dyn MessageBus>,
    alerts: RwLock<HashMap<Uuid, Alert>>,
}

impl AlertStore {
    pub fn new(cache: Arc<dyn CacheStore>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            cache,
            bus,
            alerts: RwLock::new(HashMap::new()),
        }
    }

    /// Create an alert, or extend the open alert sharing its fingerprint.
    /// Returns the alert and whether it was newly created.
    pub async fn create_alert(&self, request: CreateAlertRequest) -> Result<(Alert, bool)> {
        let fp = fingerprint(&request.rule_id, &request.metric, &request.filters);

        // Brief per-fingerprint lease makes check-then-insert a logical CAS.
        let lease = Lease::acquire(
            self.cache.clone(),
            format!("alert_fingerprint_lease:{fp}"),
            FINGERPRINT_LEASE_TTL,
        )
        .await?;

        let outcome = self.create_with_lease(&fp, request).await;
        lease.release().await?;
        outcome
    }

    async fn create_with_lease(
        &self,
        fp: &str,
        request: CreateAlertRequest,
    ) -> Result<(Alert, bool)> {
        if let Some(existing_id) = self.cache.get_raw(&keys::alert_fingerprint(fp)).await? {
            if let Ok(id) = Uuid::parse_str(&existing_id) {
                let existing = {
                    let alerts = self.alerts.read().await;
                    alerts.get(&id).cloned()
                };
                if let Some(mut alert) = existing {
                    if alert.is_open() {
                        alert.push_data_point(request.actual_value);
                        self.persist(&alert).await?;
                        self.refresh_hot_lookup(&alert).await?;
                        return Ok((alert, false));
                    }
                }
            }
        }

        let now = Utc::now();
        let mut alert = Alert {
            id: Uuid::new_v4(),
            title: request.title,
            message: request.message,
            severity: request.severity,
            category: request.category,
            host_id: request.host_id,
            service_id: request.service_id,
            rule_id: request.rule_id,
            threshold_value: request.threshold_value,
            actual_value: request.actual_value,
            unit: request.unit,
            tags: request.tags,
            data_points: Vec::new(),
            fingerprint: fp.to_string(),
            status: AlertStatus::Active,
            actions: Vec::new(),
            notifications: Vec::new(),
            escalation_level: 0,
            created_at: now,
            updated_at: now,
            acknowledged_at: None,
            escalated_at: None,
            resolved_at: None,
        };
        alert.push_data_point(alert.actual_value);

        self.persist(&alert).await?;
        self.cache
            .set_raw(
                &keys::alert_fingerprint(fp),
                alert.id.to_string(),
                Some(ALERT_RECORD_TTL),
            )
            .await?;
        self.cache
            .set_add(keys::ACTIVE_ALERTS, &alert.id.to_string())
            .await?;
        self.refresh_hot_lookup(&alert).await?;

        self.publish(topics::ALERT_CREATED, &alert).await;
        tracing::info!(alert_id = %alert.id, "alert created: {}", alert.title);
        Ok((alert, true))
    }

    pub async fn acknowledge(&self, id: Uuid, user: &str, comment: Option<String>) -> Result<Alert> {
        let mut alert = self.get_alert(id).await?;
        if alert.status != AlertStatus::Active {
            return Err(Error::invalid_state(format!(
                "alert {id} is {:?}, only Active alerts can be acknowledged",
                alert.status
            )));
        }
        alert.status = AlertStatus::Acknowledged;
        alert.acknowledged_at = Some(Utc::now());
        alert.record_action("acknowledged", user, comment);
        self.persist(&alert).await?;
        self.publish(topics::ALERT_ACKNOWLEDGED, &alert).await;
        Ok(alert)
    }

    /// Resolve an alert. Idempotent: resolving a Resolved alert returns it
    /// unchanged.
    pub async fn resolve(&self, id: Uuid, user: &str, comment: Option<String>) -> Result<Alert> {
        let mut alert = self.get_alert(id).await?;
        if alert.status == AlertStatus::Resolved {
            return Ok(alert);
        }

        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(Utc::now());
        alert.record_action("resolved", user, comment);
        self.persist(&alert).await?;

        self.cache
            .set_remove(keys::ACTIVE_ALERTS, &id.to_string())
            .await?;
        self.cache
            .remove(&keys::alert_fingerprint(&alert.fingerprint))
            .await?;
        self.cache
            .remove(&keys::active_alert(&alert.fingerprint))
            .await?;

        self.publish(topics::ALERT_RESOLVED, &alert).await;
        tracing::info!(alert_id = %id, "alert resolved by {user}");
        Ok(alert)
    }

    pub async fn escalate(&self, id: Uuid, user: &str, comment: Option<String>) -> Result<Alert> {
        let mut alert = self.get_alert(id).await?;
        if !alert.is_open() {
            return Err(Error::invalid_state(format!(
                "alert {id} is {:?}, only open alerts can be escalated",
                alert.status
            )));
        }
        alert.escalation_level += 1;
        alert.escalated_at = Some(Utc::now());
        alert.record_action("escalated", user, comment);
        self.persist(&alert).await?;
        self.publish(topics::ALERT_ESCALATED, &alert).await;
        Ok(alert)
    }

    /// Suppress the alert for a bounded duration; the TTL key doubles as
    /// the unsuppression schedule.
    pub async fn suppress(&self, id: Uuid, duration: Duration, reason: &str) -> Result<Alert> {
        let mut alert = self.get_alert(id).await?;
        if !alert.is_open() {
            return Err(Error::invalid_state(format!(
                "alert {id} is {:?}, only open alerts can be suppressed",
                alert.status
            )));
        }
        alert.status = AlertStatus::Suppressed;
        alert.record_action("suppressed", "System", Some(reason.to_string()));
        self.persist(&alert).await?;

        self.cache
            .set_raw(
                &keys::alert_suppression(id),
                reason.to_string(),
                Some(duration),
            )
            .await?;
        self.cache
            .set_remove(keys::ACTIVE_ALERTS, &id.to_string())
            .await?;
        self.cache
            .remove(&keys::alert_fingerprint(&alert.fingerprint))
            .await?;
        self.cache
            .remove(&keys::active_alert(&alert.fingerprint))
            .await?;
        Ok(alert)
    }

    pub async fn unsuppress(&self, id: Uuid) -> Result<Alert> {
        let mut alert = self.get_alert(id).await?;
        if alert.status != AlertStatus::Suppressed {
            return Err(Error::invalid_state(format!(
                "alert {id} is {:?}, not Suppressed",
                alert.status
            )));
        }
        alert.status = AlertStatus::Active;
        alert.record_action("unsuppressed", "System", None);
        self.persist(&alert).await?;

        self.cache.remove(&keys::alert_suppression(id)).await?;
        self.cache
            .set_add(keys::ACTIVE_ALERTS, &id.to_string())
            .await?;
        self.cache
            .set_raw(
                &keys::alert_fingerprint(&alert.fingerprint),
                id.to_string(),
                Some(ALERT_RECORD_TTL),
            )
            .await?;
        Ok(alert)
    }

    /// Lift suppressions whose TTL key has expired.
    pub async fn reap_expired_suppressions(&self) -> Result<usize> {
        let suppressed: Vec<Uuid> = {
            let alerts = self.alerts.read().await;
            alerts
                .values()
                .filter(|a| a.status == AlertStatus::Suppressed)
                .map(|a| a.id)
                .collect()
        };

        let mut lifted = 0;
        for id in suppressed {
            if !self.cache.exists(&keys::alert_suppression(id)).await? {
                self.unsuppress(id).await?;
                lifted += 1;
            }
        }
        Ok(lifted)
    }

    pub async fn add_comment(&self, id: Uuid, author: &str, comment: &str) -> Result<Alert> {
        let mut alert = self.get_alert(id).await?;
        alert.record_action("comment", author, Some(comment.to_string()));
        self.persist(&alert).await?;
        Ok(alert)
    }

    pub async fn record_notification(&self, id: Uuid, record: NotificationRecord) -> Result<()> {
        let mut alert = self.get_alert(id).await?;
        alert.notifications.push(record);
        self.persist(&alert).await
    }

    /// Append a data point to an open alert (evaluator path).
    pub async fn append_data_point(&self, id: Uuid, value: f64) -> Result<Alert> {
        let mut alert = self.get_alert(id).await?;
        if !alert.is_open() {
            return Err(Error::invalid_state(format!(
                "alert {id} is {:?}, not open",
                alert.status
            )));
        }
        alert.push_data_point(value);
        self.persist(&alert).await?;
        self.refresh_hot_lookup(&alert).await?;
        Ok(alert)
    }

    pub async fn get_alert(&self, id: Uuid) -> Result<Alert> {
        let alerts = self.alerts.read().await;
        alerts
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("alert {id}")))
    }

    pub async fn list_alerts(&self, status: Option<AlertStatus>) -> Result<Vec<Alert>> {
        let alerts = self.alerts.read().await;
        let mut matched: Vec<Alert> = alerts
            .values()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matched)
    }

    pub async fn find_open_by_rule(&self, rule_id: &str) -> Result<Option<Alert>> {
        let alerts = self.alerts.read().await;
        Ok(alerts
            .values()
            .find(|a| a.rule_id == rule_id && a.is_open())
            .cloned())
    }

    /// Hot-path lookup by fingerprint (5-minute cache key).
    pub async fn find_hot_by_fingerprint(&self, fp: &str) -> Result<Option<Alert>> {
        self.cache.get_json(&keys::active_alert(fp)).await
    }

    /// Drop Resolved alerts older than the retention window. Returns how
    /// many were removed.
    pub async fn cleanup_expired(&self, retention_days: i64) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        let doomed: Vec<Uuid> = {
            let alerts = self.alerts.read().await;
            alerts
                .values()
                .filter(|a| {
                    a.status == AlertStatus::Resolved
                        && a.resolved_at.map_or(false, |at| at < cutoff)
                })
                .map(|a| a.id)
                .collect()
        };

        let mut alerts = self.alerts.write().await;
        for id in &doomed {
            alerts.remove(id);
            self.cache.remove(&keys::alert(*id)).await?;
        }
        if !doomed.is_empty() {
            tracing::info!("cleaned up {} expired alerts", doomed.len());
        }
        Ok(doomed.len())
    }

    pub async fn stats(&self) -> Result<AlertStatsSummary> {
        let alerts = self.alerts.read().await;
        let count = |status: AlertStatus| alerts.values().filter(|a| a.status == status).count();

        let mut by_severity: HashMap<String, usize> = HashMap::new();
        for alert in alerts.values() {
            let label = match alert.severity {
                AlertSeverity::Info => "info",
                AlertSeverity::Warning => "warning",
                AlertSeverity::Critical => "critical",
            };
            *by_severity.entry(label.to_string()).or_insert(0) += 1;
        }

        Ok(AlertStatsSummary {
            total: alerts.len(),
            active: count(AlertStatus::Active),
            acknowledged: count(AlertStatus::Acknowledged),
            suppressed: count(AlertStatus::Suppressed),
            resolved: count(AlertStatus::Resolved),
            by_severity,
        })
    }

    async fn persist(&self, alert: &Alert) -> Result<()> {
        self.cache
            .set_json(&keys::alert(alert.id), alert, Some(ALERT_RECORD_TTL))
            .await?;
        self.alerts.write().await.insert(alert.id, alert.clone());
        Ok(())
    }

    async fn refresh_hot_lookup(&self, alert: &Alert) -> Result<()> {
        self.cache
            .set_json(
                &keys::active_alert(&alert.fingerprint),
                alert,
                Some(ttl::ACTIVE_ALERT_LOOKUP),
            )
            .await
    }

    async fn publish(&self, topic: &str, alert: &Alert) {
        let payload = match serde_json::to_value(alert) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("alert payload serialization failed: {e}");
                return;
            }
        };
        // Notification failures never affect alert state.
        if let Err(e) = self.bus.publish(topic, payload).await {
            tracing::warn!("bus publish to {topic} failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use powerd_core::{InMemoryBus, MemoryCache};

    fn store() -> AlertStore {
        AlertStore::new(
            Arc::new(MemoryCache::new()),
            Arc::new(InMemoryBus::default()),
        )
    }

    fn request(rule_id: &str) -> CreateAlertRequest {
        CreateAlertRequest {
            title: "CPU high".into(),
            message: "cpu_usage_percent above 80".into(),
            severity: AlertSeverity::Warning,
            category: "resource".into(),
            host_id: Some("web-01".into()),
            service_id: None,
            rule_id: rule_id.to_string(),
            metric: "cpu_usage_percent".into(),
            filters: HashMap::new(),
            threshold_value: 80.0,
            actual_value: 91.5,
            unit: "%".into(),
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn duplicate_fingerprint_extends_the_existing_alert() {
        let store = store();
        let (first, created) = store.create_alert(request("r1")).await.unwrap();
        assert!(created);
        assert_eq!(first.data_points.len(), 1);

        let (second, created) = store.create_alert(request("r1")).await.unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.data_points.len(), 2);

        // Only one open alert per fingerprint.
        assert_eq!(store.list_alerts(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn different_rules_create_distinct_alerts() {
        let store = store();
        store.create_alert(request("r1")).await.unwrap();
        store.create_alert(request("r2")).await.unwrap();
        assert_eq!(store.list_alerts(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn acknowledge_is_valid_only_from_active() {
        let store = store();
        let (alert, _) = store.create_alert(request("r1")).await.unwrap();

        let acked = store.acknowledge(alert.id, "op", None).await.unwrap();
        assert_eq!(acked.status, AlertStatus::Acknowledged);
        assert!(acked.acknowledged_at.is_some());

        // Second acknowledge is rejected, not reprocessed.
        assert!(matches!(
            store.acknowledge(alert.id, "op", None).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn resolve_is_idempotent_and_absorbing() {
        let store = store();
        let (alert, _) = store.create_alert(request("r1")).await.unwrap();

        let resolved = store
            .resolve(alert.id, "System", Some("condition cleared".into()))
            .await
            .unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        let action_count = resolved.actions.len();

        let again = store.resolve(alert.id, "op", None).await.unwrap();
        assert_eq!(again.status, AlertStatus::Resolved);
        assert_eq!(again.actions.len(), action_count);

        // Resolve absorbs later lifecycle calls.
        assert!(store.acknowledge(alert.id, "op", None).await.is_err());
        assert!(store.escalate(alert.id, "op", None).await.is_err());
    }

    #[tokio::test]
    async fn resolved_fingerprint_allows_a_fresh_alert() {
        let store = store();
        let (first, _) = store.create_alert(request("r1")).await.unwrap();
        store.resolve(first.id, "System", None).await.unwrap();

        let (second, created) = store.create_alert(request("r1")).await.unwrap();
        assert!(created);
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn escalate_bumps_the_level() {
        let store = store();
        let (alert, _) = store.create_alert(request("r1")).await.unwrap();
        let escalated = store.escalate(alert.id, "op", None).await.unwrap();
        assert_eq!(escalated.escalation_level, 1);
        let escalated = store.escalate(alert.id, "op", None).await.unwrap();
        assert_eq!(escalated.escalation_level, 2);
    }

    #[tokio::test]
    async fn suppression_expires_via_the_ttl_key() {
        let store = store();
        let (alert, _) = store.create_alert(request("r1")).await.unwrap();

        store
            .suppress(alert.id, Duration::from_millis(20), "maintenance window")
            .await
            .unwrap();
        assert_eq!(
            store.get_alert(alert.id).await.unwrap().status,
            AlertStatus::Suppressed
        );

        // Before expiry nothing is lifted.
        assert_eq!(store.reap_expired_suppressions().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.reap_expired_suppressions().await.unwrap(), 1);
        assert_eq!(
            store.get_alert(alert.id).await.unwrap().status,
            AlertStatus::Active
        );
    }

    #[tokio::test]
    async fn comments_are_always_allowed() {
        let store = store();
        let (alert, _) = store.create_alert(request("r1")).await.unwrap();
        store.resolve(alert.id, "System", None).await.unwrap();

        let commented = store
            .add_comment(alert.id, "op", "post-mortem link")
            .await
            .unwrap();
        assert!(commented
            .actions
            .iter()
            .any(|a| a.action == "comment" && a.comment.as_deref() == Some("post-mortem link")));
    }

    #[tokio::test]
    async fn cleanup_drops_only_old_resolved_alerts() {
        let store = store();
        let (old, _) = store.create_alert(request("r1")).await.unwrap();
        let mut resolved = store.resolve(old.id, "System", None).await.unwrap();
        resolved.resolved_at = Some(Utc::now() - chrono::Duration::days(45));
        store.persist(&resolved).await.unwrap();

        let (_fresh, _) = store.create_alert(request("r2")).await.unwrap();

        assert_eq!(store.cleanup_expired(30).await.unwrap(), 1);
        assert_eq!(store.list_alerts(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stats_count_by_status_and_severity() {
        let store = store();
        let (a, _) = store.create_alert(request("r1")).await.unwrap();
        store.create_alert(request("r2")).await.unwrap();
        store.acknowledge(a.id, "op", None).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.acknowledged, 1);
        assert_eq!(stats.by_severity.get("warning"), Some(&2));
    }
}
