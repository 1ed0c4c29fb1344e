//! Alert rule and alert entities.

use chrono::{DateTime, Utc};
use powerd_core::{AggregationKind, Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

/// Alerts keep only the most recent data points.
pub const DATA_POINT_CAP: usize = 100;

/// Tolerance for the equality operators.
const EQUALITY_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
}

impl ComparisonOperator {
    pub fn evaluate(&self, actual: f64, threshold: f64) -> bool {
        match self {
            ComparisonOperator::GreaterThan => actual > threshold,
            ComparisonOperator::GreaterThanOrEqual => actual >= threshold,
            ComparisonOperator::LessThan => actual < threshold,
            ComparisonOperator::LessThanOrEqual => actual <= threshold,
            ComparisonOperator::Equal => (actual - threshold).abs() < EQUALITY_TOLERANCE,
            ComparisonOperator::NotEqual => (actual - threshold).abs() >= EQUALITY_TOLERANCE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertCondition {
    pub metric: String,
    pub operator: ComparisonOperator,
    pub threshold: f64,
    pub aggregation: AggregationKind,
    #[serde(default)]
    pub filters: HashMap<String, String>,
}

/// Time-boxed suppression attached to a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressionRule {
    pub name: String,
    pub reason: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl SuppressionRule {
    pub fn active_at(&self, at: DateTime<Utc>) -> bool {
        at >= self.starts_at && at < self.ends_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub category: String,
    pub severity: AlertSeverity,
    pub condition: AlertCondition,
    pub evaluation_interval_seconds: u64,
    pub evaluation_window_seconds: u64,
    pub minimum_data_points: usize,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub notification_channels: Vec<String>,
    #[serde(default)]
    pub suppression_rules: Vec<SuppressionRule>,
    /// Bumped on every update.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AlertRule {
    pub fn validate(&self) -> Result<()> {
        if !self.condition.threshold.is_finite() {
            return Err(Error::invalid_configuration(format!(
                "rule {} threshold is not finite",
                self.id
            )));
        }
        if self.evaluation_interval_seconds > self.evaluation_window_seconds {
            return Err(Error::invalid_configuration(format!(
                "rule {} evaluation interval exceeds its window",
                self.id
            )));
        }
        if self.condition.metric.is_empty() {
            return Err(Error::invalid_configuration(format!(
                "rule {} has no metric",
                self.id
            )));
        }
        Ok(())
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.id, &self.condition.metric, &self.condition.filters)
    }

    pub fn suppressed_at(&self, at: DateTime<Utc>) -> bool {
        self.suppression_rules.iter().any(|s| s.active_at(at))
    }
}

/// Deterministic hash identifying the logical alert: rule id, metric, and
/// the sorted filter pairs.
pub fn fingerprint(rule_id: &str, metric: &str, filters: &HashMap<String, String>) -> String {
    let mut pairs: Vec<(&String, &String)> = filters.iter().collect();
    pairs.sort();

    let mut hasher = Sha256::new();
    hasher.update(rule_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(metric.as_bytes());
    for (key, value) in pairs {
        hasher.update(b"\0");
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Suppressed,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertDataPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertAction {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub user: String,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub title: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub category: String,
    pub host_id: Option<String>,
    pub service_id: Option<String>,
    pub rule_id: String,
    pub threshold_value: f64,
    pub actual_value: f64,
    pub unit: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub data_points: Vec<AlertDataPoint>,
    pub fingerprint: String,
    pub status: AlertStatus,
    #[serde(default)]
    pub actions: Vec<AlertAction>,
    #[serde(default)]
    pub notifications: Vec<NotificationRecord>,
    pub escalation_level: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Append an observation, keeping only the latest [`DATA_POINT_CAP`]
    /// points.
    pub fn push_data_point(&mut self, value: f64) {
        self.data_points.push(AlertDataPoint {
            timestamp: Utc::now(),
            value,
        });
        if self.data_points.len() > DATA_POINT_CAP {
            let overflow = self.data_points.len() - DATA_POINT_CAP;
            self.data_points.drain(..overflow);
        }
        self.actual_value = value;
        self.updated_at = Utc::now();
    }

    pub fn record_action(&mut self, action: &str, user: &str, comment: Option<String>) {
        self.actions.push(AlertAction {
            timestamp: Utc::now(),
            action: action.to_string(),
            user: user.to_string(),
            comment,
        });
        self.updated_at = Utc::now();
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, AlertStatus::Active | AlertStatus::Acknowledged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic_and_order_insensitive() {
        let mut filters_a = HashMap::new();
        filters_a.insert("host".to_string(), "web-01".to_string());
        filters_a.insert("env".to_string(), "prod".to_string());

        let mut filters_b = HashMap::new();
        filters_b.insert("env".to_string(), "prod".to_string());
        filters_b.insert("host".to_string(), "web-01".to_string());

        let a = fingerprint("rule-1", "cpu_usage_percent", &filters_a);
        let b = fingerprint("rule-1", "cpu_usage_percent", &filters_b);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn fingerprint_distinguishes_rules_and_metrics() {
        let filters = HashMap::new();
        let base = fingerprint("rule-1", "cpu_usage_percent", &filters);
        assert_ne!(base, fingerprint("rule-2", "cpu_usage_percent", &filters));
        assert_ne!(base, fingerprint("rule-1", "memory_usage_percent", &filters));
    }

    #[test]
    fn equality_operators_use_tolerance() {
        assert!(ComparisonOperator::Equal.evaluate(80.0004, 80.0));
        assert!(!ComparisonOperator::Equal.evaluate(80.01, 80.0));
        assert!(ComparisonOperator::NotEqual.evaluate(80.01, 80.0));
        assert!(!ComparisonOperator::NotEqual.evaluate(80.0004, 80.0));
    }

    #[test]
    fn data_points_are_capped_at_the_tail() {
        let mut alert = Alert {
            id: Uuid::new_v4(),
            title: "cpu high".into(),
            message: "cpu above threshold".into(),
            severity: AlertSeverity::Warning,
            category: "resource".into(),
            host_id: None,
            service_id: None,
            rule_id: "rule-1".into(),
            threshold_value: 80.0,
            actual_value: 0.0,
            unit: "%".into(),
            tags: vec![],
            data_points: vec![],
            fingerprint: "fp".into(),
            status: AlertStatus::Active,
            actions: vec![],
            notifications: vec![],
            escalation_level: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            acknowledged_at: None,
            escalated_at: None,
            resolved_at: None,
        };

        for i in 0..(DATA_POINT_CAP + 20) {
            alert.push_data_point(i as f64);
        }
        assert_eq!(alert.data_points.len(), DATA_POINT_CAP);
        // Oldest points were dropped; the newest survives at the tail.
        assert_eq!(alert.data_points.last().unwrap().value, (DATA_POINT_CAP + 19) as f64);
        assert_eq!(alert.actual_value, (DATA_POINT_CAP + 19) as f64);
    }

    #[test]
    fn rule_validation_enforces_interval_and_threshold() {
        let mut rule = AlertRule {
            id: "r1".into(),
            name: "cpu".into(),
            enabled: true,
            category: "resource".into(),
            severity: AlertSeverity::Warning,
            condition: AlertCondition {
                metric: "cpu_usage_percent".into(),
                operator: ComparisonOperator::GreaterThan,
                threshold: 80.0,
                aggregation: AggregationKind::Avg,
                filters: HashMap::new(),
            },
            evaluation_interval_seconds: 60,
            evaluation_window_seconds: 300,
            minimum_data_points: 3,
            tags: vec![],
            notification_channels: vec![],
            suppression_rules: vec![],
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(rule.validate().is_ok());

        rule.evaluation_interval_seconds = 600;
        assert!(rule.validate().is_err());

        rule.evaluation_interval_seconds = 60;
        rule.condition.threshold = f64::NAN;
        assert!(rule.validate().is_err());
    }
}
