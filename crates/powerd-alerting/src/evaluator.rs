//! Alert rule evaluation worker.
//!
//! A single background cycle runs on the configured interval: each enabled
//! rule (past its own last-eval gate) is evaluated against the metrics
//! aggregation port, firing rules create or extend alerts, and quiet rules
//! auto-resolve their open alert. A process-wide mutex with a short acquire
//! timeout keeps cycles from overlapping.

use crate::model::AlertStatus;
use crate::notify::NotificationDispatcher;
use crate::rules::AlertRuleStore;
use crate::store::{AlertStore, CreateAlertRequest};
use chrono::Utc;
use powerd_core::cache::{keys, ttl};
use powerd_core::config::AlertingConfig;
use powerd_core::{aggregate, CacheStore, MetricsProvider, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const CYCLE_LOCK_TIMEOUT: Duration = Duration::from_secs(1);
const CYCLE_ERROR_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub rules_evaluated: usize,
    pub rules_skipped: usize,
    pub alerts_triggered: usize,
    pub alerts_resolved: usize,
    pub duration_ms: u64,
    pub timestamp: Option<chrono::DateTime<Utc>>,
}

pub struct AlertEvaluator {
    rules: Arc<AlertRuleStore>,
    alerts: Arc<AlertStore>,
    metrics: Arc<dyn MetricsProvider>,
    cache: Arc<dyn CacheStore>,
    dispatcher: Arc<NotificationDispatcher>,
    config: AlertingConfig,
    cycle_lock: Mutex<()>,
}

impl AlertEvaluator {
    pub fn new(
        rules: Arc<AlertRuleStore>,
        alerts: Arc<AlertStore>,
        metrics: Arc<dyn MetricsProvider>,
        cache: Arc<dyn CacheStore>,
        dispatcher: Arc<NotificationDispatcher>,
        config: AlertingConfig,
    ) -> Self {
        Self {
            rules,
            alerts,
            metrics,
            cache,
            dispatcher,
            config,
            cycle_lock: Mutex::new(()),
        }
    }

    /// Long-running worker loop. Cycle errors are logged and backed off
    /// without killing the worker.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.evaluation_interval_seconds.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = cancel.cancelled() => return Ok(()),
            }

            if let Err(e) = self.run_cycle().await {
                tracing::error!("alert evaluation cycle failed: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(CYCLE_ERROR_BACKOFF) => {}
                    _ = cancel.cancelled() => return Ok(()),
                }
            }
        }
    }

    /// One evaluation pass over all enabled rules.
    pub async fn run_cycle(&self) -> Result<CycleMetrics> {
        let _guard = match tokio::time::timeout(CYCLE_LOCK_TIMEOUT, self.cycle_lock.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                tracing::warn!("evaluation cycle skipped: previous cycle still running");
                return Ok(CycleMetrics::default());
            }
        };

        let started = tokio::time::Instant::now();
        let mut cycle = CycleMetrics {
            timestamp: Some(Utc::now()),
            ..CycleMetrics::default()
        };

        let rules = self.rules.list_rules(false).await?;
        for rule in rules {
            if !self.due_for_evaluation(&rule.id, rule.evaluation_interval_seconds).await? {
                cycle.rules_skipped += 1;
                continue;
            }
            if rule.suppressed_at(Utc::now()) {
                cycle.rules_skipped += 1;
                continue;
            }

            cycle.rules_evaluated += 1;
            match self.evaluate_rule(&rule).await {
                Ok(RuleOutcome::Triggered) => cycle.alerts_triggered += 1,
                Ok(RuleOutcome::Resolved) => cycle.alerts_resolved += 1,
                Ok(RuleOutcome::Quiet) => {}
                Err(e) => {
                    tracing::warn!("evaluation of rule {} failed: {e}", rule.id);
                }
            }
        }

        cycle.duration_ms = started.elapsed().as_millis() as u64;
        self.record_cycle(&cycle).await?;
        Ok(cycle)
    }

    async fn due_for_evaluation(&self, rule_id: &str, interval_seconds: u64) -> Result<bool> {
        let key = keys::alert_rule_last_eval(rule_id);
        if let Some(raw) = self.cache.get_raw(&key).await? {
            if let Ok(last) = raw.parse::<i64>() {
                let elapsed = Utc::now().timestamp() - last;
                if elapsed >= 0 && (elapsed as u64) < interval_seconds {
                    return Ok(false);
                }
            }
        }
        self.cache
            .set_raw(
                &key,
                Utc::now().timestamp().to_string(),
                Some(ttl::RULE_LAST_EVAL),
            )
            .await?;
        Ok(true)
    }

    async fn evaluate_rule(&self, rule: &crate::model::AlertRule) -> Result<RuleOutcome> {
        let to = Utc::now();
        let from = to - chrono::Duration::seconds(rule.evaluation_window_seconds as i64);
        let samples = self
            .metrics
            .query_range(&rule.condition.metric, from, to, &rule.condition.filters)
            .await?;

        // Missing or insufficient data is neither firing nor quiet.
        if samples.is_empty() || samples.len() < rule.minimum_data_points {
            return Ok(RuleOutcome::Quiet);
        }

        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        let Some(value) = aggregate(&values, rule.condition.aggregation) else {
            return Ok(RuleOutcome::Quiet);
        };

        if rule.condition.operator.evaluate(value, rule.condition.threshold) {
            self.handle_firing(rule, value).await?;
            Ok(RuleOutcome::Triggered)
        } else {
            self.handle_quiet(rule).await
        }
    }

    async fn handle_firing(&self, rule: &crate::model::AlertRule, value: f64) -> Result<()> {
        let fp = rule.fingerprint();

        let existing = match self.alerts.find_hot_by_fingerprint(&fp).await? {
            Some(alert) => Some(alert),
            None => self.alerts.find_open_by_rule(&rule.id).await?,
        };

        if let Some(alert) = existing {
            if alert.is_open() {
                self.alerts.append_data_point(alert.id, value).await?;
                return Ok(());
            }
        }

        let (alert, created) = self
            .alerts
            .create_alert(CreateAlertRequest {
                title: rule.name.clone(),
                message: format!(
                    "{} {} threshold {} (observed {value:.3})",
                    rule.condition.metric,
                    operator_label(rule.condition.operator),
                    rule.condition.threshold
                ),
                severity: rule.severity,
                category: rule.category.clone(),
                host_id: rule.condition.filters.get("host").cloned(),
                service_id: rule.condition.filters.get("service").cloned(),
                rule_id: rule.id.clone(),
                metric: rule.condition.metric.clone(),
                filters: rule.condition.filters.clone(),
                threshold_value: rule.condition.threshold,
                actual_value: value,
                unit: unit_for_metric(&rule.condition.metric),
                tags: rule.tags.clone(),
            })
            .await?;

        if created && !rule.notification_channels.is_empty() {
            self.dispatcher
                .dispatch_all(&alert, &rule.notification_channels)
                .await;
        }
        Ok(())
    }

    async fn handle_quiet(&self, rule: &crate::model::AlertRule) -> Result<RuleOutcome> {
        if let Some(alert) = self.alerts.find_open_by_rule(&rule.id).await? {
            if alert.status != AlertStatus::Resolved {
                self.alerts
                    .resolve(alert.id, "System", Some("Condition no longer met".into()))
                    .await?;
                return Ok(RuleOutcome::Resolved);
            }
        }
        Ok(RuleOutcome::Quiet)
    }

    /// Push the cycle record into the hourly history list (7-day TTL).
    async fn record_cycle(&self, cycle: &CycleMetrics) -> Result<()> {
        let bucket = Utc::now().format("%Y%m%d%H").to_string();
        let record = serde_json::to_string(cycle)?;
        self.cache
            .list_push(
                &keys::alert_evaluation_history(&bucket),
                record,
                Some(ttl::EVALUATION_HISTORY),
            )
            .await
    }
}

enum RuleOutcome {
    Triggered,
    Resolved,
    Quiet,
}

fn operator_label(op: crate::model::ComparisonOperator) -> &'static str {
    use crate::model::ComparisonOperator::*;
    match op {
        GreaterThan => "above",
        GreaterThanOrEqual => "at or above",
        LessThan => "below",
        LessThanOrEqual => "at or below",
        Equal => "equal to",
        NotEqual => "different from",
    }
}

fn unit_for_metric(metric: &str) -> String {
    if metric.ends_with("_percent") {
        "%".to_string()
    } else if metric.ends_with("_ms") {
        "ms".to_string()
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertCondition, AlertRule, AlertSeverity, ComparisonOperator};
    use crate::notify::NotificationDispatcher;
    use async_trait::async_trait;
    use powerd_core::{AggregationKind, InMemoryBus, MemoryCache, MetricSample};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Metrics provider returning a programmable sample set.
    struct ScriptedMetrics {
        samples: StdMutex<Vec<f64>>,
    }

    impl ScriptedMetrics {
        fn new(values: Vec<f64>) -> Self {
            Self {
                samples: StdMutex::new(values),
            }
        }

        fn set(&self, values: Vec<f64>) {
            *self.samples.lock().unwrap() = values;
        }
    }

    #[async_trait]
    impl MetricsProvider for ScriptedMetrics {
        async fn query_range(
            &self,
            _metric: &str,
            _from: chrono::DateTime<Utc>,
            _to: chrono::DateTime<Utc>,
            _filters: &HashMap<String, String>,
        ) -> Result<Vec<MetricSample>> {
            Ok(self
                .samples
                .lock()
                .unwrap()
                .iter()
                .map(|v| MetricSample {
                    timestamp: Utc::now(),
                    value: *v,
                })
                .collect())
        }
    }

    struct Fixture {
        evaluator: AlertEvaluator,
        alerts: Arc<AlertStore>,
        rules: Arc<AlertRuleStore>,
        metrics: Arc<ScriptedMetrics>,
    }

    fn fixture(samples: Vec<f64>) -> Fixture {
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
        let bus = Arc::new(InMemoryBus::default());
        let alerts = Arc::new(AlertStore::new(cache.clone(), bus.clone()));
        let rules = Arc::new(AlertRuleStore::new(cache.clone()));
        let metrics = Arc::new(ScriptedMetrics::new(samples));
        let dispatcher = Arc::new(NotificationDispatcher::new(alerts.clone()));
        let evaluator = AlertEvaluator::new(
            rules.clone(),
            alerts.clone(),
            metrics.clone(),
            cache,
            dispatcher,
            AlertingConfig::default(),
        );
        Fixture {
            evaluator,
            alerts,
            rules,
            metrics,
        }
    }

    fn cpu_rule() -> AlertRule {
        AlertRule {
            id: "cpu-high".into(),
            name: "CPU high".into(),
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
            // Interval 0 keeps every cycle due in tests.
            evaluation_interval_seconds: 0,
            evaluation_window_seconds: 300,
            minimum_data_points: 3,
            tags: vec![],
            notification_channels: vec![],
            suppression_rules: vec![],
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn firing_then_refiring_then_clearing_dedups_and_resolves() {
        let fixture = fixture(vec![85.0, 90.0, 88.0]);
        fixture.rules.create_rule(cpu_rule()).await.unwrap();

        // t=0: condition true, alert created.
        let cycle = fixture.evaluator.run_cycle().await.unwrap();
        assert_eq!(cycle.alerts_triggered, 1);
        let open = fixture
            .alerts
            .list_alerts(Some(AlertStatus::Active))
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].data_points.len(), 1);

        // t=60: still true, same alert gains a data point.
        let cycle = fixture.evaluator.run_cycle().await.unwrap();
        assert_eq!(cycle.alerts_triggered, 1);
        let open = fixture
            .alerts
            .list_alerts(Some(AlertStatus::Active))
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].data_points.len(), 2);

        // t=120: condition clears, System resolves.
        fixture.metrics.set(vec![40.0, 42.0, 38.0]);
        let cycle = fixture.evaluator.run_cycle().await.unwrap();
        assert_eq!(cycle.alerts_resolved, 1);
        let resolved = fixture
            .alerts
            .list_alerts(Some(AlertStatus::Resolved))
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
        let resolution = resolved[0]
            .actions
            .iter()
            .find(|a| a.action == "resolved")
            .unwrap();
        assert_eq!(resolution.user, "System");
        assert_eq!(
            resolution.comment.as_deref(),
            Some("Condition no longer met")
        );
    }

    #[tokio::test]
    async fn insufficient_data_points_do_not_fire() {
        let fixture = fixture(vec![95.0, 96.0]);
        let mut rule = cpu_rule();
        rule.minimum_data_points = 3;
        fixture.rules.create_rule(rule).await.unwrap();

        let cycle = fixture.evaluator.run_cycle().await.unwrap();
        assert_eq!(cycle.alerts_triggered, 0);
        assert!(fixture
            .alerts
            .list_alerts(Some(AlertStatus::Active))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn missing_data_neither_fires_nor_resolves() {
        let fixture = fixture(vec![95.0, 96.0, 97.0]);
        fixture.rules.create_rule(cpu_rule()).await.unwrap();
        fixture.evaluator.run_cycle().await.unwrap();

        // Data disappears entirely: the open alert must survive.
        fixture.metrics.set(vec![]);
        let cycle = fixture.evaluator.run_cycle().await.unwrap();
        assert_eq!(cycle.alerts_resolved, 0);
        assert_eq!(
            fixture
                .alerts
                .list_alerts(Some(AlertStatus::Active))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn evaluation_interval_gates_rules_between_cycles() {
        let fixture = fixture(vec![95.0, 96.0, 97.0]);
        let mut rule = cpu_rule();
        rule.evaluation_interval_seconds = 300;
        fixture.rules.create_rule(rule).await.unwrap();

        let first = fixture.evaluator.run_cycle().await.unwrap();
        assert_eq!(first.rules_evaluated, 1);

        let second = fixture.evaluator.run_cycle().await.unwrap();
        assert_eq!(second.rules_evaluated, 0);
        assert_eq!(second.rules_skipped, 1);
    }

    #[tokio::test]
    async fn disabled_rules_are_not_evaluated() {
        let fixture = fixture(vec![95.0, 96.0, 97.0]);
        let mut rule = cpu_rule();
        rule.enabled = false;
        fixture.rules.create_rule(rule).await.unwrap();

        let cycle = fixture.evaluator.run_cycle().await.unwrap();
        assert_eq!(cycle.rules_evaluated, 0);
        assert_eq!(cycle.alerts_triggered, 0);
    }
}
