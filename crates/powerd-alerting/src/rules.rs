//! Alert rule store: cache-backed CRUD with an in-memory index.
//!
//! Builtin rules are seeded idempotently at startup under stable ids so
//! restarts never duplicate them.

use crate::model::{AlertCondition, AlertRule, AlertSeverity, ComparisonOperator};
use chrono::Utc;
use powerd_core::cache::{keys, ttl};
use powerd_core::config::AlertingConfig;
use powerd_core::{AggregationKind, CacheStore, CacheStoreExt, Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub struct AlertRuleStore {
    cache: Arc<dyn CacheStore>,
    index: RwLock<HashMap<String, AlertRule>>,
}

impl AlertRuleStore {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self {
            cache,
            index: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the in-memory index from the cache (startup path).
    pub async fn load(&self) -> Result<usize> {
        let ids = self.cache.set_members(keys::ALERT_RULES).await?;
        let mut index = self.index.write().await;
        index.clear();
        for id in ids {
            if let Some(rule) = self.cache.get_json::<AlertRule>(&keys::alert_rule(&id)).await? {
                index.insert(rule.id.clone(), rule);
            }
        }
        Ok(index.len())
    }

    /// Seed the builtin rule set from the configured thresholds. Existing
    /// rules (by stable id) are left untouched.
    pub async fn seed_builtin_rules(&self, config: &AlertingConfig) -> Result<usize> {
        let mut seeded = 0;
        for rule in builtin_rules(config) {
            if self.get_rule(&rule.id).await.is_ok() {
                continue;
            }
            self.persist(rule).await?;
            seeded += 1;
        }
        if seeded > 0 {
            tracing::info!("seeded {seeded} builtin alert rules");
        }
        Ok(seeded)
    }

    pub async fn create_rule(&self, mut rule: AlertRule) -> Result<AlertRule> {
        rule.validate()?;
        if self.get_rule(&rule.id).await.is_ok() {
            return Err(Error::invalid_state(format!("rule {} already exists", rule.id)));
        }
        rule.version = 1;
        rule.created_at = Utc::now();
        rule.updated_at = rule.created_at;
        self.persist(rule.clone()).await?;
        Ok(rule)
    }

    /// Replace a rule's definition, bumping its version counter.
    pub async fn update_rule(&self, mut rule: AlertRule) -> Result<AlertRule> {
        rule.validate()?;
        let existing = self.get_rule(&rule.id).await?;
        rule.version = existing.version + 1;
        rule.created_at = existing.created_at;
        rule.updated_at = Utc::now();
        self.persist(rule.clone()).await?;
        Ok(rule)
    }

    pub async fn get_rule(&self, id: &str) -> Result<AlertRule> {
        if let Some(rule) = self.index.read().await.get(id) {
            return Ok(rule.clone());
        }
        match self.cache.get_json::<AlertRule>(&keys::alert_rule(id)).await? {
            Some(rule) => {
                self.index.write().await.insert(rule.id.clone(), rule.clone());
                Ok(rule)
            }
            None => Err(Error::not_found(format!("alert rule {id}"))),
        }
    }

    pub async fn list_rules(&self, include_disabled: bool) -> Result<Vec<AlertRule>> {
        let index = self.index.read().await;
        let mut rules: Vec<AlertRule> = index
            .values()
            .filter(|r| include_disabled || r.enabled)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules)
    }

    pub async fn delete_rule(&self, id: &str) -> Result<()> {
        self.get_rule(id).await?;
        self.cache.remove(&keys::alert_rule(id)).await?;
        self.cache.set_remove(keys::ALERT_RULES, id).await?;
        self.index.write().await.remove(id);
        Ok(())
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<AlertRule> {
        let mut rule = self.get_rule(id).await?;
        rule.enabled = enabled;
        rule.updated_at = Utc::now();
        rule.version += 1;
        self.persist(rule.clone()).await?;
        Ok(rule)
    }

    /// Copy a rule under a fresh id; the copy starts disabled and tagged
    /// `duplicated`.
    pub async fn duplicate_rule(&self, id: &str) -> Result<AlertRule> {
        let source = self.get_rule(id).await?;
        let mut copy = source.clone();
        copy.id = Uuid::new_v4().to_string();
        copy.name = format!("{} (copy)", source.name);
        copy.enabled = false;
        if !copy.tags.iter().any(|t| t == "duplicated") {
            copy.tags.push("duplicated".to_string());
        }
        copy.version = 1;
        copy.created_at = Utc::now();
        copy.updated_at = copy.created_at;
        self.persist(copy.clone()).await?;
        Ok(copy)
    }

    async fn persist(&self, rule: AlertRule) -> Result<()> {
        self.cache
            .set_json(&keys::alert_rule(&rule.id), &rule, Some(ttl::ALERT_RULE))
            .await?;
        self.cache.set_add(keys::ALERT_RULES, &rule.id).await?;
        self.index.write().await.insert(rule.id.clone(), rule);
        Ok(())
    }
}

/// Builtin rules derived from the configured per-metric thresholds.
fn builtin_rules(config: &AlertingConfig) -> Vec<AlertRule> {
    let now = Utc::now();
    let base = |id: &str, name: &str, metric: &str, severity: AlertSeverity, threshold: f64| {
        AlertRule {
            id: id.to_string(),
            name: name.to_string(),
            enabled: true,
            category: "resource".to_string(),
            severity,
            condition: AlertCondition {
                metric: metric.to_string(),
                operator: ComparisonOperator::GreaterThan,
                threshold,
                aggregation: AggregationKind::Avg,
                filters: HashMap::new(),
            },
            evaluation_interval_seconds: config.evaluation_interval_seconds,
            evaluation_window_seconds: config.evaluation_window_seconds,
            minimum_data_points: config.minimum_data_points,
            tags: vec!["builtin".to_string()],
            notification_channels: Vec::new(),
            suppression_rules: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    };

    let mut rules = vec![
        base(
            "builtin-cpu-high",
            "CPU usage high",
            "cpu_usage_percent",
            AlertSeverity::Warning,
            config.cpu.warning,
        ),
        base(
            "builtin-cpu-critical",
            "CPU usage critical",
            "cpu_usage_percent",
            AlertSeverity::Critical,
            config.cpu.critical,
        ),
        base(
            "builtin-memory-high",
            "Memory usage high",
            "memory_usage_percent",
            AlertSeverity::Warning,
            config.memory.warning,
        ),
        base(
            "builtin-disk-high",
            "Disk usage high",
            "disk_usage_percent",
            AlertSeverity::Warning,
            config.disk.warning,
        ),
        base(
            "builtin-network-high",
            "Network utilization high",
            "network_usage_percent",
            AlertSeverity::Warning,
            config.network.warning,
        ),
    ];

    let mut failure_rate = base(
        "builtin-deployment-failure-rate",
        "Deployment failure rate high",
        "deployment_failure_rate",
        AlertSeverity::Warning,
        config.deployment_failure_rate_warning,
    );
    failure_rate.category = "deployment".to_string();
    rules.push(failure_rate);

    let mut response_time = base(
        "builtin-service-response-time",
        "Service response time high",
        "service_response_time_ms",
        AlertSeverity::Warning,
        config.service_response_time_warning_ms,
    );
    response_time.category = "service".to_string();
    response_time.condition.aggregation = AggregationKind::P95;
    rules.push(response_time);

    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use powerd_core::MemoryCache;

    fn store() -> AlertRuleStore {
        AlertRuleStore::new(Arc::new(MemoryCache::new()))
    }

    fn sample_rule(id: &str) -> AlertRule {
        AlertRule {
            id: id.to_string(),
            name: "latency".into(),
            enabled: true,
            category: "service".into(),
            severity: AlertSeverity::Warning,
            condition: AlertCondition {
                metric: "service_response_time_ms".into(),
                operator: ComparisonOperator::GreaterThan,
                threshold: 500.0,
                aggregation: AggregationKind::P95,
                filters: HashMap::new(),
            },
            evaluation_interval_seconds: 60,
            evaluation_window_seconds: 300,
            minimum_data_points: 3,
            tags: vec![],
            notification_channels: vec!["ops-email".into()],
            suppression_rules: vec![],
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let store = store();
        let config = AlertingConfig::default();

        let first = store.seed_builtin_rules(&config).await.unwrap();
        assert!(first >= 5);
        let second = store.seed_builtin_rules(&config).await.unwrap();
        assert_eq!(second, 0);

        let cpu = store.get_rule("builtin-cpu-high").await.unwrap();
        assert_eq!(cpu.condition.threshold, config.cpu.warning);
    }

    #[tokio::test]
    async fn update_bumps_version() {
        let store = store();
        store.create_rule(sample_rule("r1")).await.unwrap();

        let mut changed = store.get_rule("r1").await.unwrap();
        changed.condition.threshold = 750.0;
        let updated = store.update_rule(changed).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.condition.threshold, 750.0);
    }

    #[tokio::test]
    async fn disable_and_enable_flip_the_flag() {
        let store = store();
        store.create_rule(sample_rule("r1")).await.unwrap();

        let disabled = store.set_enabled("r1", false).await.unwrap();
        assert!(!disabled.enabled);
        assert!(store.list_rules(false).await.unwrap().is_empty());
        assert_eq!(store.list_rules(true).await.unwrap().len(), 1);

        let enabled = store.set_enabled("r1", true).await.unwrap();
        assert!(enabled.enabled);
    }

    #[tokio::test]
    async fn duplicate_starts_disabled_with_fresh_id() {
        let store = store();
        store.create_rule(sample_rule("r1")).await.unwrap();

        let copy = store.duplicate_rule("r1").await.unwrap();
        assert_ne!(copy.id, "r1");
        assert!(!copy.enabled);
        assert!(copy.tags.contains(&"duplicated".to_string()));
        assert_eq!(copy.version, 1);
        assert!(copy.name.ends_with("(copy)"));
    }

    #[tokio::test]
    async fn delete_removes_from_index_and_cache() {
        let store = store();
        store.create_rule(sample_rule("r1")).await.unwrap();
        store.delete_rule("r1").await.unwrap();
        assert!(store.get_rule("r1").await.is_err());
        assert!(store.list_rules(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_rebuilds_index_from_cache() {
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
        let store = AlertRuleStore::new(cache.clone());
        store.create_rule(sample_rule("r1")).await.unwrap();

        let rebuilt = AlertRuleStore::new(cache);
        assert_eq!(rebuilt.load().await.unwrap(), 1);
        assert!(rebuilt.get_rule("r1").await.is_ok());
    }

    #[tokio::test]
    async fn invalid_rule_is_rejected() {
        let store = store();
        let mut bad = sample_rule("r1");
        bad.evaluation_interval_seconds = 900;
        assert!(matches!(
            store.create_rule(bad).await,
            Err(Error::InvalidConfiguration(_))
        ));
    }
}
