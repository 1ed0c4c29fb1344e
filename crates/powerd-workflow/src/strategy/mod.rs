//! Deployment strategy planners.
//!
//! A planner is a pure function from a deployment request to an ordered
//! phase list; the executor is strategy-agnostic. Planners also validate the
//! strategy configuration up front so a malformed request never reaches the
//! executor.

mod blue_green;
mod canary;
mod rolling;

pub use blue_green::BlueGreenPlanner;
pub use canary::CanaryPlanner;
pub use rolling::RollingPlanner;

use crate::model::{Phase, Step, StepType, StrategyKind, WorkflowRequest};
use powerd_core::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub trait StrategyPlanner: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Reject configurations missing the strategy's required sections/keys.
    fn validate_configuration(&self, config: &HashMap<String, Value>) -> Result<()>;

    fn plan(&self, request: &WorkflowRequest) -> Result<Vec<Phase>>;

    /// Informational estimate; not enforced.
    fn estimate_duration(&self, request: &WorkflowRequest) -> Duration;
}

/// Registry of planners keyed by strategy tag.
pub struct StrategyRegistry {
    planners: HashMap<StrategyKind, Arc<dyn StrategyPlanner>>,
}

impl StrategyRegistry {
    pub fn with_defaults() -> Self {
        let mut planners: HashMap<StrategyKind, Arc<dyn StrategyPlanner>> = HashMap::new();
        planners.insert(StrategyKind::Rolling, Arc::new(RollingPlanner));
        planners.insert(StrategyKind::BlueGreen, Arc::new(BlueGreenPlanner));
        planners.insert(StrategyKind::Canary, Arc::new(CanaryPlanner));
        Self { planners }
    }

    pub fn get(&self, kind: StrategyKind) -> Result<Arc<dyn StrategyPlanner>> {
        self.planners
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::invalid_configuration(format!("unknown strategy {kind}")))
    }
}

// --- configuration access -------------------------------------------------

pub(crate) fn required_section<'a>(
    config: &'a HashMap<String, Value>,
    key: &str,
) -> Result<&'a Value> {
    config
        .get(key)
        .ok_or_else(|| Error::invalid_configuration(format!("missing required section {key}")))
}

pub(crate) fn section_str<'a>(section: &'a Value, key: &str, context: &str) -> Result<&'a str> {
    section
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::invalid_configuration(format!("{context} requires {key}")))
}

pub(crate) fn section_u64(section: &Value, key: &str) -> Option<u64> {
    section.get(key).and_then(Value::as_u64)
}

pub(crate) fn section_f64(section: &Value, key: &str) -> Option<f64> {
    section.get(key).and_then(Value::as_f64)
}

pub(crate) fn section_bool(section: &Value, key: &str) -> Option<bool> {
    section.get(key).and_then(Value::as_bool)
}

pub(crate) fn section_str_list(section: &Value, key: &str) -> Option<Vec<String>> {
    section.get(key).and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
}

// --- shared step builders -------------------------------------------------

pub(crate) fn deploy_step(server: &str) -> Step {
    Step::new(format!("Deploy to {server}"), StepType::Deploy, Some(server))
}

/// One logical step for a whole server batch; the executor hands it to the
/// external parallel worker instead of fanning out per-host commands.
pub(crate) fn batch_deploy_step(servers: &[String]) -> Step {
    Step::new("Batch deploy", StepType::Deploy, None)
        .with_param("servers", serde_json::json!(servers))
        .with_param("parallel", serde_json::json!(true))
}

pub(crate) fn service_start_step(server: &str, service: &str) -> Step {
    Step::new(
        format!("Start {service} on {server}"),
        StepType::ServiceStart,
        Some(server),
    )
}

pub(crate) fn service_stop_step(server: &str, service: &str) -> Step {
    Step::new(
        format!("Stop {service} on {server}"),
        StepType::ServiceStop,
        Some(server),
    )
}

pub(crate) fn health_check_step(server: &str) -> Step {
    Step::new(format!("Health check {server}"), StepType::HealthCheck, Some(server))
}

pub(crate) fn wait_for_healthy_step(server: &str, timeout_seconds: u64) -> Step {
    Step::new(
        format!("Wait for healthy {server}"),
        StepType::WaitForHealthy,
        Some(server),
    )
    .with_param("timeout_seconds", serde_json::json!(timeout_seconds))
    .with_param("critical", serde_json::json!(true))
}

pub(crate) fn lb_remove_step(server: &str) -> Step {
    Step::new(
        format!("Remove {server} from load balancer"),
        StepType::TrafficSwitch,
        Some(server),
    )
    .with_param("action", serde_json::json!("remove"))
}

pub(crate) fn lb_add_step(server: &str) -> Step {
    Step::new(
        format!("Add {server} to load balancer"),
        StepType::TrafficSwitch,
        Some(server),
    )
    .with_param("action", serde_json::json!("add"))
}

pub(crate) fn validation_step(name: &str) -> Step {
    Step::new(name, StepType::Validation, None)
}

pub(crate) fn cleanup_step(name: &str, server: Option<&str>) -> Step {
    Step::new(name, StepType::Cleanup, server)
}

/// Chunk servers into fixed-size waves, dropping the empty tail.
pub(crate) fn chunk_servers(servers: &[String], size: usize) -> Vec<Vec<String>> {
    if size == 0 {
        return Vec::new();
    }
    servers
        .chunks(size)
        .map(|chunk| chunk.to_vec())
        .filter(|chunk| !chunk.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_all_builtin_strategies() {
        let registry = StrategyRegistry::with_defaults();
        for kind in [StrategyKind::Rolling, StrategyKind::BlueGreen, StrategyKind::Canary] {
            assert_eq!(registry.get(kind).unwrap().kind(), kind);
        }
    }

    #[test]
    fn chunking_drops_empty_waves() {
        let servers: Vec<String> = (1..=5).map(|i| format!("web-{i:02}")).collect();
        let waves = chunk_servers(&servers, 2);
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[2], vec!["web-05"]);
        assert!(chunk_servers(&servers, 0).is_empty());
    }
}
