//! Canary deployment planner.
//!
//! A small canary cohort takes the new version under live traffic; the
//! monitoring phase watches rollback triggers for the configured duration
//! before the rest of the fleet deploys in batches.

use super::*;
use powerd_core::Error;

const DEFAULT_HEALTH_TIMEOUT_SECONDS: u64 = 300;
const DEFAULT_BATCH_SIZE: u64 = 3;

pub struct CanaryPlanner;

impl StrategyPlanner for CanaryPlanner {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Canary
    }

    fn validate_configuration(&self, config: &HashMap<String, Value>) -> Result<()> {
        let canary = required_section(config, "CanaryConfiguration")?;
        let pct = section_f64(canary, "CanaryPercentage").unwrap_or(0.0);
        if pct <= 0.0 || pct > 100.0 {
            return Err(Error::invalid_configuration(
                "CanaryPercentage must be in (0, 100]",
            ));
        }

        let splitting = required_section(config, "TrafficSplitting")?;
        section_str(splitting, "Strategy", "TrafficSplitting")?;

        let monitoring = required_section(config, "MonitoringConfiguration")?;
        if section_str_list(monitoring, "RequiredMetrics").map_or(true, |m| m.is_empty()) {
            return Err(Error::invalid_configuration(
                "MonitoringConfiguration requires a non-empty RequiredMetrics list",
            ));
        }
        Ok(())
    }

    fn plan(&self, request: &WorkflowRequest) -> Result<Vec<Phase>> {
        self.validate_configuration(&request.configuration)?;
        let canary_config = required_section(&request.configuration, "CanaryConfiguration")?;
        let splitting = required_section(&request.configuration, "TrafficSplitting")?;

        let (canary, production) = split_cohorts(request, canary_config);
        let monitoring_duration = section_u64(canary_config, "MonitoringDuration").unwrap_or(600);
        let batch_size = section_u64(canary_config, "BatchSize")
            .unwrap_or(DEFAULT_BATCH_SIZE)
            .max(1) as usize;
        let batch_delay = section_u64(canary_config, "BatchDelay").unwrap_or(0);
        let split_strategy = section_str(splitting, "Strategy", "TrafficSplitting")?;
        let service = &request.service_name;

        let mut phases = Vec::new();

        phases.push(
            Phase::new("Pre-Deployment", request.target_servers.clone())
                .with_steps(vec![
                    validation_step("Verify package availability"),
                    validation_step("Verify canary cohort selection"),
                ])
                .with_max_retries(1),
        );

        phases.push(
            Phase::new("Canary Deployment", canary.clone())
                .with_steps(
                    canary
                        .iter()
                        .flat_map(|s| {
                            vec![
                                deploy_step(s),
                                service_start_step(s, service),
                                wait_for_healthy_step(s, DEFAULT_HEALTH_TIMEOUT_SECONDS),
                            ]
                        })
                        .collect(),
                )
                .with_max_retries(2)
                .with_rollback_on_failure(true),
        );

        phases.push(
            Phase::new("Canary Validation", canary.clone())
                .with_steps({
                    let mut steps: Vec<Step> = canary.iter().map(|s| health_check_step(s)).collect();
                    steps.push(validation_step("Smoke test canary cohort"));
                    steps
                })
                .with_max_retries(1)
                .with_rollback_on_failure(true),
        );

        phases.push(
            Phase::new("Traffic Routing Setup", canary.clone())
                .with_steps(vec![Step::new(
                    "Route canary traffic share",
                    StepType::TrafficSwitch,
                    None,
                )
                .with_param("action", serde_json::json!("switch"))
                .with_param("strategy", serde_json::json!(split_strategy))
                .with_param("to", serde_json::json!(canary))])
                .with_max_retries(2)
                .with_rollback_on_failure(true),
        );

        let mut monitoring = validation_step("Canary monitoring")
            .with_param(
                "monitoring_duration_seconds",
                serde_json::json!(monitoring_duration),
            )
            .with_param("critical", serde_json::json!(true));
        if let Some(triggers) = canary_config.get("RollbackTriggers") {
            monitoring = monitoring.with_param("rollback_triggers", triggers.clone());
        }
        phases.push(
            Phase::new("Canary Monitoring", canary.clone())
                .with_steps(vec![monitoring])
                .with_timeout(monitoring_duration + 300)
                .with_rollback_on_failure(true),
        );

        if !production.is_empty() {
            let batches = chunk_servers(&production, batch_size);
            let mut steps = Vec::new();
            for (index, batch) in batches.iter().enumerate() {
                let mut deploy = batch_deploy_step(batch);
                if batch_delay > 0 && index > 0 {
                    deploy =
                        deploy.with_param("delay_before_seconds", serde_json::json!(batch_delay));
                }
                steps.push(deploy);
                steps.extend(
                    batch
                        .iter()
                        .map(|s| wait_for_healthy_step(s, DEFAULT_HEALTH_TIMEOUT_SECONDS)),
                );
            }
            phases.push(
                Phase::new("Production Deployment", production.clone())
                    .with_steps(steps)
                    .with_max_retries(2)
                    .with_rollback_on_failure(true),
            );
        }

        phases.push(
            Phase::new("Post-Deployment Validation", request.target_servers.clone())
                .with_steps(
                    request
                        .target_servers
                        .iter()
                        .map(|s| health_check_step(s))
                        .collect(),
                )
                .with_max_retries(1),
        );

        phases.push(
            Phase::new("Canary Cleanup", request.target_servers.clone()).with_steps(vec![
                cleanup_step("Restore uniform traffic weights", None),
                cleanup_step("Remove superseded packages", None),
            ]),
        );

        Ok(phases)
    }

    fn estimate_duration(&self, request: &WorkflowRequest) -> Duration {
        let monitoring = required_section(&request.configuration, "CanaryConfiguration")
            .ok()
            .and_then(|c| section_u64(c, "MonitoringDuration"))
            .unwrap_or(600);
        Duration::from_secs(300 + monitoring + request.target_servers.len() as u64 * 60)
    }
}

/// Canary cohort selection: explicit list wins, else the first
/// ⌈N · pct / 100⌉ targets.
fn split_cohorts(request: &WorkflowRequest, canary_config: &Value) -> (Vec<String>, Vec<String>) {
    let targets = &request.target_servers;

    if let Some(explicit) = section_str_list(canary_config, "CanaryServers") {
        if !explicit.is_empty() {
            let canary: Vec<String> = targets
                .iter()
                .filter(|s| explicit.contains(s))
                .cloned()
                .collect();
            let production: Vec<String> = targets
                .iter()
                .filter(|s| !explicit.contains(s))
                .cloned()
                .collect();
            return (canary, production);
        }
    }

    let pct = section_f64(canary_config, "CanaryPercentage").unwrap_or(10.0);
    let count = ((targets.len() as f64 * pct / 100.0).ceil() as usize)
        .clamp(1, targets.len().max(1));
    let canary = targets.iter().take(count).cloned().collect();
    let production = targets.iter().skip(count).cloned().collect();
    (canary, production)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request(servers: &[&str], canary_config: Value) -> WorkflowRequest {
        let mut configuration = HashMap::new();
        configuration.insert("CanaryConfiguration".to_string(), canary_config);
        configuration.insert(
            "TrafficSplitting".to_string(),
            serde_json::json!({ "Strategy": "Weighted" }),
        );
        configuration.insert(
            "MonitoringConfiguration".to_string(),
            serde_json::json!({ "RequiredMetrics": ["error_rate", "latency_p99"] }),
        );
        WorkflowRequest {
            name: "canary rollout".into(),
            strategy: StrategyKind::Canary,
            target_servers: servers.iter().map(|s| s.to_string()).collect(),
            service_name: "billing".into(),
            version: "2.1.0".into(),
            package_url: "https://packages.internal/billing-2.1.0.tar.gz".into(),
            configuration,
            rollback: None,
            created_by: "op".into(),
            timeout_seconds: None,
        }
    }

    #[test]
    fn twenty_percent_of_ten_hosts_is_two_canaries() {
        let servers: Vec<String> = (1..=10).map(|i| format!("h{i}")).collect();
        let refs: Vec<&str> = servers.iter().map(String::as_str).collect();
        let request = request(
            &refs,
            serde_json::json!({ "CanaryPercentage": 20.0, "MonitoringDuration": 600 }),
        );
        let phases = CanaryPlanner.plan(&request).unwrap();
        let canary_deploy = phases.iter().find(|p| p.name == "Canary Deployment").unwrap();
        assert_eq!(canary_deploy.target_servers, vec!["h1", "h2"]);
        let production = phases
            .iter()
            .find(|p| p.name == "Production Deployment")
            .unwrap();
        assert_eq!(production.target_servers.len(), 8);
    }

    #[test]
    fn full_canary_collapses_production_phase() {
        let request = request(
            &["h1", "h2", "h3"],
            serde_json::json!({ "CanaryPercentage": 100.0 }),
        );
        let phases = CanaryPlanner.plan(&request).unwrap();
        assert!(phases.iter().all(|p| p.name != "Production Deployment"));
        let canary_deploy = phases.iter().find(|p| p.name == "Canary Deployment").unwrap();
        assert_eq!(canary_deploy.target_servers.len(), 3);
    }

    #[test]
    fn explicit_canary_servers_win_over_percentage() {
        let request = request(
            &["h1", "h2", "h3"],
            serde_json::json!({ "CanaryPercentage": 10.0, "CanaryServers": ["h3"] }),
        );
        let phases = CanaryPlanner.plan(&request).unwrap();
        let canary_deploy = phases.iter().find(|p| p.name == "Canary Deployment").unwrap();
        assert_eq!(canary_deploy.target_servers, vec!["h3"]);
    }

    #[test]
    fn production_batches_respect_batch_size_and_delay() {
        let servers: Vec<String> = (1..=7).map(|i| format!("h{i}")).collect();
        let refs: Vec<&str> = servers.iter().map(String::as_str).collect();
        let request = request(
            &refs,
            serde_json::json!({
                "CanaryPercentage": 15.0,
                "BatchSize": 2,
                "BatchDelay": 30,
            }),
        );
        let phases = CanaryPlanner.plan(&request).unwrap();
        // ceil(7 * 0.15) = 2 canaries, 5 production hosts in batches of 2.
        let production = phases
            .iter()
            .find(|p| p.name == "Production Deployment")
            .unwrap();
        let deploys: Vec<&Step> = production
            .steps
            .iter()
            .filter(|s| s.step_type == StepType::Deploy)
            .collect();
        assert_eq!(deploys.len(), 3);
        assert_eq!(deploys[0].param_u64("delay_before_seconds"), None);
        assert_eq!(deploys[1].param_u64("delay_before_seconds"), Some(30));
    }

    #[test]
    fn monitoring_step_carries_triggers_and_is_critical() {
        let request = request(
            &["h1", "h2"],
            serde_json::json!({
                "CanaryPercentage": 50.0,
                "MonitoringDuration": 120,
                "RollbackTriggers": { "ErrorRateThreshold": 5.0 },
            }),
        );
        let phases = CanaryPlanner.plan(&request).unwrap();
        let monitoring = phases.iter().find(|p| p.name == "Canary Monitoring").unwrap();
        assert!(monitoring.rollback_on_failure);
        let step = &monitoring.steps[0];
        assert!(step.is_critical());
        assert_eq!(step.param_u64("monitoring_duration_seconds"), Some(120));
        assert_eq!(
            step.parameters["rollback_triggers"]["ErrorRateThreshold"],
            serde_json::json!(5.0)
        );
    }

    #[test]
    fn out_of_range_percentage_fails_validation() {
        for pct in [0.0, -5.0, 150.0] {
            let request = request(&["h1"], serde_json::json!({ "CanaryPercentage": pct }));
            assert!(CanaryPlanner
                .validate_configuration(&request.configuration)
                .is_err());
        }
    }

    #[test]
    fn missing_required_metrics_fail_validation() {
        let mut request = request(&["h1"], serde_json::json!({ "CanaryPercentage": 20.0 }));
        request.configuration.insert(
            "MonitoringConfiguration".to_string(),
            serde_json::json!({ "RequiredMetrics": [] }),
        );
        assert!(CanaryPlanner
            .validate_configuration(&request.configuration)
            .is_err());
    }
}
