//! Blue/green deployment planner.
//!
//! The green half receives the new version while blue keeps serving; a
//! single traffic-switch phase moves the fleet over, and the old blue side
//! is retired only after validation.

use super::*;
use powerd_core::Error;

const DEFAULT_HEALTH_TIMEOUT_SECONDS: u64 = 300;
const POST_SWITCH_MONITOR_SECONDS: u64 = 300;

pub struct BlueGreenPlanner;

impl StrategyPlanner for BlueGreenPlanner {
    fn kind(&self) -> StrategyKind {
        StrategyKind::BlueGreen
    }

    fn validate_configuration(&self, config: &HashMap<String, Value>) -> Result<()> {
        required_section(config, "BlueEnvironment")?;
        required_section(config, "GreenEnvironment")?;
        let lb = required_section(config, "LoadBalancerConfig")?;
        section_str(lb, "Endpoint", "LoadBalancerConfig")?;
        section_str(lb, "ApiKey", "LoadBalancerConfig")?;
        Ok(())
    }

    fn plan(&self, request: &WorkflowRequest) -> Result<Vec<Phase>> {
        self.validate_configuration(&request.configuration)?;
        let (blue, green) = split_environments(request)?;
        if green.is_empty() {
            return Err(Error::invalid_configuration(
                "green environment has no servers",
            ));
        }

        let service = &request.service_name;
        let mut phases = Vec::new();

        phases.push(
            Phase::new("Pre-Deployment", request.target_servers.clone())
                .with_steps(vec![
                    validation_step("Verify package availability"),
                    validation_step("Verify blue/green inventory split"),
                ])
                .with_max_retries(1),
        );

        phases.push(
            Phase::new("Green Environment Preparation", green.clone())
                .with_steps(
                    green
                        .iter()
                        .flat_map(|s| {
                            vec![
                                service_stop_step(s, service),
                                cleanup_step(&format!("Clean previous release on {s}"), Some(s)),
                            ]
                        })
                        .collect(),
                )
                .with_max_retries(1),
        );

        phases.push(
            Phase::new("Green Deployment", green.clone())
                .with_steps(
                    green
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
            Phase::new("Green Validation", green.clone())
                .with_steps({
                    let mut steps: Vec<Step> = green.iter().map(|s| health_check_step(s)).collect();
                    steps.push(validation_step("Smoke test green environment"));
                    steps.push(validation_step("Endpoint validation"));
                    steps
                })
                .with_max_retries(1)
                .with_rollback_on_failure(true),
        );

        phases.push(
            Phase::new("Traffic Switch", request.target_servers.clone())
                .with_steps(vec![
                    Step::new("Switch traffic to green", StepType::TrafficSwitch, None)
                        .with_param("action", serde_json::json!("switch"))
                        .with_param("from", serde_json::json!(blue))
                        .with_param("to", serde_json::json!(green)),
                    validation_step("Post-switch validation"),
                    validation_step("Traffic monitor").with_param(
                        "monitoring_duration_seconds",
                        serde_json::json!(POST_SWITCH_MONITOR_SECONDS),
                    ),
                ])
                .with_max_retries(2)
                .with_rollback_on_failure(true),
        );

        phases.push(
            Phase::new("Blue Validation", blue.clone())
                .with_steps(vec![validation_step("Verify blue environment drained")])
                .with_max_retries(1),
        );

        phases.push(
            Phase::new("Post-Deployment Cleanup", blue.clone())
                .with_steps(
                    blue.iter()
                        .flat_map(|s| {
                            vec![
                                Step::new(
                                    format!("Snapshot blue release on {s}"),
                                    StepType::Custom,
                                    Some(s),
                                )
                                .with_param("worker", serde_json::json!("snapshot")),
                                service_stop_step(s, service),
                                cleanup_step(&format!("Clean blue release on {s}"), Some(s)),
                            ]
                        })
                        .collect(),
                )
                .with_rollback_on_failure(false),
        );

        Ok(phases)
    }

    fn estimate_duration(&self, request: &WorkflowRequest) -> Duration {
        Duration::from_secs(600 + request.target_servers.len() as u64 * 60 + POST_SWITCH_MONITOR_SECONDS)
    }
}

/// Resolve the blue/green split. Explicit server lists win; otherwise
/// even-indexed targets are blue and odd-indexed are green.
fn split_environments(request: &WorkflowRequest) -> Result<(Vec<String>, Vec<String>)> {
    let blue_section = required_section(&request.configuration, "BlueEnvironment")?;
    let green_section = required_section(&request.configuration, "GreenEnvironment")?;

    let explicit_blue = section_str_list(blue_section, "Servers");
    let explicit_green = section_str_list(green_section, "Servers");

    match (explicit_blue, explicit_green) {
        (Some(blue), Some(green)) => Ok((blue, green)),
        _ => {
            let mut blue = Vec::new();
            let mut green = Vec::new();
            for (index, server) in request.target_servers.iter().enumerate() {
                if index % 2 == 0 {
                    blue.push(server.clone());
                } else {
                    green.push(server.clone());
                }
            }
            Ok((blue, green))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request(servers: &[&str], config: Value) -> WorkflowRequest {
        WorkflowRequest {
            name: "bg rollout".into(),
            strategy: StrategyKind::BlueGreen,
            target_servers: servers.iter().map(|s| s.to_string()).collect(),
            service_name: "billing".into(),
            version: "2.1.0".into(),
            package_url: "https://packages.internal/billing-2.1.0.tar.gz".into(),
            configuration: config
                .as_object()
                .map(|map| map.clone().into_iter().collect())
                .unwrap_or_default(),
            rollback: None,
            created_by: "op".into(),
            timeout_seconds: None,
        }
    }

    fn base_config() -> Value {
        serde_json::json!({
            "BlueEnvironment": {},
            "GreenEnvironment": {},
            "LoadBalancerConfig": { "Endpoint": "https://lb.internal", "ApiKey": "key" },
        })
    }

    #[test]
    fn phase_sequence_matches_blue_green_shape() {
        let request = request(&["h1", "h2", "h3", "h4"], base_config());
        let phases = BlueGreenPlanner.plan(&request).unwrap();
        let names: Vec<&str> = phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Pre-Deployment",
                "Green Environment Preparation",
                "Green Deployment",
                "Green Validation",
                "Traffic Switch",
                "Blue Validation",
                "Post-Deployment Cleanup",
            ]
        );
    }

    #[test]
    fn odd_fleet_splits_ceiling_blue() {
        let request = request(&["h1", "h2", "h3", "h4", "h5"], base_config());
        let phases = BlueGreenPlanner.plan(&request).unwrap();
        // Even indices are blue: h1, h3, h5. Odd are green: h2, h4.
        let cleanup = phases.last().unwrap();
        assert_eq!(cleanup.target_servers, vec!["h1", "h3", "h5"]);
        let green_deploy = &phases[2];
        assert_eq!(green_deploy.target_servers, vec!["h2", "h4"]);
    }

    #[test]
    fn explicit_server_lists_override_index_split() {
        let mut config = base_config();
        config["BlueEnvironment"] = serde_json::json!({ "Servers": ["h3"] });
        config["GreenEnvironment"] = serde_json::json!({ "Servers": ["h1", "h2"] });
        let request = request(&["h1", "h2", "h3"], config);
        let phases = BlueGreenPlanner.plan(&request).unwrap();
        assert_eq!(phases[2].target_servers, vec!["h1", "h2"]);
    }

    #[test]
    fn cleanup_phase_never_triggers_rollback() {
        let request = request(&["h1", "h2"], base_config());
        let phases = BlueGreenPlanner.plan(&request).unwrap();
        let cleanup = phases.last().unwrap();
        assert_eq!(cleanup.name, "Post-Deployment Cleanup");
        assert!(!cleanup.rollback_on_failure);
    }

    #[test]
    fn missing_lb_credentials_fail_validation() {
        let mut config = base_config();
        config["LoadBalancerConfig"] = serde_json::json!({ "Endpoint": "https://lb.internal" });
        let request = request(&["h1", "h2"], config);
        assert!(BlueGreenPlanner
            .validate_configuration(&request.configuration)
            .is_err());
    }

    #[test]
    fn traffic_switch_phase_rolls_back_on_failure() {
        let request = request(&["h1", "h2"], base_config());
        let phases = BlueGreenPlanner.plan(&request).unwrap();
        let switch = phases.iter().find(|p| p.name == "Traffic Switch").unwrap();
        assert!(switch.rollback_on_failure);
        assert_eq!(switch.max_retries, 2);
    }
}
