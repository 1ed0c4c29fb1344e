//! Rolling (wave-based) deployment planner.

use super::*;
use powerd_core::Error;

const DEFAULT_HEALTH_TIMEOUT_SECONDS: u64 = 300;

pub struct RollingPlanner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaveStrategy {
    FixedSize,
    Percentage,
    Geographic,
    Custom,
}

impl WaveStrategy {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "FixedSize" => Ok(WaveStrategy::FixedSize),
            "Percentage" => Ok(WaveStrategy::Percentage),
            "Geographic" => Ok(WaveStrategy::Geographic),
            "Custom" => Ok(WaveStrategy::Custom),
            other => Err(Error::invalid_configuration(format!(
                "unknown wave strategy {other}"
            ))),
        }
    }
}

impl StrategyPlanner for RollingPlanner {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Rolling
    }

    fn validate_configuration(&self, config: &HashMap<String, Value>) -> Result<()> {
        required_section(config, "RollingConfiguration")?;
        let wave = required_section(config, "WaveConfiguration")?;
        required_section(config, "HealthCheckConfiguration")?;

        let strategy = WaveStrategy::parse(section_str(wave, "Strategy", "WaveConfiguration")?)?;
        match strategy {
            WaveStrategy::FixedSize => {
                if section_u64(wave, "WaveSize").unwrap_or(0) == 0 {
                    return Err(Error::invalid_configuration(
                        "FixedSize waves require WaveSize >= 1",
                    ));
                }
            }
            WaveStrategy::Percentage => {
                let pct = section_f64(wave, "WavePercentage").unwrap_or(0.0);
                if pct <= 0.0 || pct > 100.0 {
                    return Err(Error::invalid_configuration(
                        "WavePercentage must be in (0, 100]",
                    ));
                }
            }
            WaveStrategy::Geographic => {
                if section_str_list(wave, "Groups").map_or(true, |groups| groups.is_empty()) {
                    return Err(Error::invalid_configuration(
                        "Geographic waves require a non-empty Groups list",
                    ));
                }
            }
            WaveStrategy::Custom => {
                if wave.get("Waves").and_then(Value::as_array).map_or(true, Vec::is_empty) {
                    return Err(Error::invalid_configuration(
                        "Custom waves require a non-empty Waves list",
                    ));
                }
            }
        }
        Ok(())
    }

    fn plan(&self, request: &WorkflowRequest) -> Result<Vec<Phase>> {
        self.validate_configuration(&request.configuration)?;
        let wave_config = required_section(&request.configuration, "WaveConfiguration")?;
        let health_config = required_section(&request.configuration, "HealthCheckConfiguration")?;

        let waves = compute_waves(&request.target_servers, wave_config)?;
        let parallel = section_bool(wave_config, "ParallelDeploymentWithinWave").unwrap_or(false);
        let delay_between = section_u64(wave_config, "DelayBetweenServers").unwrap_or(0);
        let wave_interval = section_u64(wave_config, "WaveInterval").unwrap_or(60);
        let health_timeout =
            section_u64(health_config, "TimeoutSeconds").unwrap_or(DEFAULT_HEALTH_TIMEOUT_SECONDS);

        let all = request.target_servers.clone();
        let mut phases = Vec::new();

        phases.push(
            Phase::new("Pre-Deployment", all.clone())
                .with_steps(vec![
                    validation_step("Verify package availability"),
                    validation_step("Verify target server inventory"),
                ])
                .with_max_retries(1),
        );

        phases.push(
            Phase::new("Pre-Rolling Validation", all.clone())
                .with_steps(all.iter().map(|s| health_check_step(s)).collect())
                .with_max_retries(1),
        );

        let wave_count = waves.len();
        for (index, wave) in waves.iter().enumerate() {
            let number = index + 1;

            let steps = if parallel {
                let mut steps = vec![batch_deploy_step(wave)];
                steps.extend(wave.iter().map(|s| wait_for_healthy_step(s, health_timeout)));
                steps
            } else {
                let mut steps = Vec::new();
                for (position, server) in wave.iter().enumerate() {
                    let mut remove = lb_remove_step(server);
                    if delay_between > 0 && position > 0 {
                        remove = remove
                            .with_param("delay_before_seconds", serde_json::json!(delay_between));
                    }
                    steps.push(remove);
                    steps.push(deploy_step(server));
                    steps.push(service_start_step(server, &request.service_name));
                    steps.push(wait_for_healthy_step(server, health_timeout));
                    steps.push(lb_add_step(server));
                }
                steps
            };

            phases.push(
                Phase::new(format!("Wave-{number} Deployment"), wave.clone())
                    .with_steps(steps)
                    .with_max_retries(2)
                    .with_rollback_on_failure(true),
            );

            phases.push(
                Phase::new(format!("Wave-{number} Validation"), wave.clone())
                    .with_steps(wave.iter().map(|s| health_check_step(s)).collect())
                    .with_max_retries(1),
            );

            if number < wave_count {
                phases.push(
                    Phase::new(format!("Wave-{number} Monitoring"), wave.clone()).with_steps(vec![
                        validation_step("Wave soak monitoring").with_param(
                            "monitoring_duration_seconds",
                            serde_json::json!(wave_interval),
                        ),
                    ]),
                );
            }
        }

        phases.push(
            Phase::new("Post-Deployment Validation", all.clone())
                .with_steps({
                    let mut steps: Vec<Step> = all.iter().map(|s| health_check_step(s)).collect();
                    steps.push(validation_step("Smoke test"));
                    steps
                })
                .with_max_retries(1),
        );

        phases.push(
            Phase::new("Cleanup", all)
                .with_steps(vec![cleanup_step("Remove superseded packages", None)]),
        );

        Ok(phases)
    }

    fn estimate_duration(&self, request: &WorkflowRequest) -> Duration {
        let wave_interval = required_section(&request.configuration, "WaveConfiguration")
            .ok()
            .and_then(|wave| section_u64(wave, "WaveInterval"))
            .unwrap_or(60);
        let per_server = 90u64;
        Duration::from_secs(
            300 + request.target_servers.len() as u64 * per_server
                + wave_interval * request.target_servers.len() as u64 / 2,
        )
    }
}

/// Compute wave membership per the configured wave strategy. Empty waves are
/// dropped; servers left unassigned by geographic or custom selection are
/// chunked into trailing default waves of roughly a third of the remainder.
fn compute_waves(servers: &[String], wave_config: &Value) -> Result<Vec<Vec<String>>> {
    let strategy = WaveStrategy::parse(section_str(wave_config, "Strategy", "WaveConfiguration")?)?;

    match strategy {
        WaveStrategy::FixedSize => {
            let size = section_u64(wave_config, "WaveSize").unwrap_or(1) as usize;
            Ok(chunk_servers(servers, size))
        }
        WaveStrategy::Percentage => {
            let pct = section_f64(wave_config, "WavePercentage").unwrap_or(100.0);
            let size = ((servers.len() as f64 * pct / 100.0).ceil() as usize).max(1);
            Ok(chunk_servers(servers, size))
        }
        WaveStrategy::Geographic => {
            let groups = section_str_list(wave_config, "Groups").unwrap_or_default();
            let mut remaining: Vec<String> = servers.to_vec();
            let mut waves = Vec::new();
            for group in groups {
                let (matched, rest): (Vec<String>, Vec<String>) =
                    remaining.into_iter().partition(|s| s.contains(&group));
                if !matched.is_empty() {
                    waves.push(matched);
                }
                remaining = rest;
            }
            waves.extend(default_waves(remaining));
            Ok(waves)
        }
        WaveStrategy::Custom => {
            let declared = wave_config
                .get("Waves")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let mut remaining: Vec<String> = servers.to_vec();
            let mut waves = Vec::new();
            for wave in declared {
                let names: Vec<String> = wave
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let (matched, rest): (Vec<String>, Vec<String>) =
                    remaining.into_iter().partition(|s| names.contains(s));
                if !matched.is_empty() {
                    waves.push(matched);
                }
                remaining = rest;
            }
            waves.extend(default_waves(remaining));
            Ok(waves)
        }
    }
}

fn default_waves(remaining: Vec<String>) -> Vec<Vec<String>> {
    if remaining.is_empty() {
        return Vec::new();
    }
    let size = (remaining.len() + 2) / 3;
    chunk_servers(&remaining, size.max(1))
}
