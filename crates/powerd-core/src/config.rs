use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Top-level engine configuration, loaded from `powerdaemon.toml` plus
/// `POWERD_*` environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub alerting: AlertingConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub metrics: MetricsEndpointConfig,
    #[serde(default)]
    pub load_balancer: LoadBalancerEndpointConfig,
    #[serde(default)]
    pub agents: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8554,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub max_concurrent_workflows: usize,
    pub max_queued_workflows: usize,
    pub health_check_interval_seconds: u64,
    pub workflow_timeout_minutes: u64,
    pub phase_timeout_minutes: u64,
    pub step_timeout_minutes: u64,
    pub max_retry_attempts: u32,
    pub retry_delay_seconds: u64,
    pub enable_auto_rollback: bool,
    pub rollback_timeout_minutes: u64,
    pub workflow_cleanup_days: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 10,
            max_queued_workflows: 50,
            health_check_interval_seconds: 30,
            workflow_timeout_minutes: 120,
            phase_timeout_minutes: 30,
            step_timeout_minutes: 10,
            max_retry_attempts: 3,
            retry_delay_seconds: 30,
            enable_auto_rollback: true,
            rollback_timeout_minutes: 15,
            workflow_cleanup_days: 30,
        }
    }
}

/// Per-metric alerting thresholds used to seed the builtin rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricThresholds {
    pub warning: f64,
    pub critical: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingConfig {
    pub evaluation_interval_seconds: u64,
    pub alert_retention_days: i64,
    pub evaluation_window_seconds: u64,
    pub minimum_data_points: usize,
    pub cpu: MetricThresholds,
    pub memory: MetricThresholds,
    pub disk: MetricThresholds,
    pub network: MetricThresholds,
    pub deployment_failure_rate_warning: f64,
    pub service_response_time_warning_ms: f64,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_seconds: 60,
            alert_retention_days: 30,
            evaluation_window_seconds: 300,
            minimum_data_points: 3,
            cpu: MetricThresholds {
                warning: 80.0,
                critical: 95.0,
            },
            memory: MetricThresholds {
                warning: 85.0,
                critical: 95.0,
            },
            disk: MetricThresholds {
                warning: 85.0,
                critical: 95.0,
            },
            network: MetricThresholds {
                warning: 80.0,
                critical: 95.0,
            },
            deployment_failure_rate_warning: 10.0,
            service_response_time_warning_ms: 2000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RedisConfig {
    pub url: Option<String>,
}

/// Aggregation query endpoint for the alert evaluator.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsEndpointConfig {
    pub url: Option<String>,
}

/// Management endpoint for the fleet load balancer.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoadBalancerEndpointConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
}

/// How the engine reaches agent-side health endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub health_port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { health_port: 8585 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub access_token_lifetime_seconds: u64,
    pub refresh_token_lifetime_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "change-me-in-production".to_string(),
            access_token_lifetime_seconds: 3600,
            refresh_token_lifetime_seconds: 604_800,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `powerdaemon.toml` (if present) layered with
    /// `POWERD_*` environment variables (`POWERD_SERVER__PORT=9000`).
    pub fn load() -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name("powerdaemon").required(false))
            .add_source(::config::Environment::with_prefix("POWERD").separator("__"))
            .build()
            .map_err(|e| Error::invalid_configuration(format!("config load failed: {e}")))?;

        settings
            .try_deserialize()
            .map_err(|e| Error::invalid_configuration(format!("config parse failed: {e}")))
    }
}
