//! Workflow, phase, and step entities.

use chrono::{DateTime, Utc};
use powerd_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyKind {
    Rolling,
    BlueGreen,
    Canary,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Rolling => write!(f, "Rolling"),
            StrategyKind::BlueGreen => write!(f, "BlueGreen"),
            StrategyKind::Canary => write!(f, "Canary"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Created,
    Queued,
    Running,
    Paused,
    RollingBack,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed
                | WorkflowStatus::Failed
                | WorkflowStatus::Cancelled
                | WorkflowStatus::RolledBack
        )
    }

    /// Legal transitions form a DAG apart from the Running↔Paused side-state.
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        match self {
            Created => matches!(next, Queued | Running | Cancelled),
            Queued => matches!(next, Running | Cancelled),
            Running => matches!(next, Paused | RollingBack | Completed | Failed | Cancelled),
            Paused => matches!(next, Running | RollingBack | Cancelled),
            RollingBack => matches!(next, RolledBack | Failed),
            Completed | Failed | Cancelled | RolledBack => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepType {
    Deploy,
    ServiceStart,
    ServiceStop,
    ServiceRestart,
    HealthCheck,
    WaitForHealthy,
    TrafficSwitch,
    Validation,
    Cleanup,
    Custom,
}

impl StepType {
    /// Default criticality when the step parameters don't say otherwise.
    fn critical_by_default(&self) -> bool {
        matches!(self, StepType::Deploy | StepType::TrafficSwitch)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub name: String,
    pub step_type: StepType,
    pub target_server: Option<String>,
    pub parameters: HashMap<String, serde_json::Value>,
    pub status: StepStatus,
    pub retry_count: u32,
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(name: impl Into<String>, step_type: StepType, target_server: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            step_type,
            target_server: target_server.map(str::to_string),
            parameters: HashMap::new(),
            status: StepStatus::Pending,
            retry_count: 0,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    /// A critical step failure fails the phase; a non-critical failure marks
    /// the step Skipped and the phase continues.
    pub fn is_critical(&self) -> bool {
        self.parameters
            .get("critical")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or_else(|| self.step_type.critical_by_default())
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(serde_json::Value::as_u64)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(serde_json::Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub id: Uuid,
    pub name: String,
    pub steps: Vec<Step>,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub rollback_on_failure: bool,
    pub target_servers: Vec<String>,
    pub status: PhaseStatus,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Phase {
    pub fn new(name: impl Into<String>, target_servers: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            steps: Vec::new(),
            timeout_seconds: 30 * 60,
            max_retries: 0,
            rollback_on_failure: false,
            target_servers,
            status: PhaseStatus::Pending,
            retry_count: 0,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_rollback_on_failure(mut self, rollback: bool) -> Self {
        self.rollback_on_failure = rollback;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackConfiguration {
    pub enabled: bool,
    pub automatic_rollback: bool,
    pub target_version: Option<String>,
    pub health_check_timeout_seconds: u64,
}

impl Default for RollbackConfiguration {
    fn default() -> Self {
        Self {
            enabled: true,
            automatic_rollback: false,
            target_version: None,
            health_check_timeout_seconds: 300,
        }
    }
}

/// Deployment request as accepted by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub name: String,
    pub strategy: StrategyKind,
    pub target_servers: Vec<String>,
    pub service_name: String,
    pub version: String,
    pub package_url: String,
    #[serde(default)]
    pub configuration: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub rollback: Option<RollbackConfiguration>,
    pub created_by: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub strategy: StrategyKind,
    pub target_servers: Vec<String>,
    pub service_name: String,
    pub version: String,
    pub package_url: String,
    pub configuration: HashMap<String, serde_json::Value>,
    pub rollback: Option<RollbackConfiguration>,
    pub created_by: String,
    pub status: WorkflowStatus,
    pub progress_percent: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub current_phase_index: usize,
    pub phases: Vec<Phase>,
    pub errors: Vec<String>,
    pub timeout_seconds: u64,
    /// Record version for optimistic concurrency; bumped on every persisted
    /// update.
    pub revision: u64,
}

impl Workflow {
    pub fn from_request(request: WorkflowRequest, phases: Vec<Phase>, default_timeout: Duration) -> Self {
        let timeout_seconds = request
            .timeout_seconds
            .unwrap_or(default_timeout.as_secs());
        Self {
            id: Uuid::new_v4(),
            name: request.name,
            strategy: request.strategy,
            target_servers: request.target_servers,
            service_name: request.service_name,
            version: request.version,
            package_url: request.package_url,
            configuration: request.configuration,
            rollback: request.rollback,
            created_by: request.created_by,
            status: WorkflowStatus::Created,
            progress_percent: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            current_phase_index: 0,
            phases,
            errors: Vec::new(),
            timeout_seconds,
            revision: 0,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Enforce the status DAG; terminal states never transition.
    pub fn transition_to(&mut self, next: WorkflowStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::invalid_state(format!(
                "workflow {} cannot move from {:?} to {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Progress is the completed-phase share, monotone while the workflow
    /// runs; frozen on rollback.
    pub fn recompute_progress(&mut self) {
        if self.phases.is_empty() {
            return;
        }
        if self.status == WorkflowStatus::RollingBack || self.status == WorkflowStatus::RolledBack {
            return;
        }
        let completed = self
            .phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Completed)
            .count();
        let pct = ((completed * 100) / self.phases.len()) as u8;
        if pct > self.progress_percent {
            self.progress_percent = pct.min(100);
        }
        if self.status == WorkflowStatus::Completed {
            self.progress_percent = 100;
        }
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow_with_phases(phase_count: usize) -> Workflow {
        let request = WorkflowRequest {
            name: "billing rollout".into(),
            strategy: StrategyKind::Rolling,
            target_servers: vec!["web-01".into()],
            service_name: "billing".into(),
            version: "2.1.0".into(),
            package_url: "https://packages.internal/billing-2.1.0.tar.gz".into(),
            configuration: HashMap::new(),
            rollback: None,
            created_by: "op".into(),
            timeout_seconds: None,
        };
        let phases = (0..phase_count)
            .map(|i| Phase::new(format!("phase-{i}"), vec!["web-01".into()]))
            .collect();
        Workflow::from_request(request, phases, Duration::from_secs(7200))
    }

    #[test]
    fn terminal_states_never_transition() {
        for terminal in [
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::Cancelled,
            WorkflowStatus::RolledBack,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(WorkflowStatus::Running));
            assert!(!terminal.can_transition_to(WorkflowStatus::Queued));
        }
    }

    #[test]
    fn paused_is_a_side_state_of_running() {
        assert!(WorkflowStatus::Running.can_transition_to(WorkflowStatus::Paused));
        assert!(WorkflowStatus::Paused.can_transition_to(WorkflowStatus::Running));
        assert!(!WorkflowStatus::Created.can_transition_to(WorkflowStatus::Paused));
        assert!(!WorkflowStatus::Paused.can_transition_to(WorkflowStatus::Completed));
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut workflow = workflow_with_phases(1);
        workflow.transition_to(WorkflowStatus::Running).unwrap();
        workflow.transition_to(WorkflowStatus::Completed).unwrap();
        assert!(workflow.transition_to(WorkflowStatus::Running).is_err());
    }

    #[test]
    fn progress_is_non_decreasing() {
        let mut workflow = workflow_with_phases(4);
        workflow.transition_to(WorkflowStatus::Running).unwrap();

        workflow.phases[0].status = PhaseStatus::Completed;
        workflow.recompute_progress();
        assert_eq!(workflow.progress_percent, 25);

        // A stale recompute with fewer completed phases must not regress.
        workflow.phases[0].status = PhaseStatus::Running;
        workflow.recompute_progress();
        assert_eq!(workflow.progress_percent, 25);

        workflow.phases[0].status = PhaseStatus::Completed;
        workflow.phases[1].status = PhaseStatus::Completed;
        workflow.recompute_progress();
        assert_eq!(workflow.progress_percent, 50);
    }

    #[test]
    fn progress_is_frozen_during_rollback() {
        let mut workflow = workflow_with_phases(2);
        workflow.transition_to(WorkflowStatus::Running).unwrap();
        workflow.phases[0].status = PhaseStatus::Completed;
        workflow.recompute_progress();
        let before = workflow.progress_percent;

        workflow.transition_to(WorkflowStatus::RollingBack).unwrap();
        workflow.phases[1].status = PhaseStatus::Completed;
        workflow.recompute_progress();
        assert_eq!(workflow.progress_percent, before);
    }

    #[test]
    fn criticality_defaults_by_step_type() {
        let deploy = Step::new("deploy", StepType::Deploy, Some("web-01"));
        assert!(deploy.is_critical());

        let health = Step::new("health", StepType::HealthCheck, Some("web-01"));
        assert!(!health.is_critical());

        let overridden = Step::new("health", StepType::HealthCheck, Some("web-01"))
            .with_param("critical", serde_json::json!(true));
        assert!(overridden.is_critical());
    }
}
