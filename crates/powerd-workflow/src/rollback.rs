//! Rollback engine: per-server rollback fan-out, health-gated.
//!
//! Rollback is single-shot at this level; reinvocation is the caller's
//! responsibility.

use crate::events::WorkflowEventKind;
use crate::model::{StepStatus, StepType, Workflow};
use crate::repository::WorkflowRepository;
use futures::future::join_all;
use powerd_core::bus::{topics, DeploymentCommand};
use powerd_core::{wait_until_healthy, Error, HealthProbe, MessageBus, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const FALLBACK_TARGET_VERSION: &str = "previous";

pub struct RollbackEngine {
    repository: Arc<WorkflowRepository>,
    bus: Arc<dyn MessageBus>,
    probe: Arc<dyn HealthProbe>,
    health_poll_interval: Duration,
}

impl RollbackEngine {
    pub fn new(
        repository: Arc<WorkflowRepository>,
        bus: Arc<dyn MessageBus>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            repository,
            bus,
            probe,
            health_poll_interval: Duration::from_secs(5),
        }
    }

    pub fn with_health_poll_interval(mut self, interval: Duration) -> Self {
        self.health_poll_interval = interval;
        self
    }

    /// Roll the affected hosts back to the target version and wait for each
    /// to report healthy. Success is conjunctive.
    pub async fn rollback(
        &self,
        workflow: &Workflow,
        target_version: Option<String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let version = self.resolve_target_version(workflow, target_version);
        let hosts = affected_hosts(workflow);
        let health_timeout = Duration::from_secs(
            workflow
                .rollback
                .as_ref()
                .map(|r| r.health_check_timeout_seconds)
                .unwrap_or(300),
        );

        self.repository
            .record(
                workflow.id,
                WorkflowEventKind::RollbackStarted,
                format!("rolling back {} hosts to {version}", hosts.len()),
            )
            .await?;

        let run = async {
            let outcomes = join_all(
                hosts
                    .iter()
                    .map(|host| self.rollback_host(workflow, host, &version, health_timeout, cancel)),
            )
            .await;

            let failures: Vec<String> = hosts
                .iter()
                .zip(outcomes)
                .filter_map(|(host, outcome)| outcome.err().map(|e| format!("{host}: {e}")))
                .collect();

            if failures.is_empty() {
                Ok(())
            } else {
                Err(Error::internal(format!(
                    "rollback failed on {} of {} hosts: {}",
                    failures.len(),
                    hosts.len(),
                    failures.join("; ")
                )))
            }
        };

        let outcome = match tokio::time::timeout(timeout, run).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::timeout(format!(
                "rollback exceeded {}s",
                timeout.as_secs()
            ))),
        };

        match &outcome {
            Ok(()) => {
                self.repository
                    .record(
                        workflow.id,
                        WorkflowEventKind::RollbackCompleted,
                        format!("fleet rolled back to {version}"),
                    )
                    .await?;
            }
            Err(e) => {
                self.repository
                    .record(workflow.id, WorkflowEventKind::RollbackFailed, e.to_string())
                    .await?;
            }
        }

        outcome
    }

    async fn rollback_host(
        &self,
        workflow: &Workflow,
        host: &str,
        version: &str,
        health_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut configuration: HashMap<String, serde_json::Value> = HashMap::new();
        configuration.insert(
            "workflowId".to_string(),
            serde_json::json!(workflow.id.to_string()),
        );

        let command = DeploymentCommand {
            deployment_id: workflow.id,
            target_server_id: host.to_string(),
            service_name: workflow.service_name.clone(),
            strategy: workflow.strategy.to_string(),
            package_url: workflow.package_url.clone(),
            version: version.to_string(),
            configuration,
        };

        self.bus
            .publish(&topics::rollback(host), serde_json::to_value(&command)?)
            .await?;

        wait_until_healthy(
            self.probe.as_ref(),
            host,
            &workflow.service_name,
            health_timeout,
            self.health_poll_interval,
            cancel,
        )
        .await
    }

    fn resolve_target_version(&self, workflow: &Workflow, explicit: Option<String>) -> String {
        explicit
            .or_else(|| {
                workflow
                    .rollback
                    .as_ref()
                    .and_then(|r| r.target_version.clone())
            })
            .unwrap_or_else(|| FALLBACK_TARGET_VERSION.to_string())
    }
}

/// Hosts that actually received a deploy command in this run. A workflow
/// with no attempted deploy steps (or no phases at all) rolls back its
/// whole target set.
fn affected_hosts(workflow: &Workflow) -> Vec<String> {
    let mut hosts = Vec::new();
    for phase in &workflow.phases {
        for step in &phase.steps {
            if step.step_type != StepType::Deploy || step.status == StepStatus::Pending {
                continue;
            }
            if let Some(host) = &step.target_server {
                if !hosts.contains(host) {
                    hosts.push(host.clone());
                }
            }
            if let Some(servers) = step.parameters.get("servers").and_then(|v| v.as_array()) {
                for server in servers.iter().filter_map(|s| s.as_str()) {
                    if !hosts.iter().any(|h| h == server) {
                        hosts.push(server.to_string());
                    }
                }
            }
        }
    }
    if hosts.is_empty() {
        workflow.target_servers.clone()
    } else {
        hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RollbackConfiguration, StrategyKind, WorkflowRequest};
    use crate::repository::InMemoryWorkflowStore;
    use async_trait::async_trait;
    use powerd_core::MemoryCache;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct SelectiveProbe {
        unhealthy: HashSet<String>,
    }

    #[async_trait]
    impl HealthProbe for SelectiveProbe {
        async fn check(&self, host: &str, _service: &str) -> Result<bool> {
            Ok(!self.unhealthy.contains(host))
        }
    }

    struct RecordingBus {
        topics: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageBus for RecordingBus {
        async fn publish(&self, topic: &str, _payload: serde_json::Value) -> Result<()> {
            self.topics.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        fn subscribe(&self) -> tokio::sync::broadcast::Receiver<powerd_core::BusMessage> {
            let (sender, receiver) = tokio::sync::broadcast::channel(1);
            drop(sender);
            receiver
        }
    }

    fn workflow(hosts: &[&str]) -> (Workflow, Arc<WorkflowRepository>) {
        let request = WorkflowRequest {
            name: "rollback target".into(),
            strategy: StrategyKind::Canary,
            target_servers: hosts.iter().map(|s| s.to_string()).collect(),
            service_name: "billing".into(),
            version: "2.1.0".into(),
            package_url: "https://packages.internal/p.tar.gz".into(),
            configuration: HashMap::new(),
            rollback: Some(RollbackConfiguration {
                enabled: true,
                automatic_rollback: true,
                target_version: Some("2.0.3".into()),
                health_check_timeout_seconds: 1,
            }),
            created_by: "op".into(),
            timeout_seconds: None,
        };
        let workflow = Workflow::from_request(request, vec![], Duration::from_secs(7200));
        let repository = Arc::new(WorkflowRepository::new(
            Arc::new(InMemoryWorkflowStore::new()),
            Arc::new(MemoryCache::new()),
        ));
        (workflow, repository)
    }

    #[tokio::test]
    async fn healthy_fleet_rolls_back_and_records_events() {
        let (workflow, repository) = workflow(&["h1", "h2"]);
        let bus = Arc::new(RecordingBus {
            topics: Mutex::new(Vec::new()),
        });
        let probe = Arc::new(SelectiveProbe {
            unhealthy: HashSet::new(),
        });
        let engine = RollbackEngine::new(repository.clone(), bus.clone(), probe)
            .with_health_poll_interval(Duration::from_millis(10));

        engine
            .rollback(&workflow, None, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        let mut topics = bus.topics.lock().unwrap().clone();
        topics.sort();
        assert_eq!(topics, vec!["rollback.h1", "rollback.h2"]);

        let events = repository.events(workflow.id).await.unwrap();
        let kinds: Vec<WorkflowEventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                WorkflowEventKind::RollbackStarted,
                WorkflowEventKind::RollbackCompleted
            ]
        );
        // Policy target version wins over the "previous" fallback.
        assert!(events[1].message.contains("2.0.3"));
    }

    #[tokio::test]
    async fn one_unhealthy_host_fails_the_rollback() {
        let (workflow, repository) = workflow(&["h1", "h2"]);
        let bus = Arc::new(RecordingBus {
            topics: Mutex::new(Vec::new()),
        });
        let probe = Arc::new(SelectiveProbe {
            unhealthy: HashSet::from(["h2".to_string()]),
        });
        let engine = RollbackEngine::new(repository.clone(), bus, probe)
            .with_health_poll_interval(Duration::from_millis(10));

        let outcome = engine
            .rollback(&workflow, None, Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert!(outcome.is_err());

        let events = repository.events(workflow.id).await.unwrap();
        assert_eq!(events.last().unwrap().kind, WorkflowEventKind::RollbackFailed);
    }

    #[test]
    fn rollback_targets_only_deployed_hosts() {
        use crate::model::{Phase, Step};

        let (mut workflow, _) = workflow(&["h1", "h2", "h3", "h4"]);
        let mut deploy = Step::new("Deploy to h1", StepType::Deploy, Some("h1"));
        deploy.status = StepStatus::Completed;
        let mut batch = Step::new("Batch deploy", StepType::Deploy, None)
            .with_param("servers", serde_json::json!(["h2"]));
        batch.status = StepStatus::Failed;
        let untouched = Step::new("Deploy to h4", StepType::Deploy, Some("h4"));
        workflow.phases = vec![Phase::new("Wave-1 Deployment", vec![])
            .with_steps(vec![deploy, batch, untouched])];

        assert_eq!(affected_hosts(&workflow), vec!["h1", "h2"]);
    }

    #[test]
    fn rollback_without_deploy_history_targets_everything() {
        let (workflow, _) = workflow(&["h1", "h2"]);
        assert_eq!(affected_hosts(&workflow), vec!["h1", "h2"]);
    }

    #[tokio::test]
    async fn explicit_target_version_wins() {
        let (workflow, repository) = workflow(&["h1"]);
        let bus = Arc::new(RecordingBus {
            topics: Mutex::new(Vec::new()),
        });
        let probe = Arc::new(SelectiveProbe {
            unhealthy: HashSet::new(),
        });
        let engine = RollbackEngine::new(repository.clone(), bus, probe)
            .with_health_poll_interval(Duration::from_millis(10));

        engine
            .rollback(
                &workflow,
                Some("1.9.9".into()),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let events = repository.events(workflow.id).await.unwrap();
        assert!(events[0].message.contains("1.9.9"));
    }
}
