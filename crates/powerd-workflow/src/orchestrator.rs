//! Orchestrator façade: create → plan → lease → execute.
//!
//! Every mutating operation is gated by a permission check against the
//! identity port, and workflow starts are serialized through the
//! `workflow-lock:{id}` cache lease. The orchestrator owns the cancellation
//! controllers for locally running workflows; a bounded queue absorbs starts
//! beyond the concurrency limit and drains as runs finish.

use crate::events::WorkflowEventKind;
use crate::executor::WorkflowExecutor;
use crate::model::{Workflow, WorkflowRequest, WorkflowStatus};
use crate::repository::{WorkflowFilter, WorkflowRepository};
use crate::rollback::RollbackEngine;
use crate::strategy::StrategyRegistry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use powerd_core::cache::{keys, ttl};
use powerd_core::config::OrchestratorConfig;
use powerd_core::identity::permissions;
use powerd_core::{
    CacheStore, CacheStoreExt, ComponentHealth, Error, IdentityProvider, Lease, Result,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatistics {
    pub total: usize,
    pub running: usize,
    pub queued: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub rolled_back: usize,
    pub success_rate: f64,
    pub average_duration_seconds: f64,
}

#[derive(Clone)]
pub struct Orchestrator {
    repository: Arc<WorkflowRepository>,
    registry: Arc<StrategyRegistry>,
    executor: Arc<WorkflowExecutor>,
    rollback_engine: Arc<RollbackEngine>,
    cache: Arc<dyn CacheStore>,
    identity: Arc<dyn IdentityProvider>,
    config: OrchestratorConfig,
    running: Arc<DashMap<Uuid, CancellationToken>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<WorkflowRepository>,
        registry: Arc<StrategyRegistry>,
        executor: Arc<WorkflowExecutor>,
        rollback_engine: Arc<RollbackEngine>,
        cache: Arc<dyn CacheStore>,
        identity: Arc<dyn IdentityProvider>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            repository,
            registry,
            executor,
            rollback_engine,
            cache,
            identity,
            config,
            running: Arc::new(DashMap::new()),
        }
    }

    async fn require(&self, user: Uuid, permission: (&str, &str)) -> Result<()> {
        let (resource, action) = permission;
        if self.identity.has_permission(user, resource, action).await? {
            Ok(())
        } else {
            Err(Error::permission_denied(format!("{resource}.{action}")))
        }
    }

    /// Validate the request against its strategy planner, build the phase
    /// plan, and persist the new workflow.
    pub async fn create_workflow(&self, user: Uuid, request: WorkflowRequest) -> Result<Workflow> {
        self.require(user, permissions::DEPLOYMENT_CREATE).await?;

        if request.target_servers.is_empty() {
            return Err(Error::invalid_configuration(
                "deployment request has no target servers",
            ));
        }

        let planner = self.registry.get(request.strategy)?;
        planner.validate_configuration(&request.configuration)?;
        let phases = planner.plan(&request)?;

        let workflow = Workflow::from_request(
            request,
            phases,
            Duration::from_secs(self.config.workflow_timeout_minutes * 60),
        );
        self.repository.create(&workflow).await?;
        self.repository
            .record_event(
                crate::events::WorkflowEvent::new(
                    workflow.id,
                    WorkflowEventKind::Created,
                    format!("workflow {} created", workflow.name),
                )
                .with_user(user.to_string()),
            )
            .await?;

        tracing::info!(workflow_id = %workflow.id, "created {} workflow for {}", workflow.strategy, workflow.service_name);
        Ok(workflow)
    }

    /// Start (or queue) a workflow. The `workflow-lock:{id}` lease makes the
    /// transition single-writer: a concurrent start observes
    /// `LeaseUnavailable`.
    pub async fn start_workflow(&self, user: Uuid, id: Uuid) -> Result<WorkflowStatus> {
        self.require(user, permissions::DEPLOYMENT_EXECUTE).await?;

        let lease = Lease::acquire(self.cache.clone(), keys::workflow_lock(id), ttl::WORKFLOW_LOCK)
            .await?;
        let outcome = self.start_with_lease(id).await;
        lease.release().await?;
        outcome
    }

    async fn start_with_lease(&self, id: Uuid) -> Result<WorkflowStatus> {
        let mut workflow = self.repository.get(id).await?;
        if !matches!(
            workflow.status,
            WorkflowStatus::Created | WorkflowStatus::Queued
        ) {
            return Err(Error::invalid_state(format!(
                "workflow {id} cannot start from {:?}",
                workflow.status
            )));
        }

        if self.running.len() >= self.config.max_concurrent_workflows {
            if workflow.status == WorkflowStatus::Queued {
                return Ok(WorkflowStatus::Queued);
            }
            let queued = self
                .repository
                .list(&WorkflowFilter {
                    status: Some(WorkflowStatus::Queued),
                    ..WorkflowFilter::default()
                })
                .await?
                .len();
            if queued >= self.config.max_queued_workflows {
                return Err(Error::invalid_state(format!(
                    "workflow queue is full ({queued} waiting)"
                )));
            }
            workflow.transition_to(WorkflowStatus::Queued)?;
            self.repository.save(&mut workflow).await?;
            tracing::info!(workflow_id = %id, "queued behind {} running workflows", self.running.len());
            return Ok(WorkflowStatus::Queued);
        }

        workflow.transition_to(WorkflowStatus::Running)?;
        workflow.started_at = Some(Utc::now());
        self.repository.save(&mut workflow).await?;
        self.repository
            .record(id, WorkflowEventKind::Started, "workflow started")
            .await?;

        let cancel = CancellationToken::new();
        self.running.insert(id, cancel.clone());
        self.spawn_run(id, cancel);
        Ok(WorkflowStatus::Running)
    }

    fn spawn_run(&self, id: Uuid, cancel: CancellationToken) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.executor.execute(id, cancel).await {
                tracing::error!(workflow_id = %id, "executor run ended with error: {e}");
            }
            this.running.remove(&id);
            if let Err(e) = this.start_next_queued().await {
                tracing::warn!("failed to drain workflow queue: {e}");
            }
        });
    }

    /// Pop the oldest queued workflow once a slot frees up.
    async fn start_next_queued(&self) -> Result<()> {
        let queued = self
            .repository
            .list(&WorkflowFilter {
                status: Some(WorkflowStatus::Queued),
                ..WorkflowFilter::default()
            })
            .await?;
        // The list is newest-first; drain from the tail.
        let Some(next) = queued.last() else {
            return Ok(());
        };

        let lease = match Lease::acquire(
            self.cache.clone(),
            keys::workflow_lock(next.id),
            ttl::WORKFLOW_LOCK,
        )
        .await
        {
            Ok(lease) => lease,
            // Someone else is already starting it.
            Err(Error::LeaseUnavailable(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let outcome = self.start_with_lease(next.id).await;
        lease.release().await?;
        outcome.map(|_| ())
    }

    /// Trip the local cancellation controller. No-op when the workflow is
    /// not running on this node.
    pub async fn cancel_workflow(&self, user: Uuid, id: Uuid, reason: &str) -> Result<bool> {
        self.require(user, permissions::DEPLOYMENT_EXECUTE).await?;

        match self.running.remove(&id) {
            Some((_, token)) => {
                token.cancel();
                self.repository
                    .record_event(
                        crate::events::WorkflowEvent::new(
                            id,
                            WorkflowEventKind::Cancelled,
                            format!("cancellation requested: {reason}"),
                        )
                        .with_user(user.to_string()),
                    )
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Set the pause marker; the executor holds at its next phase or step
    /// boundary.
    pub async fn pause_workflow(&self, user: Uuid, id: Uuid) -> Result<()> {
        self.require(user, permissions::DEPLOYMENT_EXECUTE).await?;

        let workflow = self.repository.get(id).await?;
        if !matches!(
            workflow.status,
            WorkflowStatus::Running | WorkflowStatus::Queued
        ) {
            return Err(Error::invalid_state(format!(
                "workflow {id} is {:?}, not pausable",
                workflow.status
            )));
        }

        self.cache
            .set_raw(
                &keys::workflow_pause(id),
                "paused".to_string(),
                Some(ttl::WORKFLOW_PAUSE),
            )
            .await?;
        self.repository
            .record_event(
                crate::events::WorkflowEvent::new(id, WorkflowEventKind::Paused, "pause requested")
                    .with_user(user.to_string()),
            )
            .await?;
        Ok(())
    }

    pub async fn resume_workflow(&self, user: Uuid, id: Uuid) -> Result<()> {
        self.require(user, permissions::DEPLOYMENT_EXECUTE).await?;

        let pause_key = keys::workflow_pause(id);
        if !self.cache.exists(&pause_key).await? {
            return Err(Error::invalid_state(format!("workflow {id} is not paused")));
        }
        self.cache.remove(&pause_key).await?;
        self.repository
            .record_event(
                crate::events::WorkflowEvent::new(id, WorkflowEventKind::Resumed, "resume requested")
                    .with_user(user.to_string()),
            )
            .await?;
        Ok(())
    }

    /// Manual rollback. Requires the rollback policy to be enabled; valid
    /// only while the workflow is in flight.
    pub async fn rollback_workflow(
        &self,
        user: Uuid,
        id: Uuid,
        target_version: Option<String>,
    ) -> Result<WorkflowStatus> {
        self.require(user, permissions::DEPLOYMENT_EXECUTE).await?;
        self.rollback_inner(id, target_version).await
    }

    /// Engine-internal rollback path for external triggers. Allowed only
    /// when the policy opts into automatic rollback.
    pub async fn auto_rollback(&self, id: Uuid, trigger: &str, reason: &str) -> Result<WorkflowStatus> {
        let workflow = self.repository.get(id).await?;
        let automatic = workflow
            .rollback
            .as_ref()
            .map(|r| r.automatic_rollback)
            .unwrap_or(false);
        if !automatic {
            return Err(Error::invalid_state(format!(
                "workflow {id} does not allow automatic rollback"
            )));
        }
        tracing::warn!(workflow_id = %id, "automatic rollback triggered by {trigger}: {reason}");
        self.rollback_inner(id, None).await
    }

    async fn rollback_inner(&self, id: Uuid, target_version: Option<String>) -> Result<WorkflowStatus> {
        let workflow = self.repository.get(id).await?;
        let enabled = workflow
            .rollback
            .as_ref()
            .map(|r| r.enabled)
            .unwrap_or(false);
        if !enabled {
            return Err(Error::invalid_state(format!(
                "rollback is not enabled for workflow {id}"
            )));
        }
        if !matches!(
            workflow.status,
            WorkflowStatus::Running | WorkflowStatus::Paused
        ) {
            return Err(Error::invalid_state(format!(
                "workflow {id} is {:?}, not rollbackable",
                workflow.status
            )));
        }

        // Stop the local run first; the optimistic revision check fences out
        // any in-flight executor write racing this transition.
        if let Some((_, token)) = self.running.remove(&id) {
            token.cancel();
            self.wait_for_local_exit(id).await;
        }

        let mut workflow = self.repository.get(id).await?;
        if workflow.status.is_terminal() {
            return Ok(workflow.status);
        }
        workflow.transition_to(WorkflowStatus::RollingBack)?;
        self.repository.save(&mut workflow).await?;

        let timeout = Duration::from_secs(self.config.rollback_timeout_minutes * 60);
        let outcome = self
            .rollback_engine
            .rollback(&workflow, target_version, timeout, &CancellationToken::new())
            .await;

        let final_status = match outcome {
            Ok(()) => WorkflowStatus::RolledBack,
            Err(e) => {
                workflow.record_error(format!("rollback failed: {e}"));
                WorkflowStatus::Failed
            }
        };
        workflow.transition_to(final_status)?;
        self.repository.save(&mut workflow).await?;
        Ok(final_status)
    }

    async fn wait_for_local_exit(&self, id: Uuid) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while self.running.contains_key(&id) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    // --- queries ----------------------------------------------------------

    pub async fn get_workflow(&self, user: Uuid, id: Uuid) -> Result<Workflow> {
        self.require(user, permissions::DEPLOYMENT_VIEW).await?;
        self.repository.get(id).await
    }

    pub async fn get_active_workflows(&self, user: Uuid) -> Result<Vec<Workflow>> {
        self.require(user, permissions::DEPLOYMENT_VIEW).await?;
        let all = self.repository.list(&WorkflowFilter::default()).await?;
        Ok(all
            .into_iter()
            .filter(|w| {
                matches!(
                    w.status,
                    WorkflowStatus::Running | WorkflowStatus::Paused | WorkflowStatus::RollingBack
                )
            })
            .collect())
    }

    pub async fn get_workflows(&self, user: Uuid, filter: &WorkflowFilter) -> Result<Vec<Workflow>> {
        self.require(user, permissions::DEPLOYMENT_VIEW).await?;
        self.repository.list(filter).await
    }

    pub async fn get_workflow_events(
        &self,
        user: Uuid,
        id: Uuid,
    ) -> Result<Vec<crate::events::WorkflowEvent>> {
        self.require(user, permissions::DEPLOYMENT_VIEW).await?;
        // Surface NotFound for unknown ids rather than an empty log.
        self.repository.get(id).await?;
        self.repository.events(id).await
    }

    pub async fn get_statistics(
        &self,
        user: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<WorkflowStatistics> {
        self.require(user, permissions::DEPLOYMENT_VIEW).await?;

        let workflows: Vec<Workflow> = self
            .repository
            .list(&WorkflowFilter {
                created_after: Some(from),
                ..WorkflowFilter::default()
            })
            .await?
            .into_iter()
            .filter(|w| w.created_at <= to)
            .collect();

        let count = |status: WorkflowStatus| workflows.iter().filter(|w| w.status == status).count();
        let completed = count(WorkflowStatus::Completed);
        let failed = count(WorkflowStatus::Failed);
        let cancelled = count(WorkflowStatus::Cancelled);
        let rolled_back = count(WorkflowStatus::RolledBack);
        let terminal = completed + failed + cancelled + rolled_back;

        let durations: Vec<f64> = workflows
            .iter()
            .filter_map(|w| match (w.started_at, w.completed_at) {
                (Some(start), Some(end)) => Some((end - start).num_seconds() as f64),
                _ => None,
            })
            .collect();
        let average_duration_seconds = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        };

        Ok(WorkflowStatistics {
            total: workflows.len(),
            running: count(WorkflowStatus::Running),
            queued: count(WorkflowStatus::Queued),
            completed,
            failed,
            cancelled,
            rolled_back,
            success_rate: if terminal == 0 {
                0.0
            } else {
                completed as f64 / terminal as f64 * 100.0
            },
            average_duration_seconds,
        })
    }

    /// Healthy iff the running and queued counts are within their limits.
    /// The computed value is cached under `orchestrator:health`.
    pub async fn refresh_health(&self) -> Result<ComponentHealth> {
        let active = self.running.len();
        let queued = self
            .repository
            .list(&WorkflowFilter {
                status: Some(WorkflowStatus::Queued),
                ..WorkflowFilter::default()
            })
            .await?
            .len();

        let mut issues = Vec::new();
        if active > self.config.max_concurrent_workflows {
            issues.push(format!(
                "{active} workflows running, limit is {}",
                self.config.max_concurrent_workflows
            ));
        }
        if queued > self.config.max_queued_workflows {
            issues.push(format!(
                "{queued} workflows queued, limit is {}",
                self.config.max_queued_workflows
            ));
        }

        let health = if issues.is_empty() {
            ComponentHealth::healthy()
        } else {
            ComponentHealth::degraded(issues)
        };

        self.cache
            .set_json(
                keys::ORCHESTRATOR_HEALTH,
                &health,
                Some(ttl::ORCHESTRATOR_HEALTH),
            )
            .await?;
        Ok(health)
    }

    pub async fn get_health(&self) -> Result<ComponentHealth> {
        if let Some(health) = self
            .cache
            .get_json::<ComponentHealth>(keys::ORCHESTRATOR_HEALTH)
            .await?
        {
            return Ok(health);
        }
        self.refresh_health().await
    }

    /// Drop terminal workflows older than the retention window.
    pub async fn cleanup_old_workflows(&self) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.workflow_cleanup_days);
        self.repository.cleanup(cutoff).await
    }
}
