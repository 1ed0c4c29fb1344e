//! Workflow executor: the phase/step state machine.
//!
//! Phases run strictly in order; steps within a phase run in declared
//! order. Before each phase and each step the executor consults the cache
//! pause marker, and every long wait is cancel-aware. Retries use linear
//! backoff (`retry_delay × attempt`); a critical step failure fails the
//! phase, a non-critical failure marks the step Skipped.

use crate::events::WorkflowEventKind;
use crate::lb::LoadBalancer;
use crate::model::{PhaseStatus, Step, StepStatus, StepType, Workflow, WorkflowStatus};
use crate::repository::WorkflowRepository;
use crate::rollback::RollbackEngine;
use crate::worker::StepWorker;
use chrono::Utc;
use powerd_core::bus::{topics, DeploymentCommand};
use powerd_core::cache::keys;
use powerd_core::config::OrchestratorConfig;
use powerd_core::{wait_until_healthy, CacheStore, Error, HealthProbe, MessageBus, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct ExecutorContext {
    pub repository: Arc<WorkflowRepository>,
    pub bus: Arc<dyn MessageBus>,
    pub cache: Arc<dyn CacheStore>,
    pub probe: Arc<dyn HealthProbe>,
    pub load_balancer: Arc<dyn LoadBalancer>,
    pub step_worker: Arc<dyn StepWorker>,
    pub rollback: Arc<RollbackEngine>,
    pub config: OrchestratorConfig,
}

enum RunOutcome {
    Completed,
    Cancelled,
    PhaseFailed { phase_index: usize },
}

enum StepOutcome {
    Completed,
    Skipped,
    Failed,
    Cancelled,
}

pub struct WorkflowExecutor {
    ctx: ExecutorContext,
    pause_poll_interval: Duration,
    health_poll_interval: Duration,
}

impl WorkflowExecutor {
    pub fn new(ctx: ExecutorContext) -> Self {
        Self {
            ctx,
            pause_poll_interval: Duration::from_secs(5),
            health_poll_interval: HEALTH_POLL_INTERVAL,
        }
    }

    pub fn with_pause_poll_interval(mut self, interval: Duration) -> Self {
        self.pause_poll_interval = interval;
        self
    }

    pub fn with_health_poll_interval(mut self, interval: Duration) -> Self {
        self.health_poll_interval = interval;
        self
    }

    /// Drive the workflow to a terminal state. Returns whether it completed
    /// successfully.
    pub async fn execute(&self, workflow_id: Uuid, cancel: CancellationToken) -> Result<bool> {
        let mut workflow = self.ctx.repository.get(workflow_id).await?;
        if workflow.status != WorkflowStatus::Running {
            return Err(Error::invalid_state(format!(
                "workflow {workflow_id} is {:?}, not Running",
                workflow.status
            )));
        }

        let deadline = workflow.timeout();
        let outcome = tokio::time::timeout(deadline, self.run_phases(&mut workflow, &cancel)).await;

        match outcome {
            Ok(Ok(RunOutcome::Completed)) => {
                workflow.transition_to(WorkflowStatus::Completed)?;
                workflow.recompute_progress();
                self.save(&mut workflow).await?;
                self.ctx
                    .repository
                    .record(workflow.id, WorkflowEventKind::Completed, "workflow completed")
                    .await?;
                Ok(true)
            }
            Ok(Ok(RunOutcome::Cancelled)) => {
                workflow.transition_to(WorkflowStatus::Cancelled)?;
                self.save(&mut workflow).await?;
                self.ctx
                    .repository
                    .record(workflow.id, WorkflowEventKind::Cancelled, "workflow cancelled")
                    .await?;
                Ok(false)
            }
            Ok(Ok(RunOutcome::PhaseFailed { phase_index })) => {
                let phase_rollback = workflow.phases[phase_index].rollback_on_failure;
                let reason = format!(
                    "phase {} failed after retries",
                    workflow.phases[phase_index].name
                );
                self.fail_workflow(&mut workflow, reason, phase_rollback, &cancel)
                    .await?;
                Ok(false)
            }
            Ok(Err(e)) => {
                self.fail_workflow(&mut workflow, e.to_string(), false, &cancel)
                    .await?;
                Ok(false)
            }
            Err(_elapsed) => {
                // The run future was dropped mid-save; reload for a clean
                // revision before writing the terminal state.
                let mut workflow = self.ctx.repository.get(workflow_id).await?;
                let auto = workflow
                    .rollback
                    .as_ref()
                    .map(|r| r.automatic_rollback)
                    .unwrap_or(false);
                let reason = format!(
                    "workflow exceeded its {}s deadline",
                    workflow.timeout_seconds
                );
                self.fail_workflow(&mut workflow, reason, auto, &cancel)
                    .await?;
                Ok(false)
            }
        }
    }

    /// Terminal failure handling: attempt rollback when requested and
    /// permitted, then settle on Failed or RolledBack.
    async fn fail_workflow(
        &self,
        workflow: &mut Workflow,
        reason: String,
        want_rollback: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tracing::warn!(workflow_id = %workflow.id, "workflow failing: {reason}");
        workflow.record_error(reason.clone());

        let rollback_allowed = workflow
            .rollback
            .as_ref()
            .map(|r| r.enabled)
            .unwrap_or(false);

        if want_rollback && rollback_allowed {
            workflow.transition_to(WorkflowStatus::RollingBack)?;
            self.save(workflow).await?;

            let timeout = Duration::from_secs(self.ctx.config.rollback_timeout_minutes * 60);
            let rolled_back = self
                .ctx
                .rollback
                .rollback(workflow, None, timeout, cancel)
                .await;

            match rolled_back {
                Ok(()) => {
                    workflow.transition_to(WorkflowStatus::RolledBack)?;
                    self.save(workflow).await?;
                    return Ok(());
                }
                Err(e) => {
                    workflow.record_error(format!("rollback failed: {e}"));
                    workflow.transition_to(WorkflowStatus::Failed)?;
                    self.save(workflow).await?;
                    self.ctx
                        .repository
                        .record(workflow.id, WorkflowEventKind::Failed, reason)
                        .await?;
                    return Ok(());
                }
            }
        }

        workflow.transition_to(WorkflowStatus::Failed)?;
        self.save(workflow).await?;
        self.ctx
            .repository
            .record(workflow.id, WorkflowEventKind::Failed, reason)
            .await?;
        Ok(())
    }

    async fn run_phases(
        &self,
        workflow: &mut Workflow,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        for phase_index in workflow.current_phase_index..workflow.phases.len() {
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            if !self.wait_if_paused(workflow, cancel).await? {
                return Ok(RunOutcome::Cancelled);
            }

            workflow.current_phase_index = phase_index;
            match self.execute_phase(workflow, phase_index, cancel).await? {
                PhaseStatus::Completed => {
                    workflow.recompute_progress();
                    self.save(workflow).await?;
                }
                PhaseStatus::Cancelled => return Ok(RunOutcome::Cancelled),
                _ => return Ok(RunOutcome::PhaseFailed { phase_index }),
            }
        }
        Ok(RunOutcome::Completed)
    }

    /// Run one phase through its retry budget. Returns the final phase
    /// status (Completed, Failed, or Cancelled).
    async fn execute_phase(
        &self,
        workflow: &mut Workflow,
        phase_index: usize,
        cancel: &CancellationToken,
    ) -> Result<PhaseStatus> {
        let (phase_id, phase_name, max_retries, phase_timeout) = {
            let phase = &mut workflow.phases[phase_index];
            phase.status = PhaseStatus::Running;
            phase.started_at = Some(Utc::now());
            (phase.id, phase.name.clone(), phase.max_retries, phase.timeout())
        };
        self.save(workflow).await?;
        self.ctx
            .repository
            .record_event(
                crate::events::WorkflowEvent::new(
                    workflow.id,
                    WorkflowEventKind::PhaseStarted,
                    format!("phase {phase_name} started"),
                )
                .with_phase(phase_id),
            )
            .await?;

        let attempts = max_retries + 1;
        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                workflow.phases[phase_index].status = PhaseStatus::Cancelled;
                self.save(workflow).await?;
                return Ok(PhaseStatus::Cancelled);
            }

            let attempt_outcome = tokio::time::timeout(
                phase_timeout,
                self.execute_phase_attempt(workflow, phase_index, cancel),
            )
            .await;

            match attempt_outcome {
                Ok(Ok(true)) => {
                    let phase = &mut workflow.phases[phase_index];
                    phase.status = PhaseStatus::Completed;
                    phase.completed_at = Some(Utc::now());
                    self.save(workflow).await?;
                    self.ctx
                        .repository
                        .record_event(
                            crate::events::WorkflowEvent::new(
                                workflow.id,
                                WorkflowEventKind::PhaseCompleted,
                                format!("phase {phase_name} completed"),
                            )
                            .with_phase(phase_id),
                        )
                        .await?;
                    return Ok(PhaseStatus::Completed);
                }
                Ok(Ok(false)) => {
                    workflow.phases[phase_index].status = PhaseStatus::Cancelled;
                    self.save(workflow).await?;
                    return Ok(PhaseStatus::Cancelled);
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        workflow_id = %workflow.id,
                        "phase {phase_name} attempt {attempt}/{attempts} failed: {e}"
                    );
                    workflow.record_error(format!("{phase_name} attempt {attempt}: {e}"));
                }
                Err(_elapsed) => {
                    tracing::warn!(
                        workflow_id = %workflow.id,
                        "phase {phase_name} attempt {attempt}/{attempts} timed out"
                    );
                    workflow.record_error(format!("{phase_name} attempt {attempt}: phase timeout"));
                }
            }

            workflow.phases[phase_index].retry_count = attempt;
            self.save(workflow).await?;

            if attempt < attempts && !self.backoff(attempt, cancel).await {
                workflow.phases[phase_index].status = PhaseStatus::Cancelled;
                self.save(workflow).await?;
                return Ok(PhaseStatus::Cancelled);
            }
        }

        let phase = &mut workflow.phases[phase_index];
        phase.status = PhaseStatus::Failed;
        phase.completed_at = Some(Utc::now());
        self.save(workflow).await?;
        self.ctx
            .repository
            .record_event(
                crate::events::WorkflowEvent::new(
                    workflow.id,
                    WorkflowEventKind::PhaseFailed,
                    format!("phase {phase_name} failed after {attempts} attempts"),
                )
                .with_phase(phase_id),
            )
            .await?;
        Ok(PhaseStatus::Failed)
    }

    /// One pass over the phase's steps. Steps already Completed or Skipped
    /// (from an earlier attempt) are not re-run. Returns false on
    /// cancellation.
    async fn execute_phase_attempt(
        &self,
        workflow: &mut Workflow,
        phase_index: usize,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        for step_index in 0..workflow.phases[phase_index].steps.len() {
            {
                let status = workflow.phases[phase_index].steps[step_index].status;
                if matches!(status, StepStatus::Completed | StepStatus::Skipped) {
                    continue;
                }
            }
            if cancel.is_cancelled() {
                workflow.phases[phase_index].steps[step_index].status = StepStatus::Cancelled;
                return Ok(false);
            }
            if !self.wait_if_paused(workflow, cancel).await? {
                return Ok(false);
            }

            match self
                .execute_step(workflow, phase_index, step_index, cancel)
                .await?
            {
                StepOutcome::Completed | StepOutcome::Skipped => {}
                StepOutcome::Cancelled => return Ok(false),
                StepOutcome::Failed => {
                    let step_name = workflow.phases[phase_index].steps[step_index].name.clone();
                    return Err(Error::internal(format!("critical step {step_name} failed")));
                }
            }
        }
        Ok(true)
    }

    async fn execute_step(
        &self,
        workflow: &mut Workflow,
        phase_index: usize,
        step_index: usize,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        let (step_id, step_name, delay_before, step_timeout, max_retries) = {
            let max_retries = workflow.phases[phase_index].max_retries;
            let step = &mut workflow.phases[phase_index].steps[step_index];
            step.status = StepStatus::Running;
            step.started_at = Some(Utc::now());
            let timeout = step
                .param_u64("timeout_seconds")
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(self.ctx.config.step_timeout_minutes * 60));
            (
                step.id,
                step.name.clone(),
                step.param_u64("delay_before_seconds"),
                timeout,
                max_retries,
            )
        };
        self.save(workflow).await?;
        self.ctx
            .repository
            .record_event(
                crate::events::WorkflowEvent::new(
                    workflow.id,
                    WorkflowEventKind::StepStarted,
                    format!("step {step_name} started"),
                )
                .with_step(step_id),
            )
            .await?;

        if let Some(delay) = delay_before {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                _ = cancel.cancelled() => {
                    workflow.phases[phase_index].steps[step_index].status = StepStatus::Cancelled;
                    return Ok(StepOutcome::Cancelled);
                }
            }
        }

        let attempts = max_retries + 1;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                workflow.phases[phase_index].steps[step_index].status = StepStatus::Cancelled;
                return Ok(StepOutcome::Cancelled);
            }

            let dispatched = tokio::time::timeout(
                step_timeout,
                self.dispatch_step(workflow, phase_index, step_index, cancel),
            )
            .await;

            let result = match dispatched {
                Ok(result) => result,
                Err(_elapsed) => Err(Error::timeout(format!(
                    "step {step_name} exceeded {}s",
                    step_timeout.as_secs()
                ))),
            };

            match result {
                Ok(output) => {
                    let step = &mut workflow.phases[phase_index].steps[step_index];
                    step.status = StepStatus::Completed;
                    step.output = Some(output);
                    step.completed_at = Some(Utc::now());
                    self.save(workflow).await?;
                    self.ctx
                        .repository
                        .record_event(
                            crate::events::WorkflowEvent::new(
                                workflow.id,
                                WorkflowEventKind::StepCompleted,
                                format!("step {step_name} completed"),
                            )
                            .with_step(step_id),
                        )
                        .await?;
                    return Ok(StepOutcome::Completed);
                }
                Err(e) => {
                    last_error = e.to_string();
                    let step = &mut workflow.phases[phase_index].steps[step_index];
                    step.retry_count = attempt;
                    step.error = Some(last_error.clone());
                    self.save(workflow).await?;

                    if attempt < attempts && !self.backoff(attempt, cancel).await {
                        workflow.phases[phase_index].steps[step_index].status =
                            StepStatus::Cancelled;
                        return Ok(StepOutcome::Cancelled);
                    }
                }
            }
        }

        let critical = workflow.phases[phase_index].steps[step_index].is_critical();
        {
            let step = &mut workflow.phases[phase_index].steps[step_index];
            step.status = if critical {
                StepStatus::Failed
            } else {
                StepStatus::Skipped
            };
            step.completed_at = Some(Utc::now());
        }
        self.save(workflow).await?;
        self.ctx
            .repository
            .record_event(
                crate::events::WorkflowEvent::new(
                    workflow.id,
                    WorkflowEventKind::StepFailed,
                    format!(
                        "step {step_name} failed after {attempts} attempts: {last_error}{}",
                        if critical { "" } else { " (skipped)" }
                    ),
                )
                .with_step(step_id),
            )
            .await?;

        Ok(if critical {
            StepOutcome::Failed
        } else {
            StepOutcome::Skipped
        })
    }

    /// Closed dispatch on the step type.
    async fn dispatch_step(
        &self,
        workflow: &Workflow,
        phase_index: usize,
        step_index: usize,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let step = workflow.phases[phase_index].steps[step_index].clone();

        match step.step_type {
            StepType::Deploy => {
                // A batch deploy is a single logical step: the per-host
                // fan-out belongs to the external parallel worker, keeping
                // bus publications for the step within its retry budget.
                if step.parameters.contains_key("servers") {
                    self.ctx
                        .step_worker
                        .run(workflow, &workflow.phases[phase_index], &step, cancel)
                        .await
                } else {
                    self.dispatch_deploy(workflow, &step).await
                }
            }
            StepType::ServiceStart => self.dispatch_service(workflow, &step, "start").await,
            StepType::ServiceStop => self.dispatch_service(workflow, &step, "stop").await,
            StepType::ServiceRestart => self.dispatch_service(workflow, &step, "restart").await,
            StepType::HealthCheck => {
                let host = step_host(&step)?;
                let healthy = self.ctx.probe.check(host, &workflow.service_name).await?;
                if healthy {
                    Ok(format!("{host} healthy"))
                } else {
                    Err(Error::internal(format!("{host} reported unhealthy")))
                }
            }
            StepType::WaitForHealthy => {
                let host = step_host(&step)?;
                let timeout = step
                    .param_u64("timeout_seconds")
                    .map(Duration::from_secs)
                    .unwrap_or(Duration::from_secs(300));
                wait_until_healthy(
                    self.ctx.probe.as_ref(),
                    host,
                    &workflow.service_name,
                    timeout,
                    self.health_poll_interval,
                    cancel,
                )
                .await?;
                Ok(format!("{host} healthy"))
            }
            StepType::TrafficSwitch => self.dispatch_traffic_switch(&step).await,
            StepType::Validation | StepType::Cleanup | StepType::Custom => {
                self.ctx
                    .step_worker
                    .run(workflow, &workflow.phases[phase_index], &step, cancel)
                    .await
            }
        }
    }

    /// Single-host deploy: exactly one bus publication per attempt.
    async fn dispatch_deploy(&self, workflow: &Workflow, step: &Step) -> Result<String> {
        let host = step_host(step)?;
        let command = self.deployment_command(workflow, step, host);
        self.ctx
            .bus
            .publish(&topics::deploy(host), serde_json::to_value(&command)?)
            .await?;
        Ok(format!("deploy dispatched to {host}"))
    }

    async fn dispatch_service(
        &self,
        workflow: &Workflow,
        step: &Step,
        verb: &str,
    ) -> Result<String> {
        let host = step_host(step)?;
        let payload = serde_json::json!({
            "serviceName": workflow.service_name,
            "command": verb,
            "workflowId": workflow.id.to_string(),
            "stepId": step.id.to_string(),
        });
        self.ctx.bus.publish(&topics::service(host), payload).await?;
        Ok(format!("{verb} dispatched to {host}"))
    }

    async fn dispatch_traffic_switch(&self, step: &Step) -> Result<String> {
        match step.param_str("action").unwrap_or("switch") {
            "add" => {
                let host = step_host(step)?;
                self.ctx.load_balancer.add_server(host).await?;
                Ok(format!("{host} added to load balancer"))
            }
            "remove" => {
                let host = step_host(step)?;
                self.ctx.load_balancer.remove_server(host).await?;
                Ok(format!("{host} removed from load balancer"))
            }
            _ => {
                let from = step_server_list(step, "from");
                let to = step_server_list(step, "to");
                self.ctx.load_balancer.switch_traffic(&from, &to).await?;
                Ok(format!("traffic switched to {} servers", to.len()))
            }
        }
    }

    fn deployment_command(
        &self,
        workflow: &Workflow,
        step: &Step,
        server: &str,
    ) -> DeploymentCommand {
        let mut configuration: HashMap<String, serde_json::Value> = workflow.configuration.clone();
        configuration.insert(
            "workflowId".to_string(),
            serde_json::json!(workflow.id.to_string()),
        );
        configuration.insert("stepId".to_string(), serde_json::json!(step.id.to_string()));
        for (key, value) in &step.parameters {
            configuration.entry(key.clone()).or_insert_with(|| value.clone());
        }

        DeploymentCommand {
            deployment_id: workflow.id,
            target_server_id: server.to_string(),
            service_name: workflow.service_name.clone(),
            strategy: workflow.strategy.to_string(),
            package_url: workflow.package_url.clone(),
            version: workflow.version.clone(),
            configuration,
        }
    }

    /// Hold at the pause marker. While paused the workflow status reflects
    /// Paused; the marker is polled every `pause_poll_interval`. Returns
    /// false when cancelled during the pause.
    async fn wait_if_paused(
        &self,
        workflow: &mut Workflow,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let pause_key = keys::workflow_pause(workflow.id);
        if !self.ctx.cache.exists(&pause_key).await? {
            return Ok(true);
        }

        if workflow.status == WorkflowStatus::Running {
            workflow.transition_to(WorkflowStatus::Paused)?;
            self.save(workflow).await?;
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            if !self.ctx.cache.exists(&pause_key).await? {
                workflow.transition_to(WorkflowStatus::Running)?;
                self.save(workflow).await?;
                return Ok(true);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.pause_poll_interval) => {}
                _ = cancel.cancelled() => return Ok(false),
            }
        }
    }

    /// Linear backoff between retries. Returns false when cancelled.
    async fn backoff(&self, attempt: u32, cancel: &CancellationToken) -> bool {
        let delay = Duration::from_secs(self.ctx.config.retry_delay_seconds * attempt as u64);
        if delay.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        }
    }

    async fn save(&self, workflow: &mut Workflow) -> Result<()> {
        self.ctx.repository.save(workflow).await
    }
}

fn step_host(step: &Step) -> Result<&str> {
    step.target_server
        .as_deref()
        .ok_or_else(|| Error::invalid_configuration(format!("step {} has no target host", step.name)))
}

fn step_server_list(step: &Step, key: &str) -> Vec<String> {
    step.parameters
        .get(key)
        .and_then(serde_json::Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(serde_json::Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Phase, RollbackConfiguration, StrategyKind, WorkflowRequest};
    use crate::repository::InMemoryWorkflowStore;
    use crate::strategy::{RollingPlanner, StrategyPlanner};
    use crate::worker::NoopStepWorker;
    use async_trait::async_trait;
    use powerd_core::cache::ttl;
    use powerd_core::{BusMessage, MemoryCache};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct AlwaysHealthy;

    #[async_trait]
    impl HealthProbe for AlwaysHealthy {
        async fn check(&self, _host: &str, _service: &str) -> Result<bool> {
            Ok(true)
        }
    }

    struct RecordingBus {
        topics: Mutex<Vec<String>>,
    }

    impl RecordingBus {
        fn new() -> Self {
            Self {
                topics: Mutex::new(Vec::new()),
            }
        }

        fn published(&self) -> Vec<String> {
            self.topics.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageBus for RecordingBus {
        async fn publish(&self, topic: &str, _payload: serde_json::Value) -> Result<()> {
            self.topics.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BusMessage> {
            let (sender, receiver) = tokio::sync::broadcast::channel(1);
            drop(sender);
            receiver
        }
    }

    /// Worker that fails a named step a fixed number of times.
    struct FlakyWorker {
        failing_step: String,
        failures_left: AtomicU32,
        invocations: AtomicU32,
    }

    impl FlakyWorker {
        fn failing(step: &str, failures: u32) -> Self {
            Self {
                failing_step: step.to_string(),
                failures_left: AtomicU32::new(failures),
                invocations: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl StepWorker for FlakyWorker {
        async fn run(
            &self,
            _workflow: &Workflow,
            _phase: &Phase,
            step: &Step,
            _cancel: &CancellationToken,
        ) -> Result<String> {
            if step.name == self.failing_step {
                self.invocations.fetch_add(1, Ordering::SeqCst);
                let remaining = self.failures_left.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.failures_left.fetch_sub(1, Ordering::SeqCst);
                    return Err(Error::internal("injected failure"));
                }
            }
            Ok(format!("{} accepted", step.name))
        }
    }

    struct Harness {
        repository: Arc<WorkflowRepository>,
        cache: Arc<MemoryCache>,
        bus: Arc<RecordingBus>,
        executor: WorkflowExecutor,
    }

    fn harness(worker: Arc<dyn StepWorker>) -> Harness {
        let cache = Arc::new(MemoryCache::new());
        let cache_dyn: Arc<dyn CacheStore> = cache.clone();
        let repository = Arc::new(WorkflowRepository::new(
            Arc::new(InMemoryWorkflowStore::new()),
            cache_dyn.clone(),
        ));
        let bus = Arc::new(RecordingBus::new());
        let bus_dyn: Arc<dyn MessageBus> = bus.clone();
        let probe: Arc<dyn HealthProbe> = Arc::new(AlwaysHealthy);
        let rollback = Arc::new(
            RollbackEngine::new(repository.clone(), bus_dyn.clone(), probe.clone())
                .with_health_poll_interval(Duration::from_millis(10)),
        );
        let config = OrchestratorConfig {
            retry_delay_seconds: 0,
            step_timeout_minutes: 1,
            rollback_timeout_minutes: 1,
            ..OrchestratorConfig::default()
        };
        let executor = WorkflowExecutor::new(ExecutorContext {
            repository: repository.clone(),
            bus: bus_dyn,
            cache: cache_dyn,
            probe,
            load_balancer: Arc::new(crate::lb::NoopLoadBalancer),
            step_worker: worker,
            rollback,
            config,
        })
        .with_pause_poll_interval(Duration::from_millis(20))
        .with_health_poll_interval(Duration::from_millis(10));

        Harness {
            repository,
            cache,
            bus,
            executor,
        }
    }

    fn rolling_request(servers: &[&str]) -> WorkflowRequest {
        let mut configuration = HashMap::new();
        configuration.insert("RollingConfiguration".to_string(), serde_json::json!({}));
        configuration.insert(
            "WaveConfiguration".to_string(),
            serde_json::json!({
                "Strategy": "FixedSize",
                "WaveSize": 2,
                "WaveInterval": 0,
                "ParallelDeploymentWithinWave": false,
            }),
        );
        configuration.insert(
            "HealthCheckConfiguration".to_string(),
            serde_json::json!({ "TimeoutSeconds": 2 }),
        );
        WorkflowRequest {
            name: "rolling".into(),
            strategy: StrategyKind::Rolling,
            target_servers: servers.iter().map(|s| s.to_string()).collect(),
            service_name: "billing".into(),
            version: "2.1.0".into(),
            package_url: "https://packages.internal/p.tar.gz".into(),
            configuration,
            rollback: None,
            created_by: "op".into(),
            timeout_seconds: None,
        }
    }

    async fn start_workflow(harness: &Harness, mut workflow: Workflow) -> Uuid {
        workflow.transition_to(WorkflowStatus::Running).unwrap();
        workflow.started_at = Some(Utc::now());
        harness.repository.create(&workflow).await.unwrap();
        workflow.id
    }

    fn single_phase_workflow(steps: Vec<Step>, rollback: Option<RollbackConfiguration>) -> Workflow {
        let request = WorkflowRequest {
            name: "single".into(),
            strategy: StrategyKind::Rolling,
            target_servers: vec!["h1".into()],
            service_name: "billing".into(),
            version: "2.1.0".into(),
            package_url: "https://packages.internal/p.tar.gz".into(),
            configuration: HashMap::new(),
            rollback,
            created_by: "op".into(),
            timeout_seconds: None,
        };
        let phase = Phase::new("Only Phase", vec!["h1".into()])
            .with_steps(steps)
            .with_max_retries(1);
        Workflow::from_request(request, vec![phase], Duration::from_secs(7200))
    }

    #[tokio::test]
    async fn rolling_happy_path_completes_with_four_deploys() {
        let harness = harness(Arc::new(NoopStepWorker));
        let request = rolling_request(&["h1", "h2", "h3", "h4"]);
        let phases = RollingPlanner.plan(&request).unwrap();
        let workflow = Workflow::from_request(request, phases, Duration::from_secs(7200));
        let id = start_workflow(&harness, workflow).await;

        let done = harness
            .executor
            .execute(id, CancellationToken::new())
            .await
            .unwrap();
        assert!(done);

        let finished = harness.repository.get(id).await.unwrap();
        assert_eq!(finished.status, WorkflowStatus::Completed);
        assert_eq!(finished.progress_percent, 100);

        let deploys: Vec<String> = harness
            .bus
            .published()
            .into_iter()
            .filter(|t| t.starts_with("deploy."))
            .collect();
        assert_eq!(deploys.len(), 4);
        for host in ["h1", "h2", "h3", "h4"] {
            assert!(deploys.contains(&format!("deploy.{host}")));
        }

        let events = harness.repository.events(id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.kind == WorkflowEventKind::Completed));
    }

    #[tokio::test]
    async fn non_critical_step_failure_is_skipped() {
        let worker = Arc::new(FlakyWorker::failing("Optional validation", 10));
        let harness = harness(worker.clone());
        let steps = vec![
            Step::new("Optional validation", StepType::Validation, None),
            Step::new("Final validation", StepType::Validation, None),
        ];
        let id = start_workflow(&harness, single_phase_workflow(steps, None)).await;

        let done = harness
            .executor
            .execute(id, CancellationToken::new())
            .await
            .unwrap();
        assert!(done);

        let finished = harness.repository.get(id).await.unwrap();
        assert_eq!(finished.status, WorkflowStatus::Completed);
        assert_eq!(finished.phases[0].steps[0].status, StepStatus::Skipped);
        assert_eq!(finished.phases[0].steps[1].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn critical_step_failure_fails_the_workflow() {
        let worker = Arc::new(FlakyWorker::failing("Gate validation", 100));
        let harness = harness(worker.clone());
        let steps = vec![Step::new("Gate validation", StepType::Validation, None)
            .with_param("critical", serde_json::json!(true))];
        let id = start_workflow(&harness, single_phase_workflow(steps, None)).await;

        let done = harness
            .executor
            .execute(id, CancellationToken::new())
            .await
            .unwrap();
        assert!(!done);

        let finished = harness.repository.get(id).await.unwrap();
        assert_eq!(finished.status, WorkflowStatus::Failed);
        assert_eq!(finished.phases[0].status, PhaseStatus::Failed);

        // Phase budget (max_retries 1 → 2 attempts) times step budget
        // (2 attempts each): the worker saw at most 4 invocations.
        let invocations = worker.invocations.load(Ordering::SeqCst);
        assert!(invocations <= 4, "saw {invocations} invocations");
        assert!(invocations >= 2);
    }

    #[tokio::test]
    async fn parallel_batch_deploy_is_one_logical_step() {
        let harness = harness(Arc::new(NoopStepWorker));
        let steps = vec![Step::new("Batch deploy", StepType::Deploy, None)
            .with_param("servers", serde_json::json!(["h1", "h2", "h3"]))
            .with_param("parallel", serde_json::json!(true))];
        let id = start_workflow(&harness, single_phase_workflow(steps, None)).await;

        let done = harness
            .executor
            .execute(id, CancellationToken::new())
            .await
            .unwrap();
        assert!(done);

        // The per-host fan-out is the worker's; the engine publishes no
        // per-server deploy commands for a batch step.
        assert!(harness
            .bus
            .published()
            .iter()
            .all(|t| !t.starts_with("deploy.")));
    }

    #[tokio::test]
    async fn batch_deploy_publications_stay_within_the_retry_budget() {
        let worker = Arc::new(FlakyWorker::failing("Batch deploy", 100));
        let harness = harness(worker);
        let steps = vec![Step::new("Batch deploy", StepType::Deploy, None)
            .with_param("servers", serde_json::json!(["h1", "h2", "h3"]))
            .with_param("parallel", serde_json::json!(true))];
        let id = start_workflow(&harness, single_phase_workflow(steps, None)).await;

        let done = harness
            .executor
            .execute(id, CancellationToken::new())
            .await
            .unwrap();
        assert!(!done);

        let finished = harness.repository.get(id).await.unwrap();
        assert_eq!(finished.status, WorkflowStatus::Failed);

        // max_retries 1 → at most 2 publications per step execution; the
        // three-host batch must not multiply them.
        let deploys = harness
            .bus
            .published()
            .iter()
            .filter(|t| t.starts_with("deploy."))
            .count();
        assert!(deploys <= 2, "saw {deploys} deploy publications");
    }

    #[tokio::test]
    async fn phase_failure_with_rollback_flag_rolls_back() {
        let worker = Arc::new(FlakyWorker::failing("Gate validation", 100));
        let harness = harness(worker);
        let steps = vec![Step::new("Gate validation", StepType::Validation, None)
            .with_param("critical", serde_json::json!(true))];
        let mut workflow = single_phase_workflow(
            steps,
            Some(RollbackConfiguration {
                enabled: true,
                automatic_rollback: true,
                target_version: Some("2.0.0".into()),
                health_check_timeout_seconds: 2,
            }),
        );
        workflow.phases[0].rollback_on_failure = true;
        let id = start_workflow(&harness, workflow).await;

        let done = harness
            .executor
            .execute(id, CancellationToken::new())
            .await
            .unwrap();
        assert!(!done);

        let finished = harness.repository.get(id).await.unwrap();
        assert_eq!(finished.status, WorkflowStatus::RolledBack);

        assert!(harness
            .bus
            .published()
            .iter()
            .any(|t| t == "rollback.h1"));

        let events = harness.repository.events(id).await.unwrap();
        let kinds: Vec<WorkflowEventKind> = events.iter().map(|e| e.kind).collect();
        let started = kinds
            .iter()
            .position(|k| *k == WorkflowEventKind::RollbackStarted)
            .unwrap();
        let completed = kinds
            .iter()
            .position(|k| *k == WorkflowEventKind::RollbackCompleted)
            .unwrap();
        assert!(started < completed);
    }

    #[tokio::test]
    async fn pause_marker_holds_execution_between_steps() {
        let harness = harness(Arc::new(NoopStepWorker));
        let steps = vec![
            Step::new("First validation", StepType::Validation, None),
            Step::new("Second validation", StepType::Validation, None),
        ];
        let workflow = single_phase_workflow(steps, None);
        let pause_key = keys::workflow_pause(workflow.id);
        let id = start_workflow(&harness, workflow).await;

        harness
            .cache
            .set_raw(&pause_key, "1".into(), Some(ttl::WORKFLOW_PAUSE))
            .await
            .unwrap();

        let executor_repo = harness.repository.clone();
        let run = tokio::spawn({
            let cancel = CancellationToken::new();
            let executor = harness.executor;
            async move { executor.execute(id, cancel).await }
        });

        // Give the executor time to reach the pause gate.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let paused = executor_repo.get(id).await.unwrap();
        assert_eq!(paused.status, WorkflowStatus::Paused);
        assert_ne!(paused.phases[0].steps[1].status, StepStatus::Completed);
        assert_eq!(paused.phases[0].retry_count, 0);

        harness.cache.remove(&pause_key).await.unwrap();
        let done = run.await.unwrap().unwrap();
        assert!(done);

        let finished = executor_repo.get(id).await.unwrap();
        assert_eq!(finished.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn cancellation_terminates_the_run() {
        struct SlowWorker;

        #[async_trait]
        impl StepWorker for SlowWorker {
            async fn run(
                &self,
                _workflow: &Workflow,
                _phase: &Phase,
                _step: &Step,
                cancel: &CancellationToken,
            ) -> Result<String> {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(30)) => Ok("done".into()),
                    _ = cancel.cancelled() => Err(Error::invalid_state("cancelled")),
                }
            }
        }

        let harness = harness(Arc::new(SlowWorker));
        let steps = vec![Step::new("Slow validation", StepType::Validation, None)];
        let id = start_workflow(&harness, single_phase_workflow(steps, None)).await;

        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trip.cancel();
        });

        let done = harness.executor.execute(id, cancel).await.unwrap();
        assert!(!done);

        let finished = harness.repository.get(id).await.unwrap();
        assert_eq!(finished.status, WorkflowStatus::Cancelled);
    }

    #[tokio::test]
    async fn workflow_deadline_fails_the_run() {
        struct SleepyWorker;

        #[async_trait]
        impl StepWorker for SleepyWorker {
            async fn run(
                &self,
                _workflow: &Workflow,
                _phase: &Phase,
                _step: &Step,
                _cancel: &CancellationToken,
            ) -> Result<String> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("done".into())
            }
        }

        let harness = harness(Arc::new(SleepyWorker));
        let steps = vec![Step::new("Slow validation", StepType::Validation, None)];
        let mut workflow = single_phase_workflow(steps, None);
        workflow.timeout_seconds = 1;
        let id = start_workflow(&harness, workflow).await;

        let done = harness
            .executor
            .execute(id, CancellationToken::new())
            .await
            .unwrap();
        assert!(!done);

        let finished = harness.repository.get(id).await.unwrap();
        assert_eq!(finished.status, WorkflowStatus::Failed);
        assert!(finished.errors.iter().any(|e| e.contains("deadline")));
    }
}
