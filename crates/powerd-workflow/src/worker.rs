//! Step worker port for validation, cleanup, and custom steps.
//!
//! The executor delegates these step types to an external worker; the
//! default implementation accepts everything, and `MetricsGuardWorker`
//! enforces rollback triggers during monitoring steps.

use crate::model::{Phase, Step, Workflow};
use async_trait::async_trait;
use chrono::Utc;
use powerd_core::{aggregate, AggregationKind, Error, MetricsProvider, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait StepWorker: Send + Sync {
    async fn run(
        &self,
        workflow: &Workflow,
        phase: &Phase,
        step: &Step,
        cancel: &CancellationToken,
    ) -> Result<String>;
}

/// Accepts every delegated step. Suitable when validation runs agent-side.
pub struct NoopStepWorker;

#[async_trait]
impl StepWorker for NoopStepWorker {
    async fn run(
        &self,
        _workflow: &Workflow,
        _phase: &Phase,
        step: &Step,
        _cancel: &CancellationToken,
    ) -> Result<String> {
        Ok(format!("{} accepted", step.name))
    }
}

/// Watches rollback triggers during monitoring steps.
///
/// A step carrying `monitoring_duration_seconds` and `rollback_triggers`
/// is observed for its duration: the service error rate is sampled on an
/// interval and compared against `ErrorRateThreshold`; a breach fails the
/// step. Steps without triggers pass through immediately.
pub struct MetricsGuardWorker {
    metrics: Arc<dyn MetricsProvider>,
    poll_interval: Duration,
}

impl MetricsGuardWorker {
    pub fn new(metrics: Arc<dyn MetricsProvider>) -> Self {
        Self {
            metrics,
            poll_interval: Duration::from_secs(10),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn sample_error_rate(&self, workflow: &Workflow, window: Duration) -> Result<Option<f64>> {
        let to = Utc::now();
        let from = to - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::seconds(60));
        let mut filters = HashMap::new();
        filters.insert("service".to_string(), workflow.service_name.clone());
        let samples = self
            .metrics
            .query_range("error_rate", from, to, &filters)
            .await?;
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        Ok(aggregate(&values, AggregationKind::Avg))
    }
}

#[async_trait]
impl StepWorker for MetricsGuardWorker {
    async fn run(
        &self,
        workflow: &Workflow,
        _phase: &Phase,
        step: &Step,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let duration = match step.param_u64("monitoring_duration_seconds") {
            Some(seconds) => Duration::from_secs(seconds),
            None => return Ok(format!("{} accepted", step.name)),
        };
        let threshold = step
            .parameters
            .get("rollback_triggers")
            .and_then(|t| t.get("ErrorRateThreshold"))
            .and_then(serde_json::Value::as_f64);

        let Some(threshold) = threshold else {
            // Pure soak: wait out the window, cancel-aware.
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = cancel.cancelled() => {
                    return Err(Error::invalid_state("monitoring cancelled"));
                }
            }
            return Ok(format!("soaked for {}s", duration.as_secs()));
        };

        let deadline = tokio::time::Instant::now() + duration;
        loop {
            if let Some(rate) = self.sample_error_rate(workflow, self.poll_interval * 6).await? {
                if rate > threshold {
                    return Err(Error::internal(format!(
                        "error rate {rate:.2} exceeded rollback trigger {threshold:.2}"
                    )));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(format!(
                    "monitored {}s without trigger breaches",
                    duration.as_secs()
                ));
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => {
                    return Err(Error::invalid_state("monitoring cancelled"));
                }
            }
        }
    }
}
