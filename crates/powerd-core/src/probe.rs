//! Health probe port consumed by the executor and rollback engine.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// One-shot health check for a service on a host.
    async fn check(&self, host: &str, service: &str) -> Result<bool>;
}

/// Poll the probe until the service reports healthy, the timeout elapses,
/// or the operation is cancelled.
pub async fn wait_until_healthy(
    probe: &dyn HealthProbe,
    host: &str,
    service: &str,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::invalid_state(format!(
                "health wait for {service} on {host} cancelled"
            )));
        }

        // A probe failure here is a false negative within the window, not a
        // hard error; keep polling until the deadline.
        match probe.check(host, service).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => tracing::debug!("health probe error for {host}/{service}: {e}"),
        }

        if tokio::time::Instant::now() + poll_interval > deadline {
            return Err(Error::timeout(format!(
                "{service} on {host} not healthy within {}s",
                timeout.as_secs()
            )));
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = cancel.cancelled() => {
                return Err(Error::invalid_state(format!(
                    "health wait for {service} on {host} cancelled"
                )));
            }
        }
    }
}
