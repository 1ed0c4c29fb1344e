//! Background task supervisor.
//!
//! The alert evaluator, notification retry worker, and cleanup workers run
//! as independent long-lived tasks. The supervisor restarts a task that
//! returns an error, with exponential backoff, until shutdown is requested.

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

pub struct Supervisor {
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }

    /// Token shared with supervised tasks; workers should poll it at their
    /// cycle boundaries.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `factory` as a supervised background task. Each invocation is one
    /// run of the worker; an `Err` return restarts it with backoff, an `Ok`
    /// return ends supervision (clean worker exit).
    pub fn spawn<F, Fut>(&self, name: &'static str, mut factory: F) -> JoinHandle<()>
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut backoff = BACKOFF_BASE;
            loop {
                if cancel.is_cancelled() {
                    return;
                }

                match factory(cancel.clone()).await {
                    Ok(()) => {
                        tracing::info!("background worker {name} exited cleanly");
                        return;
                    }
                    Err(e) => {
                        tracing::error!("background worker {name} failed: {e}; restarting in {}s", backoff.as_secs());
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return,
                }
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        })
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn restarts_failing_worker_until_it_succeeds() {
        let supervisor = Supervisor::new();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();

        let handle = supervisor.spawn("flaky", move |_cancel| {
            let counter = counter.clone();
            async move {
                let run = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if run < 3 {
                    Err(Error::internal("boom"))
                } else {
                    Ok(())
                }
            }
        });

        handle.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn shutdown_stops_restarts() {
        let supervisor = Supervisor::new();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();

        let handle = supervisor.spawn("always-failing", move |_cancel| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::internal("boom"))
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor.shutdown();
        handle.await.unwrap();
        assert!(runs.load(Ordering::SeqCst) >= 1);
    }
}
