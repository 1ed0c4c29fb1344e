//! PowerDaemon server: REST surface plus the background engine workers.

mod api;
mod errors;
mod metrics;
mod middleware;
mod probe;
mod state;

use powerd_core::{EngineConfig, Supervisor};
use state::AppState;
use std::net::SocketAddr;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "powerd=info,tower_http=warn".into()),
        )
        .init();

    let config = EngineConfig::load()?;
    let state = AppState::build(config.clone()).await?;

    bootstrap_admin_user(&state).await?;

    let supervisor = Supervisor::new();
    spawn_workers(&supervisor, &state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let app = api::router(state);

    tracing::info!("powerdaemon listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    supervisor.shutdown();
    tracing::info!("powerdaemon stopped");
    Ok(())
}

/// Seed the bootstrap admin account. The password comes from
/// `POWERD_ADMIN_PASSWORD`; without it no account is created and the API
/// only serves the health endpoints usefully.
async fn bootstrap_admin_user(state: &AppState) -> anyhow::Result<()> {
    match std::env::var("POWERD_ADMIN_PASSWORD") {
        Ok(password) if !password.is_empty() => {
            state
                .auth
                .register_user("admin", &password, vec!["admin".to_string()])
                .await?;
            Ok(())
        }
        _ => {
            tracing::warn!(
                "POWERD_ADMIN_PASSWORD not set; no bootstrap account was created"
            );
            Ok(())
        }
    }
}

fn spawn_workers(supervisor: &Supervisor, state: &AppState) {
    let evaluator = state.evaluator.clone();
    supervisor.spawn("alert-evaluator", move |cancel| {
        let evaluator = evaluator.clone();
        async move { evaluator.run(cancel).await }
    });

    let dispatcher = state.dispatcher.clone();
    supervisor.spawn("notification-retry", move |cancel| {
        let dispatcher = dispatcher.clone();
        async move {
            dispatcher
                .run_retry_worker(cancel, Duration::from_secs(60))
                .await
        }
    });

    let orchestrator = state.orchestrator.clone();
    let health_interval = state.config.orchestrator.health_check_interval_seconds.max(1);
    supervisor.spawn("orchestrator-health", move |cancel| {
        let orchestrator = orchestrator.clone();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(health_interval));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => return Ok(()),
                }
                if let Err(e) = orchestrator.refresh_health().await {
                    tracing::warn!("health refresh failed: {e}");
                }
            }
        }
    });

    let alerts = state.alerts.clone();
    supervisor.spawn("suppression-reaper", move |cancel| {
        let alerts = alerts.clone();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => return Ok(()),
                }
                if let Err(e) = alerts.reap_expired_suppressions().await {
                    tracing::warn!("suppression reap failed: {e}");
                }
            }
        }
    });

    let orchestrator = state.orchestrator.clone();
    let alerts = state.alerts.clone();
    let retention_days = state.config.alerting.alert_retention_days;
    supervisor.spawn("retention-cleanup", move |cancel| {
        let orchestrator = orchestrator.clone();
        let alerts = alerts.clone();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(6 * 3600));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => return Ok(()),
                }
                if let Err(e) = orchestrator.cleanup_old_workflows().await {
                    tracing::warn!("workflow cleanup failed: {e}");
                }
                if let Err(e) = alerts.cleanup_expired(retention_days).await {
                    tracing::warn!("alert cleanup failed: {e}");
                }
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!("failed to install SIGTERM handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
