//! REST surface.

pub mod alerts;
pub mod auth;
pub mod deployments;
pub mod health;
pub mod rules;

use crate::middleware::require_auth;
use crate::state::AppState;
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        // Deployments
        .route(
            "/deployments",
            post(deployments::create).get(deployments::list),
        )
        .route("/deployments/stats", get(deployments::stats))
        .route("/deployments/:id", get(deployments::get))
        .route("/deployments/:id/start", post(deployments::start))
        .route("/deployments/:id/cancel", post(deployments::cancel))
        .route("/deployments/:id/pause", post(deployments::pause))
        .route("/deployments/:id/resume", post(deployments::resume))
        .route("/deployments/:id/rollback", post(deployments::rollback))
        .route("/deployments/:id/events", get(deployments::events))
        // Alerts
        .route("/alerts", get(alerts::list))
        .route("/alerts/stats", get(alerts::stats))
        .route("/alerts/:id", get(alerts::get))
        .route("/alerts/:id/ack", post(alerts::acknowledge))
        .route("/alerts/:id/resolve", post(alerts::resolve))
        .route("/alerts/:id/escalate", post(alerts::escalate))
        .route("/alerts/:id/suppress", post(alerts::suppress))
        .route("/alerts/:id/unsuppress", post(alerts::unsuppress))
        .route("/alerts/:id/comment", post(alerts::comment))
        // Alert rules
        .route("/alert-rules", get(rules::list).post(rules::create))
        .route(
            "/alert-rules/:id",
            get(rules::get).put(rules::update).delete(rules::delete),
        )
        .route("/alert-rules/:id/enable", post(rules::enable))
        .route("/alert-rules/:id/disable", post(rules::disable))
        .route("/alert-rules/:id/test", post(rules::test))
        .route("/alert-rules/:id/duplicate", post(rules::duplicate))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ));

    let api = Router::new()
        .route("/auth/login", post(auth::login))
        .merge(protected);

    Router::new()
        .route("/health", get(health::readiness))
        .route("/health/orchestrator", get(health::orchestrator))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                .allow_headers(Any)
                .allow_origin(Any),
        )
        .with_state(state)
}
