//! Health endpoints.

use crate::errors::ApiError;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use chrono::Utc;
use powerd_core::ComponentHealth;
use serde_json::{json, Value};

/// Process readiness.
pub async fn readiness() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "powerdaemon",
        "timestamp": Utc::now(),
    }))
}

/// Orchestrator health contract (cached, refreshed on a timer).
pub async fn orchestrator(
    State(state): State<AppState>,
) -> Result<Json<ComponentHealth>, ApiError> {
    Ok(Json(state.orchestrator.get_health().await?))
}
