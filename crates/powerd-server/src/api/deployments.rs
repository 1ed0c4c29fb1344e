//! Deployment workflow handlers.

use crate::errors::ApiError;
use crate::middleware::AuthContext;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use chrono::Utc;
use powerd_core::Error;
use powerd_workflow::{
    RollbackConfiguration, StrategyKind, Workflow, WorkflowEvent, WorkflowFilter, WorkflowRequest,
    WorkflowStatistics, WorkflowStatus,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    pub name: String,
    pub strategy: StrategyKind,
    pub target_servers: Vec<String>,
    pub service_name: String,
    pub version: String,
    pub package_url: String,
    #[serde(default)]
    pub configuration: HashMap<String, Value>,
    #[serde(default)]
    pub rollback: Option<RollbackConfiguration>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct DeploymentQuery {
    pub status: Option<String>,
    pub service: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RollbackBody {
    #[serde(default)]
    pub target_version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub hours: Option<i64>,
}

fn parse_status(raw: &str) -> Result<WorkflowStatus, Error> {
    serde_json::from_value(Value::String(raw.to_string()))
        .map_err(|_| Error::invalid_configuration(format!("unknown workflow status {raw}")))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateDeploymentRequest>,
) -> Result<Json<Workflow>, ApiError> {
    let request = WorkflowRequest {
        name: body.name,
        strategy: body.strategy,
        target_servers: body.target_servers,
        service_name: body.service_name,
        version: body.version,
        package_url: body.package_url,
        configuration: body.configuration,
        rollback: body.rollback,
        created_by: auth.username.clone(),
        timeout_seconds: body.timeout_seconds,
    };
    let workflow = state
        .orchestrator
        .create_workflow(auth.user_id, request)
        .await?;
    Ok(Json(workflow))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(params): Query<DeploymentQuery>,
) -> Result<Json<Vec<Workflow>>, ApiError> {
    let filter = WorkflowFilter {
        status: params.status.as_deref().map(parse_status).transpose()?,
        service_name: params.service,
        strategy: None,
        created_after: None,
        limit: Some(params.limit.unwrap_or(50).min(200)),
    };
    let workflows = state.orchestrator.get_workflows(auth.user_id, &filter).await?;
    Ok(Json(workflows))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Workflow>, ApiError> {
    let workflow = state.orchestrator.get_workflow(auth.user_id, id).await?;
    Ok(Json(workflow))
}

pub async fn start(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let status = state.orchestrator.start_workflow(auth.user_id, id).await?;
    Ok(Json(json!({ "id": id, "status": status })))
}

pub async fn cancel(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelBody>>,
) -> Result<Json<Value>, ApiError> {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "cancelled via API".to_string());
    let cancelled = state
        .orchestrator
        .cancel_workflow(auth.user_id, id, &reason)
        .await?;
    Ok(Json(json!({ "id": id, "cancelled": cancelled })))
}

pub async fn pause(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    state.orchestrator.pause_workflow(auth.user_id, id).await?;
    Ok(Json(json!({ "id": id, "paused": true })))
}

pub async fn resume(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    state.orchestrator.resume_workflow(auth.user_id, id).await?;
    Ok(Json(json!({ "id": id, "resumed": true })))
}

pub async fn rollback(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    body: Option<Json<RollbackBody>>,
) -> Result<Json<Value>, ApiError> {
    let target_version = body.and_then(|Json(b)| b.target_version);
    let status = state
        .orchestrator
        .rollback_workflow(auth.user_id, id, target_version)
        .await?;
    Ok(Json(json!({ "id": id, "status": status })))
}

pub async fn events(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<WorkflowEvent>>, ApiError> {
    let events = state
        .orchestrator
        .get_workflow_events(auth.user_id, id)
        .await?;
    Ok(Json(events))
}

pub async fn stats(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(params): Query<StatsQuery>,
) -> Result<Json<WorkflowStatistics>, ApiError> {
    let hours = params.hours.unwrap_or(24).clamp(1, 24 * 90);
    let to = Utc::now();
    let from = to - chrono::Duration::hours(hours);
    let stats = state
        .orchestrator
        .get_statistics(auth.user_id, from, to)
        .await?;
    Ok(Json(stats))
}
