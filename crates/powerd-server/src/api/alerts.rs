//! Alert lifecycle handlers.

use crate::errors::ApiError;
use crate::middleware::AuthContext;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use powerd_alerting::{Alert, AlertStatsSummary, AlertStatus};
use powerd_core::Error;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommentBody {
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SuppressBody {
    pub duration_seconds: u64,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct AddCommentBody {
    pub comment: String,
}

fn parse_status(raw: &str) -> Result<AlertStatus, Error> {
    serde_json::from_value(Value::String(raw.to_string()))
        .map_err(|_| Error::invalid_configuration(format!("unknown alert status {raw}")))
}

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<AlertQuery>,
) -> Result<Json<Vec<Alert>>, ApiError> {
    let status = params.status.as_deref().map(parse_status).transpose()?;
    let alerts = state.alerts.list_alerts(status).await?;
    Ok(Json(alerts))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Alert>, ApiError> {
    Ok(Json(state.alerts.get_alert(id).await?))
}

pub async fn acknowledge(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    body: Option<Json<CommentBody>>,
) -> Result<Json<Alert>, ApiError> {
    let comment = body.and_then(|Json(b)| b.comment);
    let alert = state
        .alerts
        .acknowledge(id, &auth.username, comment)
        .await?;
    Ok(Json(alert))
}

pub async fn resolve(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    body: Option<Json<CommentBody>>,
) -> Result<Json<Alert>, ApiError> {
    let comment = body.and_then(|Json(b)| b.comment);
    let alert = state.alerts.resolve(id, &auth.username, comment).await?;
    Ok(Json(alert))
}

pub async fn escalate(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    body: Option<Json<CommentBody>>,
) -> Result<Json<Alert>, ApiError> {
    let comment = body.and_then(|Json(b)| b.comment);
    let alert = state.alerts.escalate(id, &auth.username, comment).await?;
    Ok(Json(alert))
}

pub async fn suppress(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SuppressBody>,
) -> Result<Json<Alert>, ApiError> {
    let alert = state
        .alerts
        .suppress(id, Duration::from_secs(body.duration_seconds), &body.reason)
        .await?;
    Ok(Json(alert))
}

pub async fn unsuppress(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Alert>, ApiError> {
    Ok(Json(state.alerts.unsuppress(id).await?))
}

pub async fn comment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(body): Json<AddCommentBody>,
) -> Result<Json<Alert>, ApiError> {
    let alert = state
        .alerts
        .add_comment(id, &auth.username, &body.comment)
        .await?;
    Ok(Json(alert))
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<AlertStatsSummary>, ApiError> {
    Ok(Json(state.alerts.stats().await?))
}
