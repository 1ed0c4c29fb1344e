//! Alert rule handlers. Mutations require the `system.manage` permission.

use crate::errors::ApiError;
use crate::middleware::AuthContext;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use powerd_alerting::{AlertCondition, AlertRule, AlertSeverity, SuppressionRule};
use powerd_core::{aggregate, Error, IdentityProvider};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct RuleQuery {
    #[serde(default)]
    pub include_disabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct RuleBody {
    pub id: Option<String>,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub category: String,
    pub severity: AlertSeverity,
    pub condition: AlertCondition,
    pub evaluation_interval_seconds: u64,
    pub evaluation_window_seconds: u64,
    pub minimum_data_points: usize,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub notification_channels: Vec<String>,
    #[serde(default)]
    pub suppression_rules: Vec<SuppressionRule>,
}

fn default_enabled() -> bool {
    true
}

impl RuleBody {
    fn into_rule(self, id: String) -> AlertRule {
        let now = Utc::now();
        AlertRule {
            id,
            name: self.name,
            enabled: self.enabled,
            category: self.category,
            severity: self.severity,
            condition: self.condition,
            evaluation_interval_seconds: self.evaluation_interval_seconds,
            evaluation_window_seconds: self.evaluation_window_seconds,
            minimum_data_points: self.minimum_data_points,
            tags: self.tags,
            notification_channels: self.notification_channels,
            suppression_rules: self.suppression_rules,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

async fn require_system_manage(state: &AppState, auth: &AuthContext) -> Result<(), ApiError> {
    if state
        .auth
        .has_permission(auth.user_id, "system", "manage")
        .await?
    {
        Ok(())
    } else {
        Err(ApiError(Error::permission_denied("system.manage")))
    }
}

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<RuleQuery>,
) -> Result<Json<Vec<AlertRule>>, ApiError> {
    Ok(Json(state.rules.list_rules(params.include_disabled).await?))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AlertRule>, ApiError> {
    Ok(Json(state.rules.get_rule(&id).await?))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<RuleBody>,
) -> Result<Json<AlertRule>, ApiError> {
    require_system_manage(&state, &auth).await?;
    let id = body
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let rule = state.rules.create_rule(body.into_rule(id)).await?;
    Ok(Json(rule))
}

pub async fn update(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<RuleBody>,
) -> Result<Json<AlertRule>, ApiError> {
    require_system_manage(&state, &auth).await?;
    let rule = state.rules.update_rule(body.into_rule(id)).await?;
    Ok(Json(rule))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    require_system_manage(&state, &auth).await?;
    state.rules.delete_rule(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn enable(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<AlertRule>, ApiError> {
    require_system_manage(&state, &auth).await?;
    Ok(Json(state.rules.set_enabled(&id, true).await?))
}

pub async fn disable(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<AlertRule>, ApiError> {
    require_system_manage(&state, &auth).await?;
    Ok(Json(state.rules.set_enabled(&id, false).await?))
}

pub async fn duplicate(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<AlertRule>, ApiError> {
    require_system_manage(&state, &auth).await?;
    Ok(Json(state.rules.duplicate_rule(&id).await?))
}

/// Evaluate a rule once against live metrics without persisting anything.
pub async fn test(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let rule = state.rules.get_rule(&id).await?;
    let to = Utc::now();
    let from = to - chrono::Duration::seconds(rule.evaluation_window_seconds as i64);
    let samples = state
        .metrics
        .query_range(&rule.condition.metric, from, to, &rule.condition.filters)
        .await?;

    let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    let aggregated = aggregate(&values, rule.condition.aggregation);
    let would_fire = aggregated
        .map(|value| {
            samples.len() >= rule.minimum_data_points
                && rule.condition.operator.evaluate(value, rule.condition.threshold)
        })
        .unwrap_or(false);

    Ok(Json(json!({
        "rule_id": rule.id,
        "samples": samples.len(),
        "aggregated_value": aggregated,
        "threshold": rule.condition.threshold,
        "would_fire": would_fire,
    })))
}
