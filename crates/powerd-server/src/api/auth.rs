//! Login endpoint.

use crate::errors::ApiError;
use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use powerd_core::IdentityProvider;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let outcome = state
        .auth
        .authenticate(&request.username, &request.password)
        .await?;

    if !outcome.success {
        let body = Json(json!({
            "error": outcome.error.unwrap_or_else(|| "authentication failed".to_string()),
            "status": StatusCode::UNAUTHORIZED.as_u16(),
        }));
        return Ok((StatusCode::UNAUTHORIZED, body).into_response());
    }

    Ok(Json(outcome).into_response())
}
