//! Bearer-token authentication middleware.

use crate::errors::ApiError;
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use powerd_core::Error;
use uuid::Uuid;

/// Acting user resolved from the access token; inserted into request
/// extensions for handlers.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub username: String,
    pub roles: Vec<String>,
}

pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError(Error::permission_denied("missing bearer token")))?;

    let claims = state.auth.verify_token(token)?;
    let user_id = Uuid::parse_str(&claims.sub)
        .map_err(|_| Error::permission_denied("malformed token subject"))?;

    request.extensions_mut().insert(AuthContext {
        user_id,
        username: claims.username,
        roles: claims.roles,
    });
    Ok(next.run(request).await)
}
