//! Identity and authorization port consumed by the engines.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resource/action pairs checked by engine operations.
pub mod permissions {
    pub const DEPLOYMENT_CREATE: (&str, &str) = ("deployment", "create");
    pub const DEPLOYMENT_EXECUTE: (&str, &str) = ("deployment", "execute");
    pub const DEPLOYMENT_VIEW: (&str, &str) = ("deployment", "view");
    pub const SERVICE_MANAGE: (&str, &str) = ("service", "manage");
    pub const SERVER_MANAGE: (&str, &str) = ("server", "manage");
    pub const SYSTEM_MANAGE: (&str, &str) = ("system", "manage");
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
    pub roles: Vec<String>,
}

/// Outcome of an authentication attempt. Failed credentials are a normal
/// outcome, not an `Err`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthOutcome {
    pub success: bool,
    pub user: Option<UserSummary>,
    pub error: Option<String>,
    pub tokens: Option<TokenPair>,
}

impl AuthOutcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            user: None,
            error: Some(reason.into()),
            tokens: None,
        }
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> Result<AuthOutcome>;

    async fn has_permission(&self, user_id: Uuid, resource: &str, action: &str) -> Result<bool>;

    async fn get_user_roles(&self, user_id: Uuid) -> Result<Vec<String>>;
}
